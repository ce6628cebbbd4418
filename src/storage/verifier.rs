use std::collections::HashSet;
use std::fs::OpenOptions;
use std::os::unix::fs::FileExt;
use std::path::Path;

use memmap2::Mmap;

use crate::core::error::Result;
use crate::core::types::{DocumentId, GlobalId};
use crate::storage::layout::{
    DataLocation, DocumentPart, FILE_HEADER_SIZE, FileHeader, FileInfo, META_SLOT_SIZE, MetaSlot,
    SECTOR_SIZE, align_up, decode_body_chunk, decode_header_chunk, xor_fold_checksums,
};

#[derive(Debug, Clone, Copy)]
pub struct VerifyFlags {
    pub verify_header_data: bool,
    pub verify_body_data: bool,
}

impl Default for VerifyFlags {
    fn default() -> Self {
        VerifyFlags { verify_header_data: true, verify_body_data: true }
    }
}

/// Findings of a verify pass. An empty message list means the file was
/// healthy.
#[derive(Debug, Default)]
pub struct VerifyReport {
    pub messages: Vec<String>,
    pub file_deleted: bool,
    pub repaired: bool,
}

impl VerifyReport {
    pub fn ok(&self) -> bool {
        self.messages.is_empty()
    }

    fn add(&mut self, path: &Path, message: String) {
        log::warn!("verify({}): {}", path.display(), message);
        self.messages.push(message);
    }
}

/// Check a slot file on disk: header checksum, metadata table walk,
/// bounds, optional data CRCs, overlaps and duplicate timestamps, in that
/// order. With `repair` the surviving slots are written back as the new
/// metadata table; a bad header deletes the file.
pub fn verify(path: impl AsRef<Path>, repair: bool, flags: VerifyFlags) -> Result<VerifyReport> {
    let path = path.as_ref();
    let mut report = VerifyReport::default();
    let file = OpenOptions::new().read(true).write(true).open(path)?;
    let file_size = file.metadata()?.len();

    if file_size < FILE_HEADER_SIZE as u64 {
        report.add(path, format!(
            "File was only {} B long and cannot be valid. Delete file to repair.",
            file_size
        ));
        if repair {
            drop(file);
            std::fs::remove_file(path)?;
            report.file_deleted = true;
        }
        return Ok(report);
    }

    let map = unsafe { Mmap::map(&file)? };
    let header = match FileHeader::decode(&map) {
        Ok(header) => header,
        Err(e) => {
            report.add(path, e.context);
            return Ok(report);
        }
    };
    if !header.verify() {
        report.add(path, format!(
            "Header checksum mismatch. Was {:#x}, stored {:#x}",
            header.calc_checksum(),
            header.header_checksum
        ));
        if repair {
            drop(map);
            drop(file);
            std::fs::remove_file(path)?;
            report.file_deleted = true;
        }
        return Ok(report);
    }
    let info = FileInfo::from_header(&header, file_size);
    if info.body_block_start() as u64 > file_size {
        report.add(path, format!(
            "Header indicates file is bigger than it physically is ({} > {})",
            info.body_block_start(),
            file_size
        ));
        if repair {
            drop(map);
            drop(file);
            std::fs::remove_file(path)?;
            report.file_deleted = true;
        }
        return Ok(report);
    }

    // Metadata table walk.
    let mut slots: Vec<MetaSlot> = Vec::new();
    let mut found_unused = false;
    let mut reported_used_after_unused = false;
    let mut wrong_order = false;
    let mut last_timestamp = None;
    for i in 0..header.meta_count {
        let offset = (FILE_HEADER_SIZE + i * META_SLOT_SIZE) as usize;
        let slot = MetaSlot::decode(&map[offset..offset + META_SLOT_SIZE as usize])?;
        if !slot.verify_checksum() {
            report.add(path, format!(
                "Slot {} at timestamp {} failed checksum verification",
                i, slot.timestamp
            ));
            continue;
        }
        if !slot.in_use() {
            found_unused = true;
            continue;
        }
        if found_unused && !reported_used_after_unused {
            report.add(path, format!("Slot {} found after unused entries", i));
            reported_used_after_unused = true;
        }
        if let Some(last) = last_timestamp {
            if slot.timestamp < last {
                wrong_order = true;
                report.add(path, format!(
                    "Slot {} is out of timestamp order ({} <= {})",
                    i, slot.timestamp, last
                ));
            }
        }
        last_timestamp = Some(slot.timestamp);
        slots.push(slot);
    }
    if header.file_checksum != xor_fold_checksums(slots.iter()) {
        report.add(path, format!(
            "File checksum should have been {:#x} according to metadata found, but is set to {:#x}",
            xor_fold_checksums(slots.iter()),
            header.file_checksum
        ));
    }
    if wrong_order {
        slots.sort_by_key(|s| s.timestamp);
    }

    verify_in_bounds(path, &info, DocumentPart::Header, &mut slots, &mut report);
    verify_in_bounds(path, &info, DocumentPart::Body, &mut slots, &mut report);

    if flags.verify_header_data {
        verify_data_block(path, &map, &info, DocumentPart::Header, &mut slots, &mut report);
    }
    if flags.verify_body_data {
        verify_data_block(path, &map, &info, DocumentPart::Body, &mut slots, &mut report);
    }

    // Overlaps last: a slot pointing at a bad document may already have
    // been removed, clearing the overlap.
    verify_non_overlap(path, DocumentPart::Header, &mut slots, &mut report);
    verify_non_overlap(path, DocumentPart::Body, &mut slots, &mut report);
    verify_unique_timestamps(path, &mut slots, &mut report);

    if !report.ok() && repair {
        let survivors = slots;
        for slot in &survivors {
            debug_assert!(slot.verify_checksum());
        }
        let mut new_header = header;
        new_header.file_checksum = xor_fold_checksums(survivors.iter());
        new_header.update_checksum();
        let mut region = Vec::new();
        region.extend_from_slice(&new_header.encode());
        for i in 0..header.meta_count as usize {
            let slot = survivors.get(i).copied().unwrap_or_default();
            region.extend_from_slice(&slot.encode());
        }
        // Echo the header-block bytes sharing the last metadata sector.
        let aligned = align_up(region.len() as u32, SECTOR_SIZE) as usize;
        region.extend_from_slice(&map[region.len()..aligned]);
        drop(map);
        file.write_all_at(&region, 0)?;
        file.sync_data()?;
        report.repaired = true;
        log::warn!("verify({}): errors repaired", path.display());
    }
    Ok(report)
}

fn verify_in_bounds(
    path: &Path,
    info: &FileInfo,
    part: DocumentPart,
    slots: &mut Vec<MetaSlot>,
    report: &mut VerifyReport,
) {
    let block_size = info.block_size(part);
    let min_size = match part {
        DocumentPart::Header => 12,
        DocumentPart::Body => 0,
    };
    slots.retain(|slot| {
        let loc = slot.location(part);
        if loc.size != 0 && loc.size < min_size {
            report.add(path, format!(
                "{} of slot at timestamp {} is too small to be valid",
                part.name(),
                slot.timestamp
            ));
            false
        } else if part == DocumentPart::Header && loc.size == 0 {
            report.add(path, format!(
                "Slot at timestamp {} has no header chunk",
                slot.timestamp
            ));
            false
        } else if loc.size != 0
            && (loc.pos >= block_size
                || loc.pos.checked_add(loc.size).is_none_or(|end| end > block_size))
        {
            report.add(path, format!(
                "{} of slot at timestamp {} goes out of bounds (block size {})",
                part.name(),
                slot.timestamp,
                block_size
            ));
            false
        } else if loc.size == 0 && loc.pos != 0 {
            report.add(path, format!(
                "{} of slot at timestamp {} has size 0 but is not positioned at 0",
                part.name(),
                slot.timestamp
            ));
            false
        } else {
            true
        }
    });
}

fn verify_data_block(
    path: &Path,
    map: &Mmap,
    info: &FileInfo,
    part: DocumentPart,
    slots: &mut Vec<MetaSlot>,
    report: &mut VerifyReport,
) {
    let block_start = info.block_start(part) as usize;
    slots.retain(|slot| {
        let loc = slot.location(part);
        if loc.is_empty() {
            return true;
        }
        let data = &map[block_start + loc.pos as usize..block_start + loc.end() as usize];
        match part {
            DocumentPart::Header => match decode_header_chunk(data) {
                Ok((_blob, doc_id)) => {
                    let gid = GlobalId::from_document_id(&DocumentId::new(doc_id));
                    if gid != slot.gid {
                        report.add(path, format!(
                            "Slot at timestamp {} has gid {} but its header block contains \
                             document id {} with {}",
                            slot.timestamp, slot.gid, doc_id, gid
                        ));
                        false
                    } else {
                        true
                    }
                }
                Err(e) => {
                    report.add(path, format!(
                        "Header verification failed for slot at timestamp {}: {}",
                        slot.timestamp, e.context
                    ));
                    false
                }
            },
            DocumentPart::Body => match decode_body_chunk(data) {
                Ok(_) => true,
                Err(e) => {
                    report.add(path, format!(
                        "Body verification failed for slot at timestamp {}: {}",
                        slot.timestamp, e.context
                    ));
                    false
                }
            },
        }
    });
}

/// Slots pointing into overlapping byte ranges of the same block are all
/// dropped, unless they sit at the identical location and share a gid
/// (legal content addressing).
fn verify_non_overlap(
    path: &Path,
    part: DocumentPart,
    slots: &mut Vec<MetaSlot>,
    report: &mut VerifyReport,
) {
    let mut order: Vec<usize> = (0..slots.len()).collect();
    order.sort_by_key(|i| {
        let loc = slots[*i].location(part);
        (loc.pos, loc.size)
    });

    let mut failed: HashSet<usize> = HashSet::new();
    let mut local: Vec<usize> = Vec::new();
    let mut last = DataLocation::default();

    let mut check_same_position = |local: &[usize], failed: &mut HashSet<usize>,
                                   report: &mut VerifyReport| {
        if local.len() < 2 {
            return;
        }
        let gid = slots[local[0]].gid;
        if local.iter().any(|i| slots[*i].gid != gid) {
            report.add(path, format!(
                "Multiple slots with different gids use same {} position; repairing deletes \
                 all {} slots using it",
                part.name(),
                local.len()
            ));
            failed.extend(local.iter().copied());
        }
    };

    for idx in order {
        let loc = slots[idx].location(part);
        if loc.size == 0 {
            continue;
        }
        if loc.pos == last.pos && loc.size == last.size {
            local.push(idx);
        } else if loc.pos < last.end() {
            report.add(path, format!(
                "{} of slot at timestamp {} overlaps with other slots",
                part.name(),
                slots[idx].timestamp
            ));
            failed.extend(local.iter().copied());
            failed.insert(idx);
            local.clear();
            last = loc;
        } else {
            check_same_position(&local, &mut failed, report);
            local.clear();
            local.push(idx);
            last = loc;
        }
    }
    check_same_position(&local, &mut failed, report);

    if !failed.is_empty() {
        let mut keep_idx = 0usize;
        slots.retain(|_| {
            let keep = !failed.contains(&keep_idx);
            keep_idx += 1;
            keep
        });
    }
}

/// Duplicate timestamps are a corruption; the first slot wins.
fn verify_unique_timestamps(path: &Path, slots: &mut Vec<MetaSlot>, report: &mut VerifyReport) {
    let mut last = None;
    slots.retain(|slot| {
        if last == Some(slot.timestamp) {
            report.add(path, format!(
                "Multiple slots at timestamp {}; dropping duplicates",
                slot.timestamp
            ));
            false
        } else {
            last = Some(slot.timestamp);
            true
        }
    });
}
