use std::collections::{BTreeSet, HashMap};
use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};

use crate::core::config::SlotFileConfig;
use crate::core::error::{Error, ErrorKind, Result};
use crate::core::types::{Document, DocumentId, Timestamp};
use crate::storage::cache::FileCache;
use crate::storage::layout::{
    DataLocation, DocumentPart, FILE_HEADER_SIZE, FileHeader, FileInfo, META_SLOT_SIZE, MetaSlot,
    SECTOR_SIZE, SLOT_BODY_LZ4, SLOT_BODY_ZSTD, SLOT_IN_USE, align_up, decode_body_chunk,
    decode_header_chunk, encode_body_chunk, encode_header_chunk, verify_chunk,
    xor_fold_checksums,
};
use crate::storage::planner::{plan_reads, total_read_size};
use crate::storage::unique_slots::UniqueSlotGenerator;
use crate::storage::writer::{BufferedFileWriter, WriteCache};

/// Outcome of the fast-path flush attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartialWriteResult {
    ChangesWritten,
    Unaltered,
    /// More live slots than persisted meta entries.
    TooFewMetaEntries,
    /// Pending bytes do not fit in the trailing free space.
    TooSmall,
    /// Utilisation dropped below the configured fill rate.
    TooLarge,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushOutcome {
    Unaltered,
    PartialWritten,
    Rewritten(PartialWriteResult),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compression {
    None,
    Lz4,
    Zstd,
}

/// Chunks not yet assigned a disk position get key positions in this
/// range; a flush replaces them with real block offsets.
const VIRTUAL_POS_BASE: u32 = 0x8000_0000;

/// One content-addressed slot file holding every version of the documents
/// of one bucket, ordered by strictly increasing timestamp.
#[derive(Debug)]
pub struct SlotFile {
    path: PathBuf,
    file: File,
    config: SlotFileConfig,
    info: FileInfo,
    slots: Vec<MetaSlot>,
    cache: FileCache,
    slots_altered: bool,
    needs_repair: bool,
    next_virtual_pos: u32,
}

impl SlotFile {
    /// Create a new, empty slot file on disk.
    pub fn create(path: impl AsRef<Path>, config: SlotFileConfig) -> Result<SlotFile> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(&path)?;
        let mut slot_file = SlotFile {
            path,
            file,
            config,
            info: FileInfo::default(),
            slots: Vec::new(),
            cache: FileCache::new(),
            slots_altered: true,
            needs_repair: false,
            next_virtual_pos: VIRTUAL_POS_BASE,
        };
        slot_file.rewrite_file()?;
        Ok(slot_file)
    }

    /// Open and load an existing file. Slots failing validation are left
    /// out but the good ones stay exposed; `needs_repair()` reports that a
    /// verify/repair pass is owed.
    pub fn open(path: impl AsRef<Path>, config: SlotFileConfig) -> Result<SlotFile> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new().read(true).write(true).open(&path)?;
        let file_size = file.metadata()?.len();

        let mut buffer = vec![0u8; (config.initial_index_read as u64).min(file_size) as usize];
        file.read_exact_at(&mut buffer, 0)?;
        let header = FileHeader::decode(&buffer)?;
        if !header.verify() {
            return Err(Error::corruption(format!(
                "header checksum mismatch in {}: stored {:#x}, calculated {:#x}",
                path.display(),
                header.header_checksum,
                header.calc_checksum()
            )));
        }
        let header_block_index = FILE_HEADER_SIZE + header.meta_count * META_SLOT_SIZE;
        let first_aligned = align_up(header_block_index, SECTOR_SIZE);
        if (first_aligned as u64) > file_size {
            return Err(Error::corruption(format!(
                "header indicates file is bigger than it physically is ({} > {})",
                first_aligned, file_size
            )));
        }
        if buffer.len() < first_aligned as usize {
            let old_len = buffer.len();
            buffer.resize(first_aligned as usize, 0);
            file.read_exact_at(&mut buffer[old_len..], old_len as u64)?;
        }

        let mut info = FileInfo::from_header(&header, file_size);
        info.first_header_bytes =
            buffer[header_block_index as usize..first_aligned as usize].to_vec();
        let header_block_offset = info.header_block_start();
        let body_block_offset = info.body_block_start();

        let mut slots = Vec::new();
        let mut needs_repair = false;
        for i in 0..header.meta_count {
            let offset = (FILE_HEADER_SIZE + i * META_SLOT_SIZE) as usize;
            let slot = MetaSlot::decode(&buffer[offset..offset + META_SLOT_SIZE as usize])?;
            let in_bounds = (header_block_offset as u64
                + slot.header_pos as u64
                + slot.header_size as u64)
                <= file_size
                && (body_block_offset as u64 + slot.body_pos as u64 + slot.body_size as u64)
                    <= file_size;
            if !slot.verify_checksum() || !in_bounds {
                log::warn!(
                    "{}: bad slot at index {}, deferring repair",
                    path.display(),
                    i
                );
                needs_repair = true;
                continue;
            }
            if !slot.in_use() {
                break;
            }
            slots.push(slot);
        }

        Ok(SlotFile {
            path,
            file,
            config,
            info,
            slots,
            cache: FileCache::new(),
            slots_altered: false,
            needs_repair,
            next_virtual_pos: VIRTUAL_POS_BASE,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn config(&self) -> &SlotFileConfig {
        &self.config
    }

    pub fn info(&self) -> &FileInfo {
        &self.info
    }

    pub fn slots(&self) -> &[MetaSlot] {
        &self.slots
    }

    pub fn needs_repair(&self) -> bool {
        self.needs_repair
    }

    pub fn slots_altered(&self) -> bool {
        self.slots_altered
    }

    fn alloc_virtual(&mut self, size: u32) -> DataLocation {
        let loc = DataLocation::new(self.next_virtual_pos, size);
        self.next_virtual_pos = self.next_virtual_pos.wrapping_add(size.max(1));
        loc
    }

    /// Append a document version. Timestamps must be unique; equal stamps
    /// are a corruption the verifier would repair away.
    pub fn put(
        &mut self,
        timestamp: Timestamp,
        doc: &Document,
        body_blob: &[u8],
        compression: Compression,
    ) -> Result<()> {
        let header_blob = bincode::serialize(doc)?;
        let header_chunk = encode_header_chunk(&header_blob, doc.id.as_str());
        let mut flags = SLOT_IN_USE;
        let body_chunk = if body_blob.is_empty() {
            None
        } else {
            let stored = match compression {
                Compression::None => body_blob.to_vec(),
                Compression::Lz4 => {
                    flags |= SLOT_BODY_LZ4;
                    lz4_flex::compress_prepend_size(body_blob)
                }
                Compression::Zstd => {
                    flags |= SLOT_BODY_ZSTD;
                    zstd::stream::encode_all(body_blob, 0)
                        .map_err(|e| Error::new(ErrorKind::Internal, e.to_string()))?
                }
            };
            Some(encode_body_chunk(&stored))
        };

        let idx = match self.slots.binary_search_by_key(&timestamp, |s| s.timestamp) {
            Ok(_) => {
                return Err(Error::new(
                    ErrorKind::InvalidArgument,
                    format!("duplicate timestamp {}", timestamp),
                ));
            }
            Err(idx) => idx,
        };

        let header_loc = self.alloc_virtual(header_chunk.len() as u32);
        self.cache
            .insert_data(DocumentPart::Header, header_loc, header_chunk, false);
        let body_loc = match body_chunk {
            Some(chunk) => {
                let loc = self.alloc_virtual(chunk.len() as u32);
                self.cache.insert_data(DocumentPart::Body, loc, chunk, false);
                loc
            }
            None => DataLocation::default(),
        };

        let mut slot = MetaSlot {
            timestamp,
            gid: doc.global_id(),
            flags,
            ..MetaSlot::default()
        };
        slot.set_location(DocumentPart::Header, header_loc);
        slot.set_location(DocumentPart::Body, body_loc);
        slot.update_checksum();
        self.slots.insert(idx, slot);
        self.slots_altered = true;
        Ok(())
    }

    /// Append a remove marker. With `default_remove_doc_type` configured a
    /// backwards-compatible empty body is written alongside.
    pub fn remove(&mut self, timestamp: Timestamp, doc_id: &DocumentId) -> Result<()> {
        let doc = Document::new(doc_id.clone());
        let body: Vec<u8> = if self.config.default_remove_doc_type.is_empty() {
            Vec::new()
        } else {
            bincode::serialize(&Document::new(DocumentId::new(format!(
                "id:remove:{}::{}",
                self.config.default_remove_doc_type,
                doc_id.as_str()
            ))))?
        };
        self.put(timestamp, &doc, &body, Compression::None)?;
        if let Ok(idx) = self.slots.binary_search_by_key(&timestamp, |s| s.timestamp) {
            self.slots[idx].flags |= crate::storage::layout::SLOT_REMOVE_ENTRY;
            self.slots[idx].update_checksum();
        }
        Ok(())
    }

    /// Make sure every given location of `part` is in the cache, reading
    /// through with coalesced 512-aligned preads where needed.
    pub fn ensure_cached(&mut self, part: DocumentPart, locations: &[DataLocation]) -> Result<()> {
        let block_start = self.info.block_start(part);
        let cache = &self.cache;
        let operations = plan_reads(
            &|loc| cache.is_cached(part, loc),
            locations,
            self.config.max_read_gap,
            block_start,
        );
        if operations.is_empty() {
            return Ok(());
        }
        let total = total_read_size(&operations);
        debug_assert_eq!(total % SECTOR_SIZE, 0);
        let mut buffer = vec![0u8; total as usize];
        let mut cursor = 0usize;
        let mut op_offsets = Vec::with_capacity(operations.len());
        for op in &operations {
            self.file
                .read_exact_at(&mut buffer[cursor..cursor + op.size as usize], op.pos as u64)?;
            op_offsets.push(cursor as u32);
            cursor += op.size as usize;
        }
        let buffer_id = self.cache.add_buffer(buffer);

        for loc in locations {
            if loc.size == 0 || self.cache.is_cached(part, *loc) {
                continue;
            }
            let abs = DataLocation::new(loc.pos + block_start, loc.size);
            let mut found = false;
            for (op, op_offset) in operations.iter().zip(&op_offsets) {
                if op.contains(&abs) {
                    let offset = op_offset + (abs.pos - op.pos);
                    self.cache.cache_location(part, *loc, buffer_id, offset, true);
                    found = true;
                    break;
                }
            }
            if !found {
                return Err(Error::new(
                    ErrorKind::Internal,
                    format!("read plan missed location ({}, {})", loc.pos, loc.size),
                ));
            }
            let data = self.cache.get(part, *loc).expect("just cached");
            verify_chunk(part, data).map_err(|e| {
                Error::corruption(format!(
                    "{}: {} at ({}, {}): {}",
                    self.path.display(),
                    part.name(),
                    loc.pos,
                    loc.size,
                    e.context
                ))
            })?;
        }
        Ok(())
    }

    /// Decode the document stored in a slot's header chunk.
    pub fn get_document(&mut self, slot_idx: usize) -> Result<Document> {
        let loc = self.slots[slot_idx].location(DocumentPart::Header);
        self.ensure_cached(DocumentPart::Header, &[loc])?;
        let chunk = self
            .cache
            .get(DocumentPart::Header, loc)
            .ok_or_else(|| Error::new(ErrorKind::Internal, "header chunk not cached"))?;
        let (blob, _doc_id) = decode_header_chunk(chunk)?;
        Ok(bincode::deserialize(blob)?)
    }

    /// Document id stored in a slot's header chunk, without decoding the
    /// document blob.
    pub fn get_document_id(&mut self, slot_idx: usize) -> Result<DocumentId> {
        let loc = self.slots[slot_idx].location(DocumentPart::Header);
        self.ensure_cached(DocumentPart::Header, &[loc])?;
        let chunk = self
            .cache
            .get(DocumentPart::Header, loc)
            .ok_or_else(|| Error::new(ErrorKind::Internal, "header chunk not cached"))?;
        let (_blob, doc_id) = decode_header_chunk(chunk)?;
        Ok(DocumentId::new(doc_id))
    }

    /// Read and decompress a slot's body blob; empty for body-less slots.
    pub fn read_body(&mut self, slot_idx: usize) -> Result<Vec<u8>> {
        let slot = self.slots[slot_idx];
        let loc = slot.location(DocumentPart::Body);
        if loc.is_empty() {
            return Ok(Vec::new());
        }
        self.ensure_cached(DocumentPart::Body, &[loc])?;
        let chunk = self
            .cache
            .get(DocumentPart::Body, loc)
            .ok_or_else(|| Error::new(ErrorKind::Internal, "body chunk not cached"))?;
        let stored = decode_body_chunk(chunk)?;
        if slot.flags & SLOT_BODY_LZ4 != 0 {
            lz4_flex::decompress_size_prepended(stored)
                .map_err(|e| Error::corruption(format!("lz4 body: {}", e)))
        } else if slot.flags & SLOT_BODY_ZSTD != 0 {
            zstd::stream::decode_all(stored)
                .map_err(|e| Error::corruption(format!("zstd body: {}", e)))
        } else {
            Ok(stored.to_vec())
        }
    }

    fn persisted_locations(&self, part: DocumentPart) -> Vec<DataLocation> {
        let mut set = BTreeSet::new();
        for slot in &self.slots {
            let loc = slot.location(part);
            if !loc.is_empty() && loc.pos < VIRTUAL_POS_BASE {
                set.insert(loc);
            }
        }
        set.into_iter().collect()
    }

    fn pending_locations(&self, part: DocumentPart) -> Vec<DataLocation> {
        let mut set = BTreeSet::new();
        for slot in &self.slots {
            let loc = slot.location(part);
            if !loc.is_empty() && loc.pos >= VIRTUAL_POS_BASE {
                set.insert(loc);
            }
        }
        set.into_iter().collect()
    }

    /// Serialise the header and metadata table (with refreshed checksums)
    /// for the current geometry.
    fn encode_meta_region(&mut self) -> Vec<u8> {
        for slot in &mut self.slots {
            slot.update_checksum();
        }
        let mut header = FileHeader::new(self.info.meta_count, self.info.header_block_size);
        header.file_checksum = xor_fold_checksums(self.slots.iter());
        header.update_checksum();

        let mut out =
            Vec::with_capacity((FILE_HEADER_SIZE + self.info.meta_count * META_SLOT_SIZE) as usize);
        out.extend_from_slice(&header.encode());
        for i in 0..self.info.meta_count as usize {
            let slot = self.slots.get(i).copied().unwrap_or_default();
            out.extend_from_slice(&slot.encode());
        }
        out
    }

    /// Fast-path flush: write pending chunks into the blocks' trailing free
    /// space. Never changes the file size;
    /// falls back by reporting why it cannot run.
    pub fn try_partial_flush(&mut self) -> Result<PartialWriteResult> {
        if self.slots.len() > self.info.meta_count as usize {
            log::debug!(
                "{}: {} slots exceed {} persisted meta entries",
                self.path.display(),
                self.slots.len(),
                self.info.meta_count
            );
            return Ok(PartialWriteResult::TooFewMetaEntries);
        }

        let mut bytes_to_write = [0u32; 2];
        let mut max_used_extent = [0u32; 2];
        let mut total_space_used = [0u32; 2];
        for part in DocumentPart::ALL {
            let p = part as usize;
            for loc in self.pending_locations(part) {
                bytes_to_write[p] += loc.size;
            }
            bytes_to_write[p] = align_up(bytes_to_write[p], SECTOR_SIZE);
            for loc in self.persisted_locations(part) {
                total_space_used[p] += loc.size;
                max_used_extent[p] = max_used_extent[p].max(loc.end());
            }
            debug_assert!(max_used_extent[p] <= self.info.block_size(part));
            max_used_extent[p] = align_up(max_used_extent[p], SECTOR_SIZE);
            let free = self.info.block_size(part).saturating_sub(max_used_extent[p]);
            if max_used_extent[p] > self.info.block_size(part) || bytes_to_write[p] > free {
                log::debug!(
                    "{}: {} block has {} free bytes, needs {}; rewriting",
                    self.path.display(),
                    part.name(),
                    free,
                    bytes_to_write[p]
                );
                return Ok(PartialWriteResult::TooSmall);
            }
        }

        let mut used_space = FILE_HEADER_SIZE as f64
            + META_SLOT_SIZE as f64
                * self.slots.len() as f64
                * self.config.overrepresent_meta_data_factor
            + total_space_used[0] as f64 * self.config.overrepresent_header_block_factor
            + total_space_used[1] as f64
            + bytes_to_write[0] as f64
            + bytes_to_write[1] as f64;
        used_space = align_up(used_space as u32, self.config.file_block_size) as f64;
        used_space = align_up(used_space as u32, self.config.minimum_file_size) as f64;
        if used_space / (self.info.file_size() as f64) < self.config.min_fill_rate as f64 {
            log::debug!(
                "{}: fill rate below {}, resizing to become smaller",
                self.path.display(),
                self.config.min_fill_rate
            );
            return Ok(PartialWriteResult::TooLarge);
        }

        if !self.slots_altered {
            debug_assert_eq!(bytes_to_write, [0, 0]);
            return Ok(PartialWriteResult::Unaltered);
        }

        let mut writer = BufferedFileWriter::new(&self.file, 1024 * 1024);
        let mut moves: [HashMap<DataLocation, DataLocation>; 2] =
            [HashMap::new(), HashMap::new()];
        for part in DocumentPart::ALL {
            let p = part as usize;
            let block_start = self.info.block_start(part);
            let real_pos = align_up(block_start + max_used_extent[p], SECTOR_SIZE);
            writer.set_file_position(real_pos)?;
            let mut rel_pos = real_pos - block_start;
            for loc in self.pending_locations(part) {
                let data = self
                    .cache
                    .get(part, loc)
                    .ok_or_else(|| Error::new(ErrorKind::Internal, "pending chunk not cached"))?
                    .to_vec();
                writer.write(&data)?;
                moves[p].insert(loc, DataLocation::new(rel_pos, loc.size));
                rel_pos += loc.size;
            }
            let pos = writer.file_position();
            writer.write_garbage(align_up(pos, SECTOR_SIZE) - pos)?;
        }
        writer.flush()?;
        drop(writer);

        for part in DocumentPart::ALL {
            let p = part as usize;
            for slot in &mut self.slots {
                let loc = slot.location(part);
                if let Some(new_loc) = moves[p].get(&loc) {
                    slot.set_location(part, *new_loc);
                }
            }
            for (old, new) in &moves[p] {
                self.cache.persist(part, *old, *new);
            }
        }
        // Data is already on disk; now the metadata table, then the header
        // prefix, so readers seeing a stale header see an older but
        // consistent view.
        let meta = self.encode_meta_region();
        self.file
            .write_all_at(&meta[FILE_HEADER_SIZE as usize..], FILE_HEADER_SIZE as u64)?;
        self.file
            .write_all_at(&self.info.first_header_bytes, meta.len() as u64)?;
        self.file.write_all_at(&meta[..FILE_HEADER_SIZE as usize], 0)?;
        self.file.sync_data()?;
        self.slots_altered = false;
        Ok(PartialWriteResult::ChangesWritten)
    }

    /// Flush changes: partial write when possible, full rewrite otherwise.
    pub fn flush(&mut self) -> Result<FlushOutcome> {
        match self.try_partial_flush()? {
            PartialWriteResult::ChangesWritten => Ok(FlushOutcome::PartialWritten),
            PartialWriteResult::Unaltered => Ok(FlushOutcome::Unaltered),
            reason => {
                self.rewrite_file()?;
                Ok(FlushOutcome::Rewritten(reason))
            }
        }
    }

    fn wanted_meta_count(&self) -> Result<u32> {
        let used = self.slots.len() as u32;
        let wanted = (used as f64
            * self.config.grow_factor
            * self.config.overrepresent_meta_data_factor) as u32;
        let wanted = wanted.max(self.config.minimum_file_meta_slots);
        if wanted > self.config.maximum_file_meta_slots {
            if self.config.maximum_file_meta_slots >= used {
                return Ok(self.config.maximum_file_meta_slots);
            }
            return Err(Error::file_full(format!(
                "need {} slots but max slots is {}",
                used, self.config.maximum_file_meta_slots
            )));
        }
        Ok(wanted)
    }

    fn wanted_header_block_size(&self, min_bytes: u32, block_start: u32) -> Result<u32> {
        let wanted = (min_bytes as f64
            * self.config.grow_factor
            * self.config.overrepresent_header_block_factor) as u32;
        let mut wanted = wanted.max(self.config.minimum_file_header_block_size);
        if wanted > self.config.maximum_file_header_block_size {
            if self.config.maximum_file_header_block_size >= min_bytes {
                wanted = self.config.maximum_file_header_block_size;
            } else {
                return Err(Error::file_full(format!(
                    "need {} header bytes but max is {}",
                    min_bytes, self.config.maximum_file_header_block_size
                )));
            }
        }
        // Sized so that the block's end (the body block start) lands on a
        // 512-byte boundary; the block itself starts mid-sector after the
        // metadata table.
        Ok(align_up(wanted + block_start, SECTOR_SIZE) - block_start)
    }

    fn wanted_body_block_size(&self, min_bytes: u32, block_start: u32) -> Result<u32> {
        debug_assert_eq!(block_start % SECTOR_SIZE, 0);
        let mut wanted = (min_bytes as f64 * self.config.grow_factor) as u32;
        if wanted + block_start < self.config.minimum_file_size {
            wanted = self.config.minimum_file_size - block_start;
        }
        if wanted + block_start > self.config.maximum_file_size {
            if self.config.maximum_file_size >= min_bytes + block_start {
                wanted = self.config.maximum_file_size - block_start;
            } else {
                return Err(Error::file_full(format!(
                    "need {} body bytes but max file size is {} with body starting at {}",
                    min_bytes, self.config.maximum_file_size, block_start
                )));
            }
        }
        Ok(align_up(wanted + block_start, self.config.file_block_size) - block_start)
    }

    /// Slow-path flush: write everything to
    /// `<path>.new` with fresh geometry, dedup shared locations, then
    /// atomically rename over the original. Returns the file size delta.
    pub fn rewrite_file(&mut self) -> Result<i64> {
        // Everything still on disk must be in memory before the old file
        // is replaced.
        for part in DocumentPart::ALL {
            let persisted = self.persisted_locations(part);
            self.ensure_cached(part, &persisted)?;
        }
        let old_size = if self.info.meta_count == 0 { 0 } else { self.info.file_size() as i64 };

        let meta_count = self.wanted_meta_count()?;
        let new_path = {
            let mut os = self.path.clone().into_os_string();
            os.push(".new");
            PathBuf::from(os)
        };
        let new_file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&new_path)?;

        let header_block_start = FILE_HEADER_SIZE + meta_count * META_SLOT_SIZE;
        let mut echo = EchoCache::new(header_block_start);
        let unique = UniqueSlotGenerator::new(&self.slots);
        let mut moves: [HashMap<DataLocation, DataLocation>; 2] =
            [HashMap::new(), HashMap::new()];

        let result: Result<(u32, u32)> = (|| {
            let mut writer = BufferedFileWriter::new(&new_file, 1024 * 1024);
            writer.set_cache(&mut echo);
            let meta_region_size = FILE_HEADER_SIZE + meta_count * META_SLOT_SIZE;
            writer.write_garbage(meta_region_size)?;

            // Header block: write each distinct location once, in
            // first-seen timestamp order.
            let mut index = 0u32;
            for (loc, _slots) in unique.iter(DocumentPart::Header) {
                let data = self
                    .cache
                    .get(DocumentPart::Header, *loc)
                    .ok_or_else(|| Error::new(ErrorKind::Internal, "header chunk not cached"))?
                    .to_vec();
                writer.write(&data)?;
                moves[0].insert(*loc, DataLocation::new(index, loc.size));
                index += loc.size;
            }
            let header_block_size = self.wanted_header_block_size(index, header_block_start)?;
            writer.write_garbage(header_block_size - index)?;

            let body_block_start = header_block_start + header_block_size;
            let mut index = 0u32;
            for (loc, _slots) in unique.iter(DocumentPart::Body) {
                let data = self
                    .cache
                    .get(DocumentPart::Body, *loc)
                    .ok_or_else(|| Error::new(ErrorKind::Internal, "body chunk not cached"))?
                    .to_vec();
                writer.write(&data)?;
                moves[1].insert(*loc, DataLocation::new(index, loc.size));
                index += loc.size;
            }
            let body_block_size = self.wanted_body_block_size(index, body_block_start)?;
            writer.write_garbage(body_block_size - index)?;
            writer.flush()?;
            Ok((header_block_size, body_block_size))
        })();

        let (header_block_size, body_block_size) = match result {
            Ok(sizes) => sizes,
            Err(err) => {
                // Nothing of the original file was touched; discard .new.
                let _ = std::fs::remove_file(&new_path);
                return Err(err);
            }
        };

        for part in DocumentPart::ALL {
            let p = part as usize;
            for slot in &mut self.slots {
                let loc = slot.location(part);
                if let Some(new_loc) = moves[p].get(&loc) {
                    slot.set_location(part, *new_loc);
                }
            }
            self.cache.remap_and_persist_all(part, &moves[p]);
        }

        self.info = FileInfo::new(meta_count, header_block_size, body_block_size);
        self.info.first_header_bytes = echo.into_bytes();
        let meta = self.encode_meta_region();
        new_file.write_all_at(&meta, 0)?;
        new_file.write_all_at(&self.info.first_header_bytes, meta.len() as u64)?;
        new_file.sync_all()?;

        std::fs::rename(&new_path, &self.path)?;
        self.file = OpenOptions::new().read(true).write(true).open(&self.path)?;
        self.slots_altered = false;
        self.needs_repair = false;

        let delta = self.info.file_size() as i64 - old_size;
        log::debug!(
            "{}: rewrote file, size delta {} bytes",
            self.path.display(),
            delta
        );
        Ok(delta)
    }
}

/// Captures the header-block bytes sharing the metadata table's last
/// 512-byte sector, so later metadata writes can echo them back.
struct EchoCache {
    block_start: u32,
    bytes: Vec<u8>,
}

impl EchoCache {
    fn new(block_start: u32) -> Self {
        let aligned = align_up(block_start, SECTOR_SIZE);
        EchoCache {
            block_start,
            bytes: vec![0xff; (aligned - block_start) as usize],
        }
    }

    fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }
}

impl WriteCache for EchoCache {
    fn set_data(&mut self, data: &[u8], pos: u64) {
        let start = self.block_start as u64;
        let end = start + self.bytes.len() as u64;
        if pos >= end || pos + data.len() as u64 <= start {
            return;
        }
        let from = start.max(pos);
        let to = end.min(pos + data.len() as u64);
        let src = &data[(from - pos) as usize..(to - pos) as usize];
        self.bytes[(from - start) as usize..(to - start) as usize].copy_from_slice(src);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::FieldValue;
    use std::io::Read;

    fn test_config() -> SlotFileConfig {
        SlotFileConfig {
            minimum_file_meta_slots: 8,
            maximum_file_meta_slots: 1024,
            minimum_file_header_block_size: 2048,
            maximum_file_header_block_size: 1024 * 1024,
            minimum_file_size: 8192,
            maximum_file_size: 16 * 1024 * 1024,
            file_block_size: 512,
            initial_index_read: 4096,
            ..SlotFileConfig::default()
        }
    }

    fn doc(n: u32) -> Document {
        let mut doc = Document::new(DocumentId::new(format!("id:test:music::{}", n)));
        doc.add_field("title", FieldValue::Text(format!("song number {}", n)));
        doc
    }

    fn temp_path(dir: &tempfile::TempDir, name: &str) -> PathBuf {
        dir.path().join(name)
    }

    #[test]
    fn test_create_open_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = temp_path(&dir, "bucket.dat");
        {
            let mut sf = SlotFile::create(&path, test_config()).unwrap();
            sf.put(Timestamp(10), &doc(1), b"body one", Compression::None).unwrap();
            sf.put(Timestamp(20), &doc(2), b"body two", Compression::None).unwrap();
            sf.flush().unwrap();
        }
        let mut sf = SlotFile::open(&path, test_config()).unwrap();
        assert!(!sf.needs_repair());
        assert_eq!(sf.slots().len(), 2);
        assert_eq!(sf.get_document(0).unwrap(), doc(1));
        assert_eq!(sf.read_body(1).unwrap(), b"body two");
        assert_eq!(sf.get_document_id(1).unwrap(), DocumentId::new("id:test:music::2"));
    }

    #[test]
    fn test_compressed_bodies_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = temp_path(&dir, "bucket.dat");
        let body: Vec<u8> = (0..4096u32).map(|i| (i % 251) as u8).collect();
        {
            let mut sf = SlotFile::create(&path, test_config()).unwrap();
            sf.put(Timestamp(1), &doc(1), &body, Compression::Lz4).unwrap();
            sf.put(Timestamp(2), &doc(2), &body, Compression::Zstd).unwrap();
            sf.flush().unwrap();
        }
        let mut sf = SlotFile::open(&path, test_config()).unwrap();
        assert_eq!(sf.read_body(0).unwrap(), body);
        assert_eq!(sf.read_body(1).unwrap(), body);
    }

    #[test]
    fn test_duplicate_timestamp_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut sf = SlotFile::create(temp_path(&dir, "b.dat"), test_config()).unwrap();
        sf.put(Timestamp(5), &doc(1), b"", Compression::None).unwrap();
        let err = sf.put(Timestamp(5), &doc(2), b"", Compression::None).unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidArgument);
    }

    #[test]
    fn test_partial_write_keeps_file_size_and_old_positions() {
        let dir = tempfile::tempdir().unwrap();
        let path = temp_path(&dir, "bucket.dat");
        let mut sf = SlotFile::create(&path, test_config()).unwrap();
        sf.put(Timestamp(10), &doc(1), b"first body", Compression::None).unwrap();
        sf.flush().unwrap();
        let size_before = std::fs::metadata(&path).unwrap().len();
        let first_header_loc = sf.slots()[0].location(DocumentPart::Header);

        sf.put(Timestamp(20), &doc(2), b"second body", Compression::None).unwrap();
        assert_eq!(sf.try_partial_flush().unwrap(), PartialWriteResult::ChangesWritten);
        assert_eq!(std::fs::metadata(&path).unwrap().len(), size_before);
        assert_eq!(sf.slots()[0].location(DocumentPart::Header), first_header_loc);

        // The file checksum is the XOR fold of the retained slot checksums.
        let reopened = SlotFile::open(&path, test_config()).unwrap();
        let mut header_bytes = vec![0u8; FILE_HEADER_SIZE as usize];
        reopened.file.read_exact_at(&mut header_bytes, 0).unwrap();
        let header = FileHeader::decode(&header_bytes).unwrap();
        assert_eq!(header.file_checksum, xor_fold_checksums(reopened.slots().iter()));
        assert_eq!(reopened.slots().len(), 2);
    }

    #[test]
    fn test_flush_without_changes_is_unaltered() {
        let dir = tempfile::tempdir().unwrap();
        let path = temp_path(&dir, "bucket.dat");
        let mut sf = SlotFile::create(&path, test_config()).unwrap();
        sf.put(Timestamp(10), &doc(1), b"body", Compression::None).unwrap();
        sf.flush().unwrap();
        assert_eq!(sf.flush().unwrap(), FlushOutcome::Unaltered);
    }

    #[test]
    fn test_metadata_region_is_stable_without_modifications() {
        let dir = tempfile::tempdir().unwrap();
        let path = temp_path(&dir, "bucket.dat");
        {
            let mut sf = SlotFile::create(&path, test_config()).unwrap();
            sf.put(Timestamp(10), &doc(1), b"body", Compression::None).unwrap();
            sf.flush().unwrap();
        }
        let read_meta = || {
            let mut file = File::open(&path).unwrap();
            let mut buf = vec![0u8; 4096];
            file.read_exact(&mut buf).unwrap();
            buf
        };
        let before = read_meta();
        {
            // Load then flush with no modifications: byte-identical metadata.
            let mut sf = SlotFile::open(&path, test_config()).unwrap();
            assert_eq!(sf.flush().unwrap(), FlushOutcome::Unaltered);
            let meta = sf.encode_meta_region();
            let mut writer = BufferedFileWriter::new(&sf.file, 4096);
            writer.write(&meta).unwrap();
            let echo = sf.info.first_header_bytes.clone();
            writer.write(&echo).unwrap();
            writer.flush().unwrap();
        }
        assert_eq!(before, read_meta());
    }

    #[test]
    fn test_overflow_triggers_rewrite_with_room() {
        let mut config = test_config();
        config.minimum_file_header_block_size = 512;
        config.minimum_file_size = 4096;
        let dir = tempfile::tempdir().unwrap();
        let path = temp_path(&dir, "bucket.dat");
        let mut sf = SlotFile::create(&path, config).unwrap();
        // Fill the header block beyond its trailing free space.
        let mut ts = 1u64;
        loop {
            sf.put(Timestamp(ts), &doc(ts as u32), b"", Compression::None).unwrap();
            ts += 1;
            match sf.try_partial_flush().unwrap() {
                PartialWriteResult::ChangesWritten => continue,
                PartialWriteResult::TooSmall | PartialWriteResult::TooFewMetaEntries => break,
                other => panic!("unexpected flush result {:?}", other),
            }
        }
        let used_header_bytes: u32 = {
            let unique = UniqueSlotGenerator::new(sf.slots());
            unique
                .iter(DocumentPart::Header)
                .map(|(loc, _)| loc.size)
                .sum()
        };
        sf.rewrite_file().unwrap();
        assert!(sf.info().header_block_size >= used_header_bytes);
        // Everything is still readable after the rewrite.
        let count = sf.slots().len();
        for idx in 0..count {
            sf.get_document(idx).unwrap();
        }
    }

    #[test]
    fn test_rewrite_deduplicates_shared_locations() {
        let dir = tempfile::tempdir().unwrap();
        let path = temp_path(&dir, "bucket.dat");
        let mut sf = SlotFile::create(&path, test_config()).unwrap();
        sf.put(Timestamp(1), &doc(1), b"shared", Compression::None).unwrap();
        sf.flush().unwrap();
        // Simulate two slots sharing one header location (content
        // addressing after e.g. an update touching only the body).
        let shared_header = sf.slots[0].location(DocumentPart::Header);
        let mut clone_slot = sf.slots[0];
        clone_slot.timestamp = Timestamp(2);
        clone_slot.set_location(DocumentPart::Body, DataLocation::default());
        clone_slot.update_checksum();
        sf.slots.push(clone_slot);
        sf.slots_altered = true;
        let _ = shared_header;
        sf.rewrite_file().unwrap();
        assert_eq!(
            sf.slots()[0].location(DocumentPart::Header),
            sf.slots()[1].location(DocumentPart::Header)
        );
        let unique = UniqueSlotGenerator::new(sf.slots());
        assert_eq!(unique.num_unique(DocumentPart::Header), 1);
        assert_eq!(unique.slots(DocumentPart::Header, 0), &[0, 1]);
    }

    #[test]
    fn test_rewrite_exceeding_max_size_is_file_full() {
        let mut config = test_config();
        config.maximum_file_meta_slots = 2;
        let dir = tempfile::tempdir().unwrap();
        let mut sf = SlotFile::create(temp_path(&dir, "b.dat"), config).unwrap();
        for ts in 1..=3u64 {
            sf.put(Timestamp(ts), &doc(ts as u32), b"", Compression::None).unwrap();
        }
        let err = sf.rewrite_file().unwrap_err();
        assert_eq!(err.kind, ErrorKind::FileFull);
    }

    #[test]
    fn test_open_skips_corrupt_slot_and_flags_repair() {
        let dir = tempfile::tempdir().unwrap();
        let path = temp_path(&dir, "bucket.dat");
        {
            let mut sf = SlotFile::create(&path, test_config()).unwrap();
            sf.put(Timestamp(10), &doc(1), b"one", Compression::None).unwrap();
            sf.put(Timestamp(20), &doc(2), b"two", Compression::None).unwrap();
            sf.flush().unwrap();
        }
        // Flip a byte inside the second meta slot.
        {
            use std::os::unix::fs::FileExt;
            let file = OpenOptions::new().write(true).read(true).open(&path).unwrap();
            let offset = (FILE_HEADER_SIZE + META_SLOT_SIZE) as u64;
            let mut byte = [0u8; 1];
            file.read_exact_at(&mut byte, offset).unwrap();
            byte[0] ^= 0xff;
            file.write_all_at(&byte, offset).unwrap();
        }
        let sf = SlotFile::open(&path, test_config()).unwrap();
        assert!(sf.needs_repair());
        assert_eq!(sf.slots().len(), 1);
        assert_eq!(sf.slots()[0].timestamp, Timestamp(10));
    }

    #[test]
    fn test_open_detects_bad_header() {
        let dir = tempfile::tempdir().unwrap();
        let path = temp_path(&dir, "bucket.dat");
        {
            let mut sf = SlotFile::create(&path, test_config()).unwrap();
            sf.put(Timestamp(10), &doc(1), b"one", Compression::None).unwrap();
            sf.flush().unwrap();
        }
        {
            let file = OpenOptions::new().write(true).open(&path).unwrap();
            file.write_all_at(&[0xff], 2).unwrap();
        }
        let err = SlotFile::open(&path, test_config()).unwrap_err();
        assert_eq!(err.kind, ErrorKind::Corruption);
    }
}
