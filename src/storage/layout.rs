use crate::core::error::{Error, Result};
use crate::core::types::{GlobalId, Timestamp};

pub const SECTOR_SIZE: u32 = 512;
pub const FILE_HEADER_SIZE: u32 = 64;
pub const META_SLOT_SIZE: u32 = 40;
pub const SLOT_FILE_V1: u32 = 1;

/// IN-USE bit plus per-document flags persisted in each slot.
pub const SLOT_IN_USE: u16 = 0x0001;
pub const SLOT_BODY_LZ4: u16 = 0x0002;
pub const SLOT_BODY_ZSTD: u16 = 0x0004;
/// The slot is a remove marker, not a live document version.
pub const SLOT_REMOVE_ENTRY: u16 = 0x0008;

pub fn align_up(value: u32, block: u32) -> u32 {
    value.div_ceil(block) * block
}

pub fn align_down(value: u32, block: u32) -> u32 {
    (value / block) * block
}

fn crc32(data: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(data);
    hasher.finalize()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocumentPart {
    Header,
    Body,
}

impl DocumentPart {
    pub const ALL: [DocumentPart; 2] = [DocumentPart::Header, DocumentPart::Body];

    pub fn name(&self) -> &'static str {
        match self {
            DocumentPart::Header => "header",
            DocumentPart::Body => "body",
        }
    }
}

/// `(pos, size)` within one block, block-relative.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct DataLocation {
    pub pos: u32,
    pub size: u32,
}

impl DataLocation {
    pub fn new(pos: u32, size: u32) -> Self {
        DataLocation { pos, size }
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    pub fn end(&self) -> u32 {
        self.pos + self.size
    }

    pub fn contains(&self, other: &DataLocation) -> bool {
        other.pos >= self.pos && other.end() <= self.end()
    }
}

/// Fixed 64-byte file header. `header_checksum` covers the first 12 bytes;
/// the tail is reserved space kept zeroed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileHeader {
    pub version: u32,
    pub meta_count: u32,
    pub header_block_size: u32,
    pub header_checksum: u32,
    pub file_checksum: u32,
}

impl FileHeader {
    pub fn new(meta_count: u32, header_block_size: u32) -> Self {
        let mut header = FileHeader {
            version: SLOT_FILE_V1,
            meta_count,
            header_block_size,
            header_checksum: 0,
            file_checksum: 0,
        };
        header.update_checksum();
        header
    }

    pub fn encode(&self) -> [u8; FILE_HEADER_SIZE as usize] {
        let mut out = [0u8; FILE_HEADER_SIZE as usize];
        out[0..4].copy_from_slice(&self.version.to_le_bytes());
        out[4..8].copy_from_slice(&self.meta_count.to_le_bytes());
        out[8..12].copy_from_slice(&self.header_block_size.to_le_bytes());
        out[12..16].copy_from_slice(&self.header_checksum.to_le_bytes());
        out[16..20].copy_from_slice(&self.file_checksum.to_le_bytes());
        out
    }

    pub fn decode(data: &[u8]) -> Result<FileHeader> {
        if data.len() < FILE_HEADER_SIZE as usize {
            return Err(Error::corruption(format!(
                "file too short for header: {} bytes",
                data.len()
            )));
        }
        let u32_at =
            |o: usize| u32::from_le_bytes([data[o], data[o + 1], data[o + 2], data[o + 3]]);
        Ok(FileHeader {
            version: u32_at(0),
            meta_count: u32_at(4),
            header_block_size: u32_at(8),
            header_checksum: u32_at(12),
            file_checksum: u32_at(16),
        })
    }

    pub fn calc_checksum(&self) -> u32 {
        crc32(&self.encode()[0..12])
    }

    pub fn update_checksum(&mut self) {
        self.header_checksum = self.calc_checksum();
    }

    pub fn verify(&self) -> bool {
        self.version == SLOT_FILE_V1 && self.header_checksum == self.calc_checksum()
    }
}

/// Fixed 40-byte metadata slot. `checksum` is the CRC-32 of the other 38
/// bytes truncated to 16 bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MetaSlot {
    pub timestamp: Timestamp,
    pub gid: GlobalId,
    pub header_pos: u32,
    pub header_size: u32,
    pub body_pos: u32,
    pub body_size: u32,
    pub flags: u16,
    pub checksum: u16,
}

impl Default for MetaSlot {
    fn default() -> Self {
        let mut slot = MetaSlot {
            timestamp: Timestamp(0),
            gid: GlobalId::default(),
            header_pos: 0,
            header_size: 0,
            body_pos: 0,
            body_size: 0,
            flags: 0,
            checksum: 0,
        };
        slot.update_checksum();
        slot
    }
}

impl MetaSlot {
    pub fn encode(&self) -> [u8; META_SLOT_SIZE as usize] {
        let mut out = [0u8; META_SLOT_SIZE as usize];
        out[0..8].copy_from_slice(&self.timestamp.0.to_le_bytes());
        out[8..20].copy_from_slice(self.gid.as_bytes());
        out[20..24].copy_from_slice(&self.header_pos.to_le_bytes());
        out[24..28].copy_from_slice(&self.header_size.to_le_bytes());
        out[28..32].copy_from_slice(&self.body_pos.to_le_bytes());
        out[32..36].copy_from_slice(&self.body_size.to_le_bytes());
        out[36..38].copy_from_slice(&self.flags.to_le_bytes());
        out[38..40].copy_from_slice(&self.checksum.to_le_bytes());
        out
    }

    pub fn decode(data: &[u8]) -> Result<MetaSlot> {
        if data.len() < META_SLOT_SIZE as usize {
            return Err(Error::corruption("short meta slot"));
        }
        let u32_at =
            |o: usize| u32::from_le_bytes([data[o], data[o + 1], data[o + 2], data[o + 3]]);
        let mut gid = [0u8; 12];
        gid.copy_from_slice(&data[8..20]);
        Ok(MetaSlot {
            timestamp: Timestamp(u64::from_le_bytes(data[0..8].try_into().expect("8 bytes"))),
            gid: GlobalId(gid),
            header_pos: u32_at(20),
            header_size: u32_at(24),
            body_pos: u32_at(28),
            body_size: u32_at(32),
            flags: u16::from_le_bytes([data[36], data[37]]),
            checksum: u16::from_le_bytes([data[38], data[39]]),
        })
    }

    pub fn calc_checksum(&self) -> u16 {
        (crc32(&self.encode()[0..38]) & 0xffff) as u16
    }

    pub fn update_checksum(&mut self) {
        self.checksum = self.calc_checksum();
    }

    pub fn verify_checksum(&self) -> bool {
        self.checksum == self.calc_checksum()
    }

    pub fn in_use(&self) -> bool {
        self.flags & SLOT_IN_USE != 0
    }

    pub fn is_remove_entry(&self) -> bool {
        self.flags & SLOT_REMOVE_ENTRY != 0
    }

    pub fn set_in_use(&mut self, in_use: bool) {
        if in_use {
            self.flags |= SLOT_IN_USE;
        } else {
            self.flags &= !SLOT_IN_USE;
        }
    }

    pub fn location(&self, part: DocumentPart) -> DataLocation {
        match part {
            DocumentPart::Header => DataLocation::new(self.header_pos, self.header_size),
            DocumentPart::Body => DataLocation::new(self.body_pos, self.body_size),
        }
    }

    pub fn set_location(&mut self, part: DocumentPart, loc: DataLocation) {
        match part {
            DocumentPart::Header => {
                self.header_pos = loc.pos;
                self.header_size = loc.size;
            }
            DocumentPart::Body => {
                self.body_pos = loc.pos;
                self.body_size = loc.size;
            }
        }
    }
}

/// XOR-fold of live slot checksums; stored as the file checksum.
pub fn xor_fold_checksums<'a>(slots: impl Iterator<Item = &'a MetaSlot>) -> u32 {
    slots.fold(0u32, |acc, slot| acc ^ slot.checksum as u32)
}

/// Geometry of one open slot file, plus the echo of the header-block bytes
/// that share the last 512-byte sector with the metadata table.
#[derive(Debug, Clone, Default)]
pub struct FileInfo {
    pub meta_count: u32,
    pub header_block_size: u32,
    pub body_block_size: u32,
    pub first_header_bytes: Vec<u8>,
}

impl FileInfo {
    pub fn new(meta_count: u32, header_block_size: u32, body_block_size: u32) -> Self {
        FileInfo {
            meta_count,
            header_block_size,
            body_block_size,
            first_header_bytes: Vec::new(),
        }
    }

    pub fn from_header(header: &FileHeader, file_size: u64) -> Self {
        let fixed = FILE_HEADER_SIZE as u64
            + header.meta_count as u64 * META_SLOT_SIZE as u64
            + header.header_block_size as u64;
        let body = file_size.saturating_sub(fixed);
        FileInfo::new(header.meta_count, header.header_block_size, body as u32)
    }

    pub fn header_block_start(&self) -> u32 {
        FILE_HEADER_SIZE + self.meta_count * META_SLOT_SIZE
    }

    pub fn body_block_start(&self) -> u32 {
        self.header_block_start() + self.header_block_size
    }

    pub fn file_size(&self) -> u32 {
        self.body_block_start() + self.body_block_size
    }

    pub fn block_start(&self, part: DocumentPart) -> u32 {
        match part {
            DocumentPart::Header => self.header_block_start(),
            DocumentPart::Body => self.body_block_start(),
        }
    }

    pub fn block_size(&self, part: DocumentPart) -> u32 {
        match part {
            DocumentPart::Header => self.header_block_size,
            DocumentPart::Body => self.body_block_size,
        }
    }
}

/// Header chunk: `doc_blob | crc32(doc_blob) | doc_id | len(doc_id) u32 |
/// crc32(doc_id || len)`.
pub fn encode_header_chunk(doc_blob: &[u8], doc_id: &str) -> Vec<u8> {
    let id = doc_id.as_bytes();
    let mut out = Vec::with_capacity(doc_blob.len() + id.len() + 12);
    out.extend_from_slice(doc_blob);
    out.extend_from_slice(&crc32(doc_blob).to_le_bytes());
    out.extend_from_slice(id);
    out.extend_from_slice(&(id.len() as u32).to_le_bytes());
    let mut tail = Vec::with_capacity(id.len() + 4);
    tail.extend_from_slice(id);
    tail.extend_from_slice(&(id.len() as u32).to_le_bytes());
    out.extend_from_slice(&crc32(&tail).to_le_bytes());
    out
}

/// Validate a header chunk and split it into `(doc_blob, doc_id)`.
pub fn decode_header_chunk(data: &[u8]) -> Result<(&[u8], &str)> {
    if data.len() <= 12 {
        return Err(Error::corruption(format!(
            "{} byte header chunk is too small to contain required data",
            data.len()
        )));
    }
    let name_crc_pos = data.len() - 4;
    let name_crc = u32::from_le_bytes(data[name_crc_pos..].try_into().expect("4 bytes"));
    let name_len_pos = name_crc_pos - 4;
    let name_len =
        u32::from_le_bytes(data[name_len_pos..name_crc_pos].try_into().expect("4 bytes")) as usize;
    if data.len() < 12 + name_len {
        return Err(Error::corruption(format!(
            "{} byte header chunk cannot hold a {} byte document id",
            data.len(),
            name_len
        )));
    }
    let name_pos = name_len_pos - name_len;
    if crc32(&data[name_pos..name_crc_pos]) != name_crc {
        return Err(Error::corruption("document id checksum mismatch"));
    }
    let blob_crc_pos = name_pos - 4;
    let blob_crc = u32::from_le_bytes(data[blob_crc_pos..name_pos].try_into().expect("4 bytes"));
    let blob = &data[..blob_crc_pos];
    if crc32(blob) != blob_crc {
        return Err(Error::corruption("header blob checksum mismatch"));
    }
    let doc_id = std::str::from_utf8(&data[name_pos..name_len_pos])
        .map_err(|_| Error::corruption("document id is not valid utf-8"))?;
    Ok((blob, doc_id))
}

/// Body chunk: `body_blob | crc32(body_blob)`.
pub fn encode_body_chunk(body_blob: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(body_blob.len() + 4);
    out.extend_from_slice(body_blob);
    out.extend_from_slice(&crc32(body_blob).to_le_bytes());
    out
}

pub fn decode_body_chunk(data: &[u8]) -> Result<&[u8]> {
    if data.len() <= 4 {
        return Err(Error::corruption("body chunk too small"));
    }
    let crc_pos = data.len() - 4;
    let stored = u32::from_le_bytes(data[crc_pos..].try_into().expect("4 bytes"));
    let blob = &data[..crc_pos];
    if crc32(blob) != stored {
        return Err(Error::corruption("body blob checksum mismatch"));
    }
    Ok(blob)
}

pub fn verify_chunk(part: DocumentPart, data: &[u8]) -> Result<()> {
    match part {
        DocumentPart::Header => decode_header_chunk(data).map(|_| ()),
        DocumentPart::Body => decode_body_chunk(data).map(|_| ()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_encode_decode() {
        let mut header = FileHeader::new(128, 4096);
        header.file_checksum = 0xdead;
        header.update_checksum();
        let decoded = FileHeader::decode(&header.encode()).unwrap();
        assert_eq!(decoded, header);
        assert!(decoded.verify());
    }

    #[test]
    fn test_header_checksum_covers_first_12_bytes() {
        let mut header = FileHeader::new(128, 4096);
        // The file checksum is outside the covered range.
        header.file_checksum = 42;
        assert!(header.verify());
        header.meta_count += 1;
        assert!(!header.verify());
    }

    #[test]
    fn test_meta_slot_round_trip() {
        let mut slot = MetaSlot {
            timestamp: Timestamp(1234567),
            gid: GlobalId([7u8; 12]),
            header_pos: 512,
            header_size: 100,
            body_pos: 1024,
            body_size: 333,
            flags: SLOT_IN_USE,
            checksum: 0,
        };
        slot.update_checksum();
        let decoded = MetaSlot::decode(&slot.encode()).unwrap();
        assert_eq!(decoded, slot);
        assert!(decoded.verify_checksum());
        assert!(decoded.in_use());
    }

    #[test]
    fn test_file_info_geometry_is_aligned() {
        let info = FileInfo::new(56, 4096, 8192);
        assert_eq!(info.header_block_start(), 64 + 56 * 40);
        assert_eq!(info.body_block_start(), info.header_block_start() + 4096);
        assert_eq!(info.file_size(), info.body_block_start() + 8192);
    }

    #[test]
    fn test_header_chunk_round_trip() {
        let chunk = encode_header_chunk(b"serialized document", "id:test:music::1");
        let (blob, doc_id) = decode_header_chunk(&chunk).unwrap();
        assert_eq!(blob, b"serialized document");
        assert_eq!(doc_id, "id:test:music::1");
    }

    #[test]
    fn test_header_chunk_detects_corruption() {
        let mut chunk = encode_header_chunk(b"payload", "id:test:music::1");
        chunk[0] ^= 0xff;
        assert!(decode_header_chunk(&chunk).is_err());
        let mut chunk = encode_header_chunk(b"payload", "id:test:music::1");
        let idx = chunk.len() - 6;
        chunk[idx] ^= 0xff;
        assert!(decode_header_chunk(&chunk).is_err());
    }

    #[test]
    fn test_body_chunk_round_trip() {
        let chunk = encode_body_chunk(b"large body fields");
        assert_eq!(decode_body_chunk(&chunk).unwrap(), b"large body fields");
        let mut bad = chunk.clone();
        bad[3] ^= 0x10;
        assert!(decode_body_chunk(&bad).is_err());
    }

    #[test]
    fn test_xor_fold() {
        let mut a = MetaSlot::default();
        a.timestamp = Timestamp(1);
        a.set_in_use(true);
        a.update_checksum();
        let mut b = MetaSlot::default();
        b.timestamp = Timestamp(2);
        b.set_in_use(true);
        b.update_checksum();
        let folded = xor_fold_checksums([a, b].iter());
        assert_eq!(folded, (a.checksum ^ b.checksum) as u32);
    }

    #[test]
    fn test_alignment_helpers() {
        assert_eq!(align_up(0, SECTOR_SIZE), 0);
        assert_eq!(align_up(1, SECTOR_SIZE), 512);
        assert_eq!(align_up(512, SECTOR_SIZE), 512);
        assert_eq!(align_down(1023, SECTOR_SIZE), 512);
    }
}
