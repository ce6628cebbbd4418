use serde::{Serialize, Deserialize};
use std::collections::HashMap;
use std::fmt;

/// Local document id within one bucket stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DocId(pub u32);

impl DocId {
    pub fn new(id: u32) -> Self {
        DocId(id)
    }

    pub fn value(&self) -> u32 {
        self.0
    }
}

impl From<u32> for DocId {
    fn from(id: u32) -> Self {
        DocId(id)
    }
}

impl fmt::Display for DocId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Microseconds since epoch. Slot files order entries by this.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct Timestamp(pub u64);

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unit of document partitioning, carried as a 64-bit id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct BucketId(pub u64);

impl BucketId {
    pub fn new(id: u64) -> Self {
        BucketId(id)
    }

    /// Bucket derived from a global id, keeping `used_bits` low bits.
    pub fn from_gid(gid: &GlobalId, used_bits: u32) -> Self {
        let mut raw = [0u8; 8];
        raw.copy_from_slice(&gid.0[0..8]);
        let value = u64::from_le_bytes(raw);
        let mask = if used_bits >= 64 { u64::MAX } else { (1u64 << used_bits) - 1 };
        BucketId(value & mask)
    }
}

impl fmt::Display for BucketId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "BucketId(0x{:x})", self.0)
    }
}

/// 12-byte global id derived from the document id string.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct GlobalId(pub [u8; 12]);

impl GlobalId {
    const SEEDS: [u32; 3] = [0x0000_0000, 0x9e37_79b9, 0x85eb_ca6b];

    pub fn from_document_id(id: &DocumentId) -> Self {
        let mut out = [0u8; 12];
        for (i, seed) in Self::SEEDS.iter().enumerate() {
            let mut hasher = crc32fast::Hasher::new_with_initial(*seed);
            hasher.update(id.as_str().as_bytes());
            out[i * 4..i * 4 + 4].copy_from_slice(&hasher.finalize().to_le_bytes());
        }
        GlobalId(out)
    }

    pub fn as_bytes(&self) -> &[u8; 12] {
        &self.0
    }
}

impl fmt::Display for GlobalId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        for b in self.0.iter() {
            write!(f, "{:02x}", b)?;
        }
        Ok(())
    }
}

/// Document id on the form `id:<namespace>:<doctype>::<local>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DocumentId(String);

impl DocumentId {
    pub fn new(id: impl Into<String>) -> Self {
        DocumentId(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn global_id(&self) -> GlobalId {
        GlobalId::from_document_id(self)
    }

    /// Document type name, if the id follows the `id:` scheme.
    pub fn doc_type(&self) -> Option<&str> {
        let mut parts = self.0.splitn(4, ':');
        match (parts.next(), parts.next(), parts.next()) {
            (Some("id"), Some(_namespace), Some(doctype)) => Some(doctype),
            _ => None,
        }
    }
}

impl fmt::Display for DocumentId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum FieldValue {
    Text(String),
    Number(f64),
    Integer(i64),
    Boolean(bool),
    /// Structured field; each entry is one field-element.
    Array(Vec<FieldValue>),
    /// Structured field with per-element weights.
    WeightedSet(Vec<(String, i32)>),
}

impl FieldValue {
    pub fn as_text(&self) -> Option<&str> {
        match self {
            FieldValue::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_number(&self) -> Option<f64> {
        match self {
            FieldValue::Number(n) => Some(*n),
            FieldValue::Integer(i) => Some(*i as f64),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub id: DocumentId,
    pub fields: HashMap<String, FieldValue>,
}

impl Document {
    pub fn new(id: DocumentId) -> Self {
        Document {
            id,
            fields: HashMap::new(),
        }
    }

    pub fn add_field(&mut self, name: impl Into<String>, value: FieldValue) {
        self.fields.insert(name.into(), value);
    }

    pub fn get_field(&self, name: &str) -> Option<&FieldValue> {
        self.fields.get(name)
    }

    pub fn global_id(&self) -> GlobalId {
        self.id.global_id()
    }
}
