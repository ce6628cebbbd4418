use serde::{Serialize, Deserialize};

/// Sizing and compaction tunables for one slot file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SlotFileConfig {
    /// Rewrite to compact when utilisation drops below this.
    pub min_fill_rate: f32,
    pub minimum_file_meta_slots: u32,
    pub maximum_file_meta_slots: u32,
    pub minimum_file_header_block_size: u32,
    pub maximum_file_header_block_size: u32,
    pub minimum_file_size: u32,
    pub maximum_file_size: u32,
    /// Body block sizes are rounded up to a multiple of this.
    pub file_block_size: u32,
    pub grow_factor: f64,
    pub overrepresent_meta_data_factor: f64,
    pub overrepresent_header_block_factor: f64,
    /// How much to read from offset 0 when opening a file.
    pub initial_index_read: u32,
    /// Reads closer together than this are coalesced into one pread.
    pub max_read_gap: u32,
    /// Non-empty: removes write a backwards-compatible empty document
    /// body of this type. Empty: removes carry no body at all.
    pub default_remove_doc_type: String,
}

impl Default for SlotFileConfig {
    fn default() -> Self {
        SlotFileConfig {
            min_fill_rate: 0.2,
            minimum_file_meta_slots: 512,
            maximum_file_meta_slots: 64 * 1024,
            minimum_file_header_block_size: 16 * 1024,
            maximum_file_header_block_size: 256 * 1024 * 1024,
            minimum_file_size: 32 * 1024,
            maximum_file_size: 1024 * 1024 * 1024,
            file_block_size: 4 * 1024,
            grow_factor: 2.0,
            overrepresent_meta_data_factor: 1.2,
            overrepresent_header_block_factor: 1.1,
            initial_index_read: 64 * 1024,
            max_read_gap: 16 * 1024,
            default_remove_doc_type: String::new(),
        }
    }
}

/// Engine-wide settings consumed by the search pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    pub slot_file: SlotFileConfig,
    /// Rewrite non-integer numeric word terms into EQUIV(word, phrase).
    pub rewrite_float_terms: bool,
    /// Default wanted hit count when the visitor does not say.
    pub default_summary_count: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            slot_file: SlotFileConfig::default(),
            rewrite_float_terms: true,
            default_summary_count: 10,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_sane() {
        let cfg = SlotFileConfig::default();
        assert!(cfg.min_fill_rate > 0.0 && cfg.min_fill_rate <= 1.0);
        assert!(cfg.minimum_file_meta_slots <= cfg.maximum_file_meta_slots);
        assert!(cfg.minimum_file_size <= cfg.maximum_file_size);
        assert_eq!(cfg.file_block_size % 512, 0);
        assert!(cfg.default_remove_doc_type.is_empty());
    }
}
