/// Field length used when the searched field never reported one.
pub const UNKNOWN_FIELD_LENGTH: u32 = 1_000_000;

pub type TermFieldHandle = usize;

/// One unpacked hit as seen by rank programs.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TermFieldMatchDataPosition {
    pub element_id: u32,
    pub position: u32,
    pub element_weight: i32,
    pub element_length: u32,
}

/// Pre-allocated buffer for one (term, field) pairing. The rank processor
/// overwrites it for every document; the hit collector copies out what it
/// retains.
#[derive(Debug, Clone)]
pub struct TermFieldMatchData {
    pub field_id: u32,
    doc_id: u32,
    pub weight: i32,
    raw_score: f64,
    field_length: u32,
    num_occs: u32,
    needs_interleaved: bool,
    positions: Vec<TermFieldMatchDataPosition>,
}

pub const INVALID_DOC_ID: u32 = u32::MAX;

impl TermFieldMatchData {
    pub fn new() -> Self {
        TermFieldMatchData {
            field_id: 0,
            doc_id: INVALID_DOC_ID,
            weight: 0,
            raw_score: 0.0,
            field_length: UNKNOWN_FIELD_LENGTH,
            num_occs: 0,
            needs_interleaved: false,
            positions: Vec::new(),
        }
    }

    pub fn set_needs_interleaved(&mut self, needs: bool) {
        self.needs_interleaved = needs;
    }

    pub fn reset(&mut self, doc_id: u32) {
        self.doc_id = doc_id;
        self.raw_score = 0.0;
        self.field_length = UNKNOWN_FIELD_LENGTH;
        self.num_occs = 0;
        self.positions.clear();
    }

    pub fn doc_id(&self) -> u32 {
        self.doc_id
    }

    pub fn matches(&self, doc_id: u32) -> bool {
        self.doc_id == doc_id && (!self.positions.is_empty() || self.raw_score != 0.0)
    }

    pub fn append_position(&mut self, pos: TermFieldMatchDataPosition) {
        if self.needs_interleaved {
            self.num_occs += 1;
            if pos.element_length != 0 {
                self.field_length = pos.element_length;
            }
        }
        self.positions.push(pos);
    }

    pub fn set_field_length(&mut self, length: u32) {
        self.field_length = length;
    }

    pub fn field_length(&self) -> u32 {
        self.field_length
    }

    pub fn num_occs(&self) -> u32 {
        if self.needs_interleaved {
            self.num_occs
        } else {
            self.positions.len() as u32
        }
    }

    pub fn set_raw_score(&mut self, doc_id: u32, score: f64) {
        self.doc_id = doc_id;
        self.raw_score = score;
    }

    pub fn raw_score(&self) -> f64 {
        self.raw_score
    }

    pub fn positions(&self) -> &[TermFieldMatchDataPosition] {
        &self.positions
    }
}

impl Default for TermFieldMatchData {
    fn default() -> Self {
        TermFieldMatchData::new()
    }
}

/// Allocates one slot per (term, field) pairing the ranker reads.
#[derive(Debug, Default)]
pub struct MatchDataLayout {
    num_term_fields: usize,
}

impl MatchDataLayout {
    pub fn new() -> Self {
        MatchDataLayout::default()
    }

    pub fn alloc_term_field(&mut self) -> TermFieldHandle {
        let handle = self.num_term_fields;
        self.num_term_fields += 1;
        handle
    }

    pub fn create_match_data(&self) -> MatchData {
        MatchData {
            term_fields: (0..self.num_term_fields)
                .map(|_| TermFieldMatchData::new())
                .collect(),
        }
    }
}

/// The shared per-document buffers, resolved by handle.
#[derive(Debug, Clone)]
pub struct MatchData {
    term_fields: Vec<TermFieldMatchData>,
}

impl MatchData {
    pub fn num_term_fields(&self) -> usize {
        self.term_fields.len()
    }

    pub fn resolve_term_field(&mut self, handle: TermFieldHandle) -> &mut TermFieldMatchData {
        &mut self.term_fields[handle]
    }

    pub fn term_field(&self, handle: TermFieldHandle) -> &TermFieldMatchData {
        &self.term_fields[handle]
    }

    pub fn term_fields(&self) -> &[TermFieldMatchData] {
        &self.term_fields
    }

    /// Copy of every slot, captured by the hit collector.
    pub fn snapshot(&self) -> Vec<TermFieldMatchData> {
        self.term_fields.clone()
    }

    /// Restore earlier unpacked data into the shared buffers.
    pub fn restore(&mut self, snapshot: &[TermFieldMatchData]) {
        debug_assert_eq!(snapshot.len(), self.term_fields.len());
        self.term_fields.clone_from_slice(snapshot);
    }
}

/// One field a term is ranked against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TermFieldData {
    pub field_id: u32,
    pub handle: TermFieldHandle,
}

/// Static term information bound into the query environment.
#[derive(Debug, Clone, Default)]
pub struct TermData {
    pub weight: i32,
    pub unique_id: u32,
    pub phrase_length: u32,
    pub query_tensor_name: Option<String>,
    pub fields: Vec<TermFieldData>,
}

impl TermData {
    pub fn lookup_field(&self, field_id: u32) -> Option<&TermFieldData> {
        self.fields.iter().find(|f| f.field_id == field_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layout_allocates_distinct_handles() {
        let mut layout = MatchDataLayout::new();
        let a = layout.alloc_term_field();
        let b = layout.alloc_term_field();
        assert_ne!(a, b);
        let md = layout.create_match_data();
        assert_eq!(md.num_term_fields(), 2);
    }

    #[test]
    fn test_interleaved_counters() {
        let mut tmd = TermFieldMatchData::new();
        tmd.set_needs_interleaved(true);
        tmd.reset(7);
        tmd.append_position(TermFieldMatchDataPosition {
            element_id: 0,
            position: 3,
            element_weight: 1,
            element_length: 12,
        });
        tmd.append_position(TermFieldMatchDataPosition {
            element_id: 0,
            position: 5,
            element_weight: 1,
            element_length: 12,
        });
        assert_eq!(tmd.num_occs(), 2);
        assert_eq!(tmd.field_length(), 12);
        tmd.reset(8);
        assert_eq!(tmd.num_occs(), 0);
        assert_eq!(tmd.field_length(), UNKNOWN_FIELD_LENGTH);
    }

    #[test]
    fn test_snapshot_restore_round_trip() {
        let mut layout = MatchDataLayout::new();
        let h = layout.alloc_term_field();
        let mut md = layout.create_match_data();
        md.resolve_term_field(h).reset(3);
        md.resolve_term_field(h).set_raw_score(3, 1.5);
        let snap = md.snapshot();
        md.resolve_term_field(h).reset(4);
        md.restore(&snap);
        assert_eq!(md.term_field(h).doc_id(), 3);
        assert_eq!(md.term_field(h).raw_score(), 1.5);
    }
}
