use crate::query::hit::{Hit, HitList};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TermType {
    Word,
    Prefix,
    Suffix,
    Substring,
    Exact,
    Regex,
    Fuzzy,
    Range,
    GeoLocation,
    Number,
    NearestNeighbor,
}

/// Per-field bookkeeping collected while hits are added: where in the hit
/// list the field starts, how many hits it got and how long the field was.
#[derive(Debug, Clone, Copy, Default)]
pub struct FieldInfo {
    pub hit_offset: usize,
    pub hit_count: usize,
    pub field_length: u32,
}

/// Inclusive/exclusive numeric range, parsed from `[low;high]` or
/// `<low;high>` term syntax. Missing bounds are open.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RangeSpec {
    pub low: Option<f64>,
    pub high: Option<f64>,
    pub low_inclusive: bool,
    pub high_inclusive: bool,
}

impl RangeSpec {
    pub fn parse(term: &str) -> Option<RangeSpec> {
        let bytes = term.as_bytes();
        if bytes.len() < 3 {
            return None;
        }
        let low_inclusive = match bytes[0] {
            b'[' => true,
            b'<' => false,
            _ => return None,
        };
        let high_inclusive = match bytes[bytes.len() - 1] {
            b']' => true,
            b'>' => false,
            _ => return None,
        };
        let inner = &term[1..term.len() - 1];
        let (lo, hi) = inner.split_once(';')?;
        let low = if lo.is_empty() { None } else { Some(lo.parse().ok()?) };
        let high = if hi.is_empty() { None } else { Some(hi.parse().ok()?) };
        Some(RangeSpec { low, high, low_inclusive, high_inclusive })
    }

    pub fn contains(&self, value: f64) -> bool {
        if let Some(low) = self.low {
            if value < low || (!self.low_inclusive && value == low) {
                return false;
            }
        }
        if let Some(high) = self.high {
            if value > high || (!self.high_inclusive && value == high) {
                return false;
            }
        }
        true
    }
}

/// A query leaf. Owns its evaluation state (the hit list filled by field
/// searchers); `reset()` clears it between documents.
#[derive(Debug, Clone)]
pub struct QueryTerm {
    pub index: String,
    pub term: String,
    pub term_type: TermType,
    pub weight: i32,
    pub unique_id: u32,
    pub ranked: bool,
    pub filter: bool,
    pub fuzzy_max_edits: u32,
    pub fuzzy_prefix_length: u32,
    hits: HitList,
    field_info: Vec<Option<FieldInfo>>,
}

/// Structural equality; per-document evaluation state is ignored.
impl PartialEq for QueryTerm {
    fn eq(&self, other: &Self) -> bool {
        self.index == other.index
            && self.term == other.term
            && self.term_type == other.term_type
            && self.weight == other.weight
            && self.unique_id == other.unique_id
            && self.ranked == other.ranked
            && self.filter == other.filter
            && self.fuzzy_max_edits == other.fuzzy_max_edits
            && self.fuzzy_prefix_length == other.fuzzy_prefix_length
    }
}

impl QueryTerm {
    pub fn new(index: impl Into<String>, term: impl Into<String>, term_type: TermType) -> Self {
        QueryTerm {
            index: index.into(),
            term: term.into(),
            term_type,
            weight: 100,
            unique_id: 0,
            ranked: true,
            filter: false,
            fuzzy_max_edits: 2,
            fuzzy_prefix_length: 0,
            hits: HitList::new(),
            field_info: Vec::new(),
        }
    }

    pub fn evaluate(&self) -> bool {
        !self.hits.is_empty()
    }

    pub fn evaluate_hits(&self, out: &mut HitList) {
        out.clear();
        out.extend_from_slice(&self.hits);
    }

    pub fn hits(&self) -> &HitList {
        &self.hits
    }

    /// Append a searcher hit. Searchers visit fields in field-id order and
    /// emit positions in increasing order within each field.
    pub fn add_hit(&mut self, hit: Hit) {
        let field = hit.field_id as usize;
        if self.field_info.len() <= field {
            self.field_info.resize(field + 1, None);
        }
        let offset = self.hits.len();
        if let Some(last) = self.hits.last() {
            debug_assert!(last.key() <= hit.key(), "hits must arrive ordered");
            if last.key() == hit.key() {
                return;
            }
        }
        self.hits.push(hit);
        let info = self.field_info[field].get_or_insert_with(|| FieldInfo {
            hit_offset: offset,
            ..FieldInfo::default()
        });
        info.hit_count += 1;
        info.field_length = info.field_length.max(hit.element_length);
    }

    /// Record the token length of a searched field, also when it got no hits.
    pub fn set_field_length(&mut self, field_id: u32, length: u32) {
        let field = field_id as usize;
        if self.field_info.len() <= field {
            self.field_info.resize(field + 1, None);
        }
        let info = self.field_info[field].get_or_insert_with(FieldInfo::default);
        info.field_length = length;
    }

    pub fn field_info(&self, field_id: u32) -> Option<&FieldInfo> {
        self.field_info.get(field_id as usize).and_then(|i| i.as_ref())
    }

    pub fn num_field_infos(&self) -> usize {
        self.field_info.len()
    }

    pub fn reset(&mut self) {
        self.hits.clear();
        self.field_info.clear();
    }

    pub fn is_integer(&self) -> bool {
        self.term.parse::<i64>().is_ok()
    }

    pub fn is_float(&self) -> bool {
        !self.is_integer() && self.term.parse::<f64>().is_ok()
    }

    pub fn as_range(&self) -> Option<RangeSpec> {
        RangeSpec::parse(&self.term)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_range_parsing() {
        let r = RangeSpec::parse("[2;10]").unwrap();
        assert!(r.contains(2.0) && r.contains(10.0) && !r.contains(10.5));
        let r = RangeSpec::parse("<2;10>").unwrap();
        assert!(!r.contains(2.0) && !r.contains(10.0) && r.contains(5.0));
        let r = RangeSpec::parse("[;10]").unwrap();
        assert!(r.contains(-1e9) && !r.contains(11.0));
        assert!(RangeSpec::parse("apple").is_none());
    }

    #[test]
    fn test_field_info_tracks_offsets() {
        let mut term = QueryTerm::new("title", "x", TermType::Word);
        term.add_hit(Hit::new(0, 0, 1, 8, 1));
        term.add_hit(Hit::new(0, 0, 1, 8, 5));
        term.add_hit(Hit::new(2, 0, 1, 4, 0));
        let info0 = term.field_info(0).unwrap();
        assert_eq!((info0.hit_offset, info0.hit_count, info0.field_length), (0, 2, 8));
        let info2 = term.field_info(2).unwrap();
        assert_eq!((info2.hit_offset, info2.hit_count), (2, 1));
        assert!(term.field_info(1).is_none());

        term.reset();
        assert!(!term.evaluate());
        assert!(term.field_info(0).is_none());
    }

    #[test]
    fn test_numeric_classification() {
        assert!(QueryTerm::new("a", "42", TermType::Word).is_integer());
        assert!(QueryTerm::new("a", "3.14", TermType::Word).is_float());
        assert!(!QueryTerm::new("a", "3.14", TermType::Word).is_integer());
        assert!(!QueryTerm::new("a", "pi", TermType::Word).is_float());
    }
}
