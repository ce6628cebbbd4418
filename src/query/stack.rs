use nom::IResult;
use nom::Parser;
use nom::bytes::complete::take;
use nom::number::complete::{be_f64, be_i32, be_i64, be_u32, u8 as any_u8};

/// Node kinds of the serialised query stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StackItemType {
    And,
    Or,
    AndNot,
    RankWith,
    Near,
    ONear,
    Phrase,
    SameElement,
    Equiv,
    WeakAnd,
    WeightedSet,
    DotProduct,
    Wand,
    In,
    WordAlternatives,
    Term,
    NumTerm,
    PrefixTerm,
    SubstringTerm,
    SuffixTerm,
    ExactTerm,
    RegexpTerm,
    FuzzyTerm,
    GeoLocationTerm,
    NearestNeighbor,
    PureWeightedString,
    PureWeightedLong,
    True,
    False,
    Unknown(u8),
}

impl StackItemType {
    pub fn code(&self) -> u8 {
        use StackItemType::*;
        match self {
            And => 0,
            Or => 1,
            AndNot => 2,
            RankWith => 3,
            Near => 4,
            ONear => 5,
            Phrase => 6,
            SameElement => 7,
            Equiv => 8,
            WeakAnd => 9,
            WeightedSet => 10,
            DotProduct => 11,
            Wand => 12,
            In => 13,
            WordAlternatives => 14,
            Term => 20,
            NumTerm => 21,
            PrefixTerm => 22,
            SubstringTerm => 23,
            SuffixTerm => 24,
            ExactTerm => 25,
            RegexpTerm => 26,
            FuzzyTerm => 27,
            GeoLocationTerm => 28,
            NearestNeighbor => 29,
            PureWeightedString => 30,
            PureWeightedLong => 31,
            True => 40,
            False => 41,
            Unknown(code) => *code,
        }
    }

    pub fn from_code(code: u8) -> Self {
        use StackItemType::*;
        match code {
            0 => And,
            1 => Or,
            2 => AndNot,
            3 => RankWith,
            4 => Near,
            5 => ONear,
            6 => Phrase,
            7 => SameElement,
            8 => Equiv,
            9 => WeakAnd,
            10 => WeightedSet,
            11 => DotProduct,
            12 => Wand,
            13 => In,
            14 => WordAlternatives,
            20 => Term,
            21 => NumTerm,
            22 => PrefixTerm,
            23 => SubstringTerm,
            24 => SuffixTerm,
            25 => ExactTerm,
            26 => RegexpTerm,
            27 => FuzzyTerm,
            28 => GeoLocationTerm,
            29 => NearestNeighbor,
            30 => PureWeightedString,
            31 => PureWeightedLong,
            40 => True,
            41 => False,
            other => Unknown(other),
        }
    }

    pub fn is_connector(&self) -> bool {
        use StackItemType::*;
        matches!(self, And | Or | AndNot | RankWith | Near | ONear | Phrase
                 | SameElement | Equiv | WeakAnd | WeightedSet | DotProduct
                 | Wand | In | WordAlternatives)
    }
}

pub const FLAG_NORANK: u8 = 0x01;
pub const FLAG_FILTER: u8 = 0x02;

/// One depth-first node descriptor. Every field is present in the wire
/// layout so the reader never backtracks.
#[derive(Debug, Clone, PartialEq)]
pub struct StackItem {
    pub item_type: StackItemType,
    pub flags: u8,
    pub arity: u32,
    pub index: String,
    pub term: String,
    pub integer_term: i64,
    pub weight: i32,
    pub unique_id: u32,
    pub near_distance: u32,
    pub target_hits: u32,
    pub score_threshold: f64,
    pub fuzzy_max_edits: u32,
    pub fuzzy_prefix_length: u32,
    pub distance_threshold: f64,
}

impl StackItem {
    pub fn new(item_type: StackItemType) -> Self {
        StackItem {
            item_type,
            flags: 0,
            arity: 0,
            index: String::new(),
            term: String::new(),
            integer_term: 0,
            weight: 100,
            unique_id: 0,
            near_distance: 0,
            target_hits: 0,
            score_threshold: 0.0,
            fuzzy_max_edits: 0,
            fuzzy_prefix_length: 0,
            distance_threshold: 0.0,
        }
    }

    pub fn connector(item_type: StackItemType, arity: u32) -> Self {
        let mut item = StackItem::new(item_type);
        item.arity = arity;
        item
    }

    pub fn term(item_type: StackItemType, index: &str, term: &str) -> Self {
        let mut item = StackItem::new(item_type);
        item.index = index.to_string();
        item.term = term.to_string();
        item
    }

    pub fn ranked(&self) -> bool {
        self.flags & FLAG_NORANK == 0
    }

    pub fn filter(&self) -> bool {
        self.flags & FLAG_FILTER != 0
    }

    pub fn encode(&self, out: &mut Vec<u8>) {
        out.push(self.item_type.code());
        out.push(self.flags);
        out.extend_from_slice(&self.arity.to_be_bytes());
        encode_string(out, &self.index);
        encode_string(out, &self.term);
        out.extend_from_slice(&self.integer_term.to_be_bytes());
        out.extend_from_slice(&self.weight.to_be_bytes());
        out.extend_from_slice(&self.unique_id.to_be_bytes());
        out.extend_from_slice(&self.near_distance.to_be_bytes());
        out.extend_from_slice(&self.target_hits.to_be_bytes());
        out.extend_from_slice(&self.score_threshold.to_be_bytes());
        out.extend_from_slice(&self.fuzzy_max_edits.to_be_bytes());
        out.extend_from_slice(&self.fuzzy_prefix_length.to_be_bytes());
        out.extend_from_slice(&self.distance_threshold.to_be_bytes());
    }
}

fn encode_string(out: &mut Vec<u8>, value: &str) {
    out.extend_from_slice(&(value.len() as u32).to_be_bytes());
    out.extend_from_slice(value.as_bytes());
}

fn parse_string(input: &[u8]) -> IResult<&[u8], String> {
    let (input, len) = be_u32(input)?;
    let (input, raw) = take(len as usize).parse(input)?;
    Ok((input, String::from_utf8_lossy(raw).into_owned()))
}

fn parse_item(input: &[u8]) -> IResult<&[u8], StackItem> {
    let (input, code) = any_u8(input)?;
    let (input, flags) = any_u8(input)?;
    let (input, arity) = be_u32(input)?;
    let (input, index) = parse_string(input)?;
    let (input, term) = parse_string(input)?;
    let (input, (integer_term, weight, unique_id, near_distance, target_hits)) =
        (be_i64, be_i32, be_u32, be_u32, be_u32).parse(input)?;
    let (input, (score_threshold, fuzzy_max_edits, fuzzy_prefix_length, distance_threshold)) =
        (be_f64, be_u32, be_u32, be_f64).parse(input)?;
    Ok((input, StackItem {
        item_type: StackItemType::from_code(code),
        flags,
        arity,
        index,
        term,
        integer_term,
        weight,
        unique_id,
        near_distance,
        target_hits,
        score_threshold,
        fuzzy_max_edits,
        fuzzy_prefix_length,
        distance_threshold,
    }))
}

/// Forward-only reader over a serialised query stack blob.
pub struct StackIterator<'a> {
    input: &'a [u8],
    current: Option<StackItem>,
}

impl<'a> StackIterator<'a> {
    pub fn new(input: &'a [u8]) -> Self {
        StackIterator { input, current: None }
    }

    /// Advance to the next descriptor; false at end of input or on a
    /// malformed tail (which terminates the build).
    pub fn next(&mut self) -> bool {
        if self.input.is_empty() {
            self.current = None;
            return false;
        }
        match parse_item(self.input) {
            Ok((rest, item)) => {
                self.input = rest;
                self.current = Some(item);
                true
            }
            Err(_) => {
                log::warn!("Malformed query stack tail of {} bytes, stopping", self.input.len());
                self.input = &[];
                self.current = None;
                false
            }
        }
    }

    pub fn current(&self) -> Option<&StackItem> {
        self.current.as_ref()
    }
}

/// Serialise a descriptor sequence back to a stack blob.
pub fn encode_stack(items: &[StackItem]) -> Vec<u8> {
    let mut out = Vec::new();
    for item in items {
        item.encode(&mut out);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_item_round_trip() {
        let mut item = StackItem::term(StackItemType::FuzzyTerm, "title", "drusilla");
        item.weight = 150;
        item.unique_id = 7;
        item.fuzzy_max_edits = 2;
        item.fuzzy_prefix_length = 1;
        item.flags = FLAG_FILTER;
        let mut and = StackItem::connector(StackItemType::And, 1);
        and.near_distance = 0;
        let blob = encode_stack(&[and.clone(), item.clone()]);

        let mut it = StackIterator::new(&blob);
        assert!(it.next());
        assert_eq!(it.current(), Some(&and));
        assert!(it.next());
        assert_eq!(it.current(), Some(&item));
        assert!(!it.next());
    }

    #[test]
    fn test_unknown_type_preserved() {
        let item = StackItem::new(StackItemType::Unknown(99));
        let blob = encode_stack(&[item]);
        let mut it = StackIterator::new(&blob);
        assert!(it.next());
        assert_eq!(it.current().unwrap().item_type, StackItemType::Unknown(99));
    }

    #[test]
    fn test_truncated_input_stops_cleanly() {
        let blob = encode_stack(&[StackItem::term(StackItemType::Term, "a", "b")]);
        let mut it = StackIterator::new(&blob[..blob.len() - 3]);
        assert!(!it.next());
        assert!(it.current().is_none());
    }
}
