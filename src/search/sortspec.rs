use nom::IResult;
use nom::Parser;
use nom::bytes::complete::take_while1;
use nom::character::complete::{multispace0, one_of};
use nom::combinator::opt;
use nom::multi::many1;
use nom::sequence::preceded;

use crate::core::error::{Error, ErrorKind, Result};
use crate::core::types::{Document, FieldValue};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortOrder {
    Ascending,
    Descending,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SortField {
    pub order: SortOrder,
    pub field: String,
}

/// Parsed `sort` parameter: `+field` / `-field` entries, `+` implied.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SortSpec {
    pub fields: Vec<SortField>,
}

fn parse_field(input: &str) -> IResult<&str, SortField> {
    let (input, sign) = preceded(multispace0, opt(one_of("+-"))).parse(input)?;
    let (input, name) =
        take_while1(|c: char| c.is_alphanumeric() || c == '_' || c == '.').parse(input)?;
    let order = match sign {
        Some('-') => SortOrder::Descending,
        _ => SortOrder::Ascending,
    };
    Ok((input, SortField { order, field: name.to_string() }))
}

impl SortSpec {
    pub fn parse(spec: &str) -> Result<SortSpec> {
        if spec.trim().is_empty() {
            return Ok(SortSpec::default());
        }
        match many1(parse_field).parse(spec) {
            Ok((rest, fields)) if rest.trim().is_empty() => Ok(SortSpec { fields }),
            _ => Err(Error::new(ErrorKind::Parse, format!("bad sort spec '{}'", spec))),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Byte-comparable key: ascending memcmp order over the encoded key
    /// equals the requested document order. Descending fields are byte
    /// complemented.
    pub fn encode_key(&self, doc: &Document) -> Vec<u8> {
        let mut key = Vec::new();
        for field in &self.fields {
            let start = key.len();
            match doc.get_field(&field.field) {
                Some(FieldValue::Text(text)) => {
                    key.extend_from_slice(text.as_bytes());
                    key.push(0);
                }
                Some(FieldValue::Number(n)) => encode_f64(*n, &mut key),
                Some(FieldValue::Integer(i)) => encode_f64(*i as f64, &mut key),
                Some(FieldValue::Boolean(b)) => key.push(*b as u8),
                _ => {}
            }
            if field.order == SortOrder::Descending {
                for byte in &mut key[start..] {
                    *byte = !*byte;
                }
            }
        }
        key
    }
}

/// IEEE-754 bits rearranged so unsigned byte order equals numeric order.
fn encode_f64(value: f64, out: &mut Vec<u8>) {
    let bits = value.to_bits();
    let ordered = if bits & (1 << 63) != 0 { !bits } else { bits | (1 << 63) };
    out.extend_from_slice(&ordered.to_be_bytes());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::DocumentId;

    fn doc_with_number(value: f64) -> Document {
        let mut doc = Document::new(DocumentId::new("id:test:doc::1"));
        doc.add_field("price", FieldValue::Number(value));
        doc
    }

    #[test]
    fn test_parse_signs_and_names() {
        let spec = SortSpec::parse("+price -title.raw year").unwrap();
        assert_eq!(spec.fields.len(), 3);
        assert_eq!(spec.fields[0].order, SortOrder::Ascending);
        assert_eq!(spec.fields[1].order, SortOrder::Descending);
        assert_eq!(spec.fields[1].field, "title.raw");
        assert_eq!(spec.fields[2].order, SortOrder::Ascending);
        assert!(SortSpec::parse("???").is_err());
    }

    #[test]
    fn test_numeric_keys_are_byte_comparable() {
        let spec = SortSpec::parse("+price").unwrap();
        let low = spec.encode_key(&doc_with_number(-3.5));
        let mid = spec.encode_key(&doc_with_number(0.0));
        let high = spec.encode_key(&doc_with_number(1000.25));
        assert!(low < mid && mid < high);
    }

    #[test]
    fn test_descending_complements_bytes() {
        let asc = SortSpec::parse("+price").unwrap();
        let desc = SortSpec::parse("-price").unwrap();
        let a = asc.encode_key(&doc_with_number(1.0));
        let d = desc.encode_key(&doc_with_number(1.0));
        let flipped: Vec<u8> = a.iter().map(|b| !b).collect();
        assert_eq!(d, flipped);
        // Bigger numbers sort first under descending keys.
        let small = desc.encode_key(&doc_with_number(1.0));
        let big = desc.encode_key(&doc_with_number(2.0));
        assert!(big < small);
    }

    #[test]
    fn test_text_keys_order_lexicographically() {
        let spec = SortSpec::parse("+name").unwrap();
        let mut a = Document::new(DocumentId::new("id:t:d::1"));
        a.add_field("name", FieldValue::Text("alpha".into()));
        let mut b = Document::new(DocumentId::new("id:t:d::2"));
        b.add_field("name", FieldValue::Text("beta".into()));
        assert!(spec.encode_key(&a) < spec.encode_key(&b));
    }
}
