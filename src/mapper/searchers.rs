use levenshtein_automata::{Distance, DFA, LevenshteinAutomatonBuilder};
use regex::Regex;
use unicode_segmentation::UnicodeSegmentation;

use crate::core::error::{Error, ErrorKind, Result};
use crate::core::types::{Document, FieldValue};
use crate::mapper::spec::{FieldSearchSpecMap, MatchType};
use crate::query::hit::Hit;
use crate::query::node::{QueryNode, SearchableMut};
use crate::query::term::{QueryTerm, RangeSpec, TermType};

/// Compiled matcher for one text term.
pub struct WordMatcher {
    term_type: TermType,
    term: String,
    regex: Option<Regex>,
    fuzzy: Option<DFA>,
    fuzzy_prefix: String,
}

impl WordMatcher {
    fn compile(term: &QueryTerm) -> Result<WordMatcher> {
        let lowered = term.term.to_lowercase();
        let mut matcher = WordMatcher {
            term_type: term.term_type,
            term: lowered.clone(),
            regex: None,
            fuzzy: None,
            fuzzy_prefix: String::new(),
        };
        match term.term_type {
            TermType::Regex => {
                matcher.regex = Some(Regex::new(&term.term).map_err(|e| {
                    Error::new(ErrorKind::InvalidArgument, format!("bad regex term: {}", e))
                })?);
            }
            TermType::Fuzzy => {
                let prefix: String =
                    lowered.chars().take(term.fuzzy_prefix_length as usize).collect();
                let builder =
                    LevenshteinAutomatonBuilder::new(term.fuzzy_max_edits.min(4) as u8, true);
                matcher.fuzzy = Some(builder.build_dfa(&lowered[prefix.len()..]));
                matcher.fuzzy_prefix = prefix;
            }
            _ => {}
        }
        Ok(matcher)
    }

    pub fn matches(&self, token: &str) -> bool {
        match self.term_type {
            TermType::Word | TermType::Number => token == self.term,
            TermType::Prefix => token.starts_with(&self.term),
            TermType::Suffix => token.ends_with(&self.term),
            TermType::Substring => token.contains(&self.term),
            TermType::Exact => token == self.term,
            TermType::Regex => self.regex.as_ref().is_some_and(|re| re.is_match(token)),
            TermType::Fuzzy => match token.strip_prefix(self.fuzzy_prefix.as_str()) {
                Some(rest) => self
                    .fuzzy
                    .as_ref()
                    .is_some_and(|dfa| matches!(dfa.eval(rest), Distance::Exact(_))),
                None => false,
            },
            _ => false,
        }
    }
}

enum TermSearcher {
    Word(WordMatcher),
    Numeric {
        value: Option<f64>,
        range: Option<RangeSpec>,
    },
    /// Externally evaluated (geo location, nearest neighbor).
    External,
}

struct TermBinding {
    fields: Vec<u32>,
    searcher: TermSearcher,
}

enum Binding {
    Term(TermBinding),
    MultiTerm { fields: Vec<u32> },
    External,
}

/// One element's worth of tokens, with its weight.
struct ElementTokens {
    weight: i32,
    tokens: Vec<String>,
    raw: String,
}

fn tokenize(text: &str) -> Vec<String> {
    text.unicode_words().map(|w| w.to_lowercase()).collect()
}

/// Flatten a field value into elements: one for plain values, one per
/// entry for arrays and weighted sets.
fn elements_of(value: &FieldValue) -> Vec<ElementTokens> {
    match value {
        FieldValue::Text(text) => vec![ElementTokens {
            weight: 1,
            tokens: tokenize(text),
            raw: text.to_lowercase(),
        }],
        FieldValue::Array(entries) => entries
            .iter()
            .map(|entry| match entry {
                FieldValue::Text(text) => ElementTokens {
                    weight: 1,
                    tokens: tokenize(text),
                    raw: text.to_lowercase(),
                },
                other => ElementTokens {
                    weight: 1,
                    tokens: Vec::new(),
                    raw: format!("{:?}", other),
                },
            })
            .collect(),
        FieldValue::WeightedSet(entries) => entries
            .iter()
            .map(|(text, weight)| ElementTokens {
                weight: *weight,
                tokens: tokenize(text),
                raw: text.to_lowercase(),
            })
            .collect(),
        _ => Vec::new(),
    }
}

/// Binds the query's searchable units to field searchers and drives them
/// over each streamed document.
pub struct DocumentMapper {
    bindings: Vec<Binding>,
}

impl DocumentMapper {
    /// Walk the query once, compiling a searcher per (term, field). The
    /// same walk order is used per document, so bindings line up by
    /// ordinal.
    pub fn bind(query: &mut QueryNode, specs: &FieldSearchSpecMap) -> Result<DocumentMapper> {
        let mut bindings = Vec::new();
        let mut error = None;
        query.for_each_searchable_mut(&mut |unit| {
            if error.is_some() {
                return;
            }
            match unit {
                SearchableMut::Term(term) => {
                    let mut fields = specs.field_ids_for_index(&term.index);
                    // Hit lists must fill in field-id order.
                    fields.sort_unstable();
                    if fields.is_empty() {
                        log::warn!("No field bound for index '{}'", term.index);
                    }
                    let searcher = match term.term_type {
                        TermType::GeoLocation | TermType::NearestNeighbor => {
                            TermSearcher::External
                        }
                        TermType::Range | TermType::Number => TermSearcher::Numeric {
                            value: term.term.parse().ok(),
                            range: term.as_range(),
                        },
                        _ => match WordMatcher::compile(term) {
                            Ok(matcher) => TermSearcher::Word(matcher),
                            Err(e) => {
                                error = Some(e);
                                return;
                            }
                        },
                    };
                    bindings.push(Binding::Term(TermBinding { fields, searcher }));
                }
                SearchableMut::MultiTerm(node) => {
                    if let Err(e) = node.build_token_set() {
                        error = Some(e);
                        return;
                    }
                    let mut fields = specs.field_ids_for_index(&node.index);
                    fields.sort_unstable();
                    bindings.push(Binding::MultiTerm { fields });
                }
                SearchableMut::NearestNeighbor(_) => bindings.push(Binding::External),
            }
        });
        match error {
            Some(e) => Err(e),
            None => Ok(DocumentMapper { bindings }),
        }
    }

    /// Reset the query and fill every bound term's hit list from `doc`.
    pub fn search_document(
        &self,
        query: &mut QueryNode,
        specs: &FieldSearchSpecMap,
        doc: &Document,
    ) {
        query.reset();
        let mut ordinal = 0;
        query.for_each_searchable_mut(&mut |unit| {
            let binding = &self.bindings[ordinal];
            ordinal += 1;
            match (unit, binding) {
                (SearchableMut::Term(term), Binding::Term(bound)) => {
                    for field_id in &bound.fields {
                        let Some(spec) = specs.spec(*field_id) else { continue };
                        let Some(value) = doc.get_field(&spec.name) else { continue };
                        search_term_in_field(term, &bound.searcher, *field_id, spec.match_type, value);
                    }
                }
                (SearchableMut::MultiTerm(node), Binding::MultiTerm { fields }) => {
                    for field_id in fields {
                        let Some(spec) = specs.spec(*field_id) else { continue };
                        let Some(value) = doc.get_field(&spec.name) else { continue };
                        search_multi_term_in_field(node, *field_id, spec.match_type, value);
                    }
                }
                _ => {}
            }
        });
    }
}

fn search_term_in_field(
    term: &mut QueryTerm,
    searcher: &TermSearcher,
    field_id: u32,
    match_type: MatchType,
    value: &FieldValue,
) {
    match (match_type, searcher) {
        (MatchType::Numeric, TermSearcher::Numeric { value: wanted, range }) => {
            let numbers: Vec<f64> = match value {
                FieldValue::Array(entries) => entries.iter().filter_map(|v| v.as_number()).collect(),
                other => other.as_number().into_iter().collect(),
            };
            for (element, number) in numbers.iter().enumerate() {
                let matched = match range {
                    Some(range) => range.contains(*number),
                    None => wanted.map(|w| w == *number).unwrap_or(false),
                };
                if matched {
                    term.add_hit(Hit::new(field_id, element as u32, 1, 1, 0));
                }
            }
        }
        (MatchType::Exact, TermSearcher::Word(matcher)) => {
            for (element, tokens) in elements_of(value).into_iter().enumerate() {
                if matcher.matches(&tokens.raw) {
                    term.add_hit(Hit::new(field_id, element as u32, tokens.weight, 1, 0));
                }
            }
            term.set_field_length(field_id, 1);
        }
        (MatchType::Text, TermSearcher::Word(matcher)) => {
            let mut field_length = 0;
            for (element, element_tokens) in elements_of(value).into_iter().enumerate() {
                let length = element_tokens.tokens.len() as u32;
                field_length += length;
                if matcher.term_type == TermType::Exact {
                    if matcher.matches(&element_tokens.raw) {
                        term.add_hit(Hit::new(field_id, element as u32, element_tokens.weight, length, 0));
                    }
                    continue;
                }
                for (position, token) in element_tokens.tokens.iter().enumerate() {
                    if matcher.matches(token) {
                        term.add_hit(Hit::new(
                            field_id,
                            element as u32,
                            element_tokens.weight,
                            length,
                            position as u32,
                        ));
                    }
                }
            }
            term.set_field_length(field_id, field_length);
        }
        _ => {}
    }
}

fn search_multi_term_in_field(
    node: &mut crate::query::node::MultiTermNode,
    field_id: u32,
    match_type: MatchType,
    value: &FieldValue,
) {
    for (element, element_tokens) in elements_of(value).into_iter().enumerate() {
        let length = element_tokens.tokens.len() as u32;
        if match_type == MatchType::Exact || element_tokens.tokens.is_empty() {
            if node.matches_token(&element_tokens.raw) {
                if let Some(term) = node.term_for_token_mut(&element_tokens.raw) {
                    term.add_hit(Hit::new(field_id, element as u32, element_tokens.weight, 1, 0));
                }
            }
            continue;
        }
        for (position, token) in element_tokens.tokens.iter().enumerate() {
            if node.matches_token(token) {
                if let Some(term) = node.term_for_token_mut(token) {
                    term.add_hit(Hit::new(
                        field_id,
                        element as u32,
                        element_tokens.weight,
                        length,
                        position as u32,
                    ));
                }
            }
        }
    }
}
