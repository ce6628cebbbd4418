use std::collections::HashMap;
use std::sync::Arc;

use crate::query::builder::BuildEnv;
use crate::query::near::{ElementGaps, SharedElementGaps};
use crate::rank::processor::RankView;

/// How a field's searcher matches terms against values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchType {
    /// Tokenised word matching.
    Text,
    /// Whole-value string matching.
    Exact,
    Numeric,
}

#[derive(Debug, Clone)]
pub struct FieldSearchSpec {
    pub field_id: u32,
    pub name: String,
    pub match_type: MatchType,
    /// Positions continue across element boundaries with this gap; absent
    /// means no cross-element near matching.
    pub element_gap: Option<u32>,
}

/// Field-to-searcher configuration: which fields exist, how they match,
/// and which index (field-set) names expand to which fields.
#[derive(Debug, Default)]
pub struct FieldSearchSpecMap {
    specs: Vec<FieldSearchSpec>,
    by_name: HashMap<String, u32>,
    index_map: HashMap<String, Vec<String>>,
    pub rewrite_float_terms: bool,
}

impl FieldSearchSpecMap {
    pub fn new() -> Self {
        FieldSearchSpecMap { rewrite_float_terms: true, ..FieldSearchSpecMap::default() }
    }

    pub fn add_field(&mut self, name: impl Into<String>, match_type: MatchType) -> u32 {
        self.add_field_with_gap(name, match_type, None)
    }

    pub fn add_field_with_gap(
        &mut self,
        name: impl Into<String>,
        match_type: MatchType,
        element_gap: Option<u32>,
    ) -> u32 {
        let name = name.into();
        let field_id = self.specs.len() as u32;
        self.by_name.insert(name.clone(), field_id);
        self.specs.push(FieldSearchSpec { field_id, name, match_type, element_gap });
        field_id
    }

    /// Register a field-set: an index name expanding to several fields.
    pub fn add_index(&mut self, index: impl Into<String>, fields: &[&str]) {
        self.index_map
            .insert(index.into(), fields.iter().map(|f| f.to_string()).collect());
    }

    pub fn spec(&self, field_id: u32) -> Option<&FieldSearchSpec> {
        self.specs.get(field_id as usize)
    }

    pub fn num_fields(&self) -> usize {
        self.specs.len()
    }

    pub fn field_ids_for_index(&self, index: &str) -> Vec<u32> {
        if let Some(fields) = self.index_map.get(index) {
            return fields
                .iter()
                .filter_map(|name| self.by_name.get(name))
                .copied()
                .collect();
        }
        match self.by_name.get(index) {
            Some(field_id) => vec![*field_id],
            None => Vec::new(),
        }
    }

    pub fn element_gaps(&self) -> SharedElementGaps {
        let mut gaps = ElementGaps::new();
        for spec in &self.specs {
            if let Some(gap) = spec.element_gap {
                gaps.set(spec.field_id, gap);
            }
        }
        Arc::new(gaps)
    }
}

impl BuildEnv for FieldSearchSpecMap {
    fn rewrite_float_terms(&self) -> bool {
        self.rewrite_float_terms
    }

    fn is_text_index(&self, index: &str) -> bool {
        self.field_ids_for_index(index)
            .iter()
            .any(|id| matches!(self.spec(*id).map(|s| s.match_type), Some(MatchType::Text)))
    }

    fn element_gaps(&self) -> SharedElementGaps {
        FieldSearchSpecMap::element_gaps(self)
    }
}

impl RankView for FieldSearchSpecMap {
    fn fields_for_index(&self, index: &str) -> Vec<u32> {
        self.field_ids_for_index(index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_index_expansion() {
        let mut map = FieldSearchSpecMap::new();
        let title = map.add_field("title", MatchType::Text);
        let body = map.add_field("body", MatchType::Text);
        map.add_field("year", MatchType::Numeric);
        map.add_index("default", &["title", "body"]);
        assert_eq!(map.field_ids_for_index("default"), vec![title, body]);
        assert_eq!(map.field_ids_for_index("title"), vec![title]);
        assert!(map.field_ids_for_index("missing").is_empty());
    }

    #[test]
    fn test_text_index_detection() {
        let mut map = FieldSearchSpecMap::new();
        map.add_field("title", MatchType::Text);
        map.add_field("year", MatchType::Numeric);
        assert!(map.is_text_index("title"));
        assert!(!map.is_text_index("year"));
    }

    #[test]
    fn test_element_gaps_from_specs() {
        let mut map = FieldSearchSpecMap::new();
        let field = map.add_field_with_gap("paragraphs", MatchType::Text, Some(1));
        map.add_field("title", MatchType::Text);
        let gaps = FieldSearchSpecMap::element_gaps(&map);
        assert_eq!(gaps.get(field), Some(1));
        assert_eq!(gaps.get(field + 1), None);
    }
}
