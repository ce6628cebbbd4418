use serde::{Serialize, Deserialize};

use crate::core::types::DocId;

/// Named feature values for one set of documents, row-major.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FeatureSet {
    pub names: Vec<String>,
    pub doc_ids: Vec<u32>,
    pub values: Vec<f64>,
}

impl FeatureSet {
    pub fn new(names: Vec<String>) -> Self {
        FeatureSet { names, doc_ids: Vec::new(), values: Vec::new() }
    }

    pub fn add_doc(&mut self, doc_id: u32, values: Vec<f64>) {
        debug_assert_eq!(values.len(), self.names.len());
        self.doc_ids.push(doc_id);
        self.values.extend(values);
    }

    pub fn num_docs(&self) -> usize {
        self.doc_ids.len()
    }

    pub fn values_for(&self, doc_id: u32) -> Option<&[f64]> {
        let idx = self.doc_ids.iter().position(|d| *d == doc_id)?;
        let width = self.names.len();
        Some(&self.values[idx * width..(idx + 1) * width])
    }
}

/// Flat per-hit feature rows, aligned with the emitted hit order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FeatureValues {
    pub names: Vec<String>,
    pub values: Vec<f64>,
}

impl FeatureValues {
    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchResultHit {
    pub lid: DocId,
    pub doc_id: String,
    pub rank: f64,
    pub sort_key: Option<Vec<u8>>,
}

/// The single message a worker emits when its document stream ends.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SearchResult {
    pub hits: Vec<SearchResultHit>,
    pub total_hit_count: u64,
    pub match_features: FeatureValues,
}

impl SearchResult {
    pub fn new() -> Self {
        SearchResult::default()
    }

    pub fn add_hit(&mut self, lid: DocId, doc_id: &str, rank: f64, sort_key: Option<&[u8]>) {
        self.hits.push(SearchResultHit {
            lid,
            doc_id: doc_id.to_string(),
            rank,
            sort_key: sort_key.map(|k| k.to_vec()),
        });
    }

    pub fn set_match_features(&mut self, features: FeatureValues) {
        self.match_features = features;
    }
}

/// Rendered summary payloads accompanying a search result.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DocumentSummary {
    pub summary_class: String,
    pub entries: Vec<SummaryEntry>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SummaryEntry {
    pub doc_id: String,
    pub blob: Vec<u8>,
}

impl DocumentSummary {
    pub fn new(summary_class: impl Into<String>) -> Self {
        DocumentSummary { summary_class: summary_class.into(), entries: Vec::new() }
    }

    pub fn add(&mut self, doc_id: &str, blob: Vec<u8>) {
        self.entries.push(SummaryEntry { doc_id: doc_id.to_string(), blob });
    }
}
