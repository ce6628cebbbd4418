use std::cmp::Ordering;
use std::sync::Arc;

use crate::core::types::{DocId, Document};
use crate::rank::match_data::{MatchData, TermFieldMatchData};
use crate::rank::program::RankProgram;
use crate::search::result::{FeatureSet, FeatureValues, SearchResult};

/// One retained hit: the document, its score, a captured copy of the
/// per-term match data (the live buffers are overwritten every document)
/// and the optional byte-comparable sort key.
pub struct CollectedHit {
    lid: u32,
    score: f64,
    document: Arc<Document>,
    match_data: Vec<TermFieldMatchData>,
    sort_key: Option<Vec<u8>>,
}

impl CollectedHit {
    pub fn lid(&self) -> u32 {
        self.lid
    }

    pub fn score(&self) -> f64 {
        self.score
    }

    pub fn document(&self) -> &Document {
        &self.document
    }

    pub fn match_data(&self) -> &[TermFieldMatchData] {
        &self.match_data
    }

    pub fn sort_key(&self) -> Option<&[u8]> {
        self.sort_key.as_deref()
    }

    /// Negative when `self` is better: higher score wins, ties break on
    /// smaller lid.
    fn cmp_rank(&self, other: &CollectedHit) -> Ordering {
        other
            .score
            .partial_cmp(&self.score)
            .unwrap_or(Ordering::Equal)
            .then_with(|| self.lid.cmp(&other.lid))
    }

    /// Byte comparison of sort-key prefixes; shorter is smaller on equal
    /// prefix; lid breaks the final tie.
    fn cmp_sort(&self, other: &CollectedHit) -> Ordering {
        let a = self.sort_key.as_deref().unwrap_or(&[]);
        let b = other.sort_key.as_deref().unwrap_or(&[]);
        a.cmp(b).then_with(|| self.lid.cmp(&other.lid))
    }

    fn is_better_than(&self, other: &CollectedHit) -> bool {
        let ord = if self.sort_key.is_none() {
            self.cmp_rank(other)
        } else {
            self.cmp_sort(other)
        };
        ord == Ordering::Less
    }
}

/// Bounded collector for the K best hits, ordered by rank score or sort
/// key. Below capacity it is an unordered vector; at capacity it becomes a
/// heap with the worst retained hit at the root.
pub struct HitCollector {
    hits: Vec<CollectedHit>,
    capacity: usize,
    sorted_by_docid: bool,
}

fn worse(a: &CollectedHit, b: &CollectedHit) -> bool {
    // Heap ordering: the "greatest" element is the worst hit.
    b.is_better_than(a)
}

fn sift_down(hits: &mut [CollectedHit], mut root: usize) {
    let len = hits.len();
    loop {
        let left = 2 * root + 1;
        if left >= len {
            break;
        }
        let mut largest = root;
        if worse(&hits[largest], &hits[left]) {
            largest = left;
        }
        let right = left + 1;
        if right < len && worse(&hits[largest], &hits[right]) {
            largest = right;
        }
        if largest == root {
            break;
        }
        hits.swap(root, largest);
        root = largest;
    }
}

fn sift_up(hits: &mut [CollectedHit], mut child: usize) {
    while child > 0 {
        let parent = (child - 1) / 2;
        if worse(&hits[parent], &hits[child]) {
            hits.swap(parent, child);
            child = parent;
        } else {
            break;
        }
    }
}

impl HitCollector {
    pub fn new(capacity: usize) -> Self {
        HitCollector {
            hits: Vec::with_capacity(capacity),
            capacity,
            sorted_by_docid: true,
        }
    }

    pub fn num_hits(&self) -> usize {
        self.hits.len()
    }

    pub fn hits(&self) -> &[CollectedHit] {
        &self.hits
    }

    /// Add a hit; hits must arrive in increasing lid order. Returns whether
    /// the hit entered the result set.
    pub fn add_hit(
        &mut self,
        document: Arc<Document>,
        lid: DocId,
        match_data: &MatchData,
        score: f64,
        sort_key: Option<&[u8]>,
    ) -> bool {
        let hit = CollectedHit {
            lid: lid.0,
            score,
            document,
            match_data: match_data.snapshot(),
            sort_key: sort_key.map(|k| k.to_vec()),
        };
        if self.capacity == 0 {
            return false;
        }
        let avail = self.capacity - self.hits.len();
        if avail > 1 {
            self.hits.push(hit);
            true
        } else if avail == 1 {
            self.hits.push(hit);
            let len = self.hits.len();
            for i in (0..len / 2).rev() {
                sift_down(&mut self.hits, i);
            }
            self.sorted_by_docid = false;
            true
        } else if hit.is_better_than(&self.hits[0]) {
            // Pop the worst from the heap root, replace, re-establish.
            let len = self.hits.len();
            self.hits.swap(0, len - 1);
            sift_down(&mut self.hits[..len - 1], 0);
            self.hits[len - 1] = hit;
            sift_up(&mut self.hits, len - 1);
            true
        } else {
            false
        }
    }

    /// Restore ascending lid order; required before emitting results.
    pub fn sort_by_docid(&mut self) {
        if !self.sorted_by_docid {
            self.hits.sort_by_key(|h| h.lid);
            self.sorted_by_docid = true;
        }
    }

    /// The retained document for a lid, for summary rendering.
    pub fn get_doc_sum(&self, lid: DocId) -> Option<&Document> {
        self.hits
            .iter()
            .find(|h| h.lid == lid.0)
            .map(|h| h.document.as_ref())
    }

    /// Write the sorted hits into a result message.
    pub fn fill_result(&mut self, result: &mut SearchResult, match_features: Option<FeatureValues>) {
        self.sort_by_docid();
        for hit in &self.hits {
            result.add_hit(DocId(hit.lid), hit.document.id.as_str(), hit.score, hit.sort_key());
        }
        if let Some(features) = match_features {
            result.set_match_features(features);
        }
    }

    /// Run the rank program once per retained hit and extract values.
    pub fn get_feature_set(&mut self, program: &mut dyn RankProgram) -> FeatureSet {
        let mut out = FeatureSet::new(program.feature_names().to_vec());
        if out.names.is_empty() || self.hits.is_empty() {
            return out;
        }
        self.sort_by_docid();
        for hit in &self.hits {
            program.run(hit.lid, &hit.match_data);
            out.add_doc(hit.lid, program.feature_values());
        }
        out
    }

    pub fn get_match_features(&mut self, program: &mut dyn RankProgram) -> FeatureValues {
        let mut out = FeatureValues::default();
        if self.hits.is_empty() {
            return out;
        }
        self.sort_by_docid();
        out.names = program.feature_names().to_vec();
        out.values.reserve(out.names.len() * self.hits.len());
        for hit in &self.hits {
            program.run(hit.lid, &hit.match_data);
            out.values.extend(program.feature_values());
        }
        out
    }
}
