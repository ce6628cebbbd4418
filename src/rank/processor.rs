use std::sync::Arc;

use crate::core::types::{DocId, Document};
use crate::query::hit::HitList;
use crate::query::node::{ConnectorKind, MultiTermKind, QueryNode};
use crate::query::term::QueryTerm;
use crate::rank::match_data::{
    MatchData, MatchDataLayout, TermData, TermFieldData, TermFieldMatchDataPosition,
    UNKNOWN_FIELD_LENGTH,
};
use crate::rank::program::{NativeRankProgram, RankProgram};
use crate::search::collector::HitCollector;
use crate::search::result::{FeatureSet, FeatureValues, SearchResult};

/// Maps an index (field or field-set) name to the field ids the ranker
/// reads for it.
pub trait RankView {
    fn fields_for_index(&self, index: &str) -> Vec<u32>;
}

impl RankView for std::collections::HashMap<String, Vec<u32>> {
    fn fields_for_index(&self, index: &str) -> Vec<u32> {
        self.get(index).cloned().unwrap_or_default()
    }
}

/// Two-phase ranking as an explicit state machine; there is no hidden
/// suspension between the phases.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RankPhase {
    Building,
    Matching,
    SecondPhase,
    Emitting,
}

pub struct RankPrograms {
    pub ranking: Box<dyn RankProgram>,
    pub summary: Option<Box<dyn RankProgram>>,
    pub match_features: Option<Box<dyn RankProgram>>,
}

/// Drives rank programs over one document stream: binds term data and
/// match-data handles up front, unpacks term hit lists per document, runs
/// the configured program and hands scores to the hit collector it owns.
pub struct RankProcessor {
    match_data: MatchData,
    term_data: Vec<TermData>,
    programs: RankPrograms,
    score: f64,
    doc_id: u32,
    hit_collector: HitCollector,
    phase: RankPhase,
}

impl RankProcessor {
    /// Ranking setup: native programs for scoring, summary features and
    /// match features.
    pub fn new_for_ranking(query: &QueryNode, view: &dyn RankView, wanted_hits: usize) -> Self {
        Self::with_programs(query, view, wanted_hits, None, true)
    }

    /// Dump setup (queryflags feature dump): one program evaluated for
    /// feature extraction only.
    pub fn new_for_dumping(query: &QueryNode, view: &dyn RankView, wanted_hits: usize) -> Self {
        Self::with_programs(query, view, wanted_hits, None, false)
    }

    pub fn with_programs(
        query: &QueryNode,
        view: &dyn RankView,
        wanted_hits: usize,
        programs: Option<RankPrograms>,
        with_match_features: bool,
    ) -> Self {
        let mut layout = MatchDataLayout::new();
        let mut term_data = Vec::new();
        init_walk(query, view, &mut layout, &mut term_data);
        let programs = programs.unwrap_or_else(|| RankPrograms {
            ranking: Box::new(NativeRankProgram::new(term_data.clone())),
            summary: Some(Box::new(NativeRankProgram::new(term_data.clone()))),
            match_features: if with_match_features {
                Some(Box::new(NativeRankProgram::new(term_data.clone())))
            } else {
                None
            },
        });
        let mut match_data = layout.create_match_data();
        // Interleaved features (field_length, num_occs) are maintained
        // while positions are appended.
        for handle in 0..match_data.num_term_fields() {
            match_data.resolve_term_field(handle).set_needs_interleaved(true);
        }
        RankProcessor {
            match_data,
            term_data,
            programs,
            score: 0.0,
            doc_id: 0,
            hit_collector: HitCollector::new(wanted_hits),
            phase: RankPhase::Building,
        }
    }

    pub fn phase(&self) -> RankPhase {
        self.phase
    }

    pub fn num_term_data(&self) -> usize {
        self.term_data.len()
    }

    pub fn match_data(&self) -> &MatchData {
        &self.match_data
    }

    pub fn hit_collector(&self) -> &HitCollector {
        &self.hit_collector
    }

    pub fn hit_collector_mut(&mut self) -> &mut HitCollector {
        &mut self.hit_collector
    }

    /// Copy every ranked term's hit list into the shared match data. The
    /// first document moves the processor out of its building phase.
    pub fn unpack_match_data(&mut self, doc_id: DocId, query: &mut QueryNode) {
        debug_assert!(matches!(self.phase, RankPhase::Building | RankPhase::Matching));
        self.phase = RankPhase::Matching;
        self.doc_id = doc_id.0;
        let mut ordinal = 0;
        unpack_walk(query, &self.term_data, &mut ordinal, &mut self.match_data, doc_id.0);
        debug_assert_eq!(ordinal, self.term_data.len());
    }

    /// Evaluate the rank program; non-finite scores clamp to `-inf`.
    pub fn run_rank_program(&mut self, doc_id: DocId) {
        debug_assert!(matches!(self.phase, RankPhase::Building | RankPhase::Matching));
        self.phase = RankPhase::Matching;
        self.programs.ranking.run(doc_id.0, self.match_data.term_fields());
        let score = self.programs.ranking.score();
        self.score = if score.is_finite() { score } else { f64::NEG_INFINITY };
    }

    pub fn score(&self) -> f64 {
        self.score
    }

    pub fn add_hit(&mut self, document: Arc<Document>, lid: DocId, sort_key: Option<&[u8]>) -> bool {
        debug_assert!(matches!(self.phase, RankPhase::Building | RankPhase::Matching));
        self.phase = RankPhase::Matching;
        self.hit_collector
            .add_hit(document, lid, &self.match_data, self.score, sort_key)
    }

    /// Summary features for the retained hits; enters the second phase.
    pub fn calculate_feature_set(&mut self) -> FeatureSet {
        self.phase = RankPhase::SecondPhase;
        let program = self
            .programs
            .summary
            .as_deref_mut()
            .unwrap_or(self.programs.ranking.as_mut());
        self.hit_collector.get_feature_set(program)
    }

    pub fn calculate_match_features(&mut self) -> FeatureValues {
        self.phase = RankPhase::SecondPhase;
        match self.programs.match_features.as_deref_mut() {
            Some(program) => self.hit_collector.get_match_features(program),
            None => FeatureValues::default(),
        }
    }

    /// Emit the sorted hits (and match features when configured) into the
    /// result message. Ends the stream for this processor.
    pub fn fill_search_result(&mut self, result: &mut SearchResult) {
        let features = if self.programs.match_features.is_some() {
            Some(self.calculate_match_features())
        } else {
            None
        };
        self.phase = RankPhase::Emitting;
        self.hit_collector.fill_result(result, features);
    }
}

fn register_term(
    term: &QueryTerm,
    phrase_length: u32,
    view: &dyn RankView,
    layout: &mut MatchDataLayout,
    out: &mut Vec<TermData>,
) {
    let mut td = TermData {
        weight: term.weight,
        unique_id: term.unique_id,
        phrase_length,
        query_tensor_name: None,
        fields: Vec::new(),
    };
    let fields = view.fields_for_index(&term.index);
    if fields.is_empty() {
        log::warn!("No view for index '{}'; ranking no fields", term.index);
    }
    for field_id in fields {
        td.fields.push(TermFieldData { field_id, handle: layout.alloc_term_field() });
    }
    out.push(td);
}

/// Registers one term data per ranked leaf; a phrase counts as a single
/// term anchored at its first child.
fn init_walk(
    node: &QueryNode,
    view: &dyn RankView,
    layout: &mut MatchDataLayout,
    out: &mut Vec<TermData>,
) {
    match node {
        QueryNode::Term(t) => {
            if t.ranked {
                register_term(t, 1, view, layout, out);
            }
        }
        QueryNode::Connector(c) if c.kind == ConnectorKind::Phrase => {
            if let Some(QueryNode::Term(first)) = c.children.first() {
                if first.ranked {
                    register_term(first, c.children.len() as u32, view, layout, out);
                }
            }
        }
        QueryNode::Connector(c) => {
            for child in &c.children {
                init_walk(child, view, layout, out);
            }
        }
        QueryNode::MultiTerm(m) => {
            if m.terms.iter().any(|t| t.ranked) {
                let weight = m.terms.iter().map(|t| t.weight).max().unwrap_or(100);
                let mut td = TermData {
                    weight,
                    unique_id: 0,
                    phrase_length: 1,
                    query_tensor_name: None,
                    fields: Vec::new(),
                };
                for field_id in view.fields_for_index(&m.index) {
                    td.fields.push(TermFieldData { field_id, handle: layout.alloc_term_field() });
                }
                out.push(td);
            }
        }
        QueryNode::NearestNeighbor(n) => {
            let mut td = TermData {
                weight: n.weight,
                unique_id: n.unique_id,
                phrase_length: 1,
                query_tensor_name: Some(n.query_tensor_name.clone()),
                fields: Vec::new(),
            };
            for field_id in view.fields_for_index(&n.field) {
                td.fields.push(TermFieldData { field_id, handle: layout.alloc_term_field() });
            }
            out.push(td);
        }
        QueryNode::True | QueryNode::False => {}
    }
}

fn unpack_hits(
    hits: &HitList,
    field_length_of: &dyn Fn(u32) -> Option<u32>,
    pos_adjust: u32,
    td: &TermData,
    match_data: &mut MatchData,
    doc_id: u32,
) {
    let mut last_field: Option<u32> = None;
    let mut handle = None;
    let mut field_length = UNKNOWN_FIELD_LENGTH;
    for hit in hits {
        if last_field != Some(hit.field_id) {
            field_length = field_length_of(hit.field_id).unwrap_or(UNKNOWN_FIELD_LENGTH);
            handle = td.lookup_field(hit.field_id).map(|f| f.handle);
            if let Some(h) = handle {
                let tmd = match_data.resolve_term_field(h);
                tmd.field_id = hit.field_id;
                if tmd.doc_id() != doc_id {
                    tmd.reset(doc_id);
                    tmd.weight = td.weight;
                }
                if field_length != UNKNOWN_FIELD_LENGTH {
                    tmd.set_field_length(field_length);
                }
            }
            last_field = Some(hit.field_id);
        }
        if let Some(h) = handle {
            // Phrase positions are adjusted so they equal the first term's.
            match_data.resolve_term_field(h).append_position(TermFieldMatchDataPosition {
                element_id: hit.element_id,
                position: hit.position.saturating_sub(pos_adjust),
                element_weight: hit.element_weight,
                element_length: field_length,
            });
        }
    }
}

/// Mirrors `init_walk`, consuming term-data ordinals in the same order.
fn unpack_walk(
    node: &mut QueryNode,
    term_data: &[TermData],
    ordinal: &mut usize,
    match_data: &mut MatchData,
    doc_id: u32,
) {
    match node {
        QueryNode::Term(t) => {
            if !t.ranked {
                return;
            }
            let td = &term_data[*ordinal];
            *ordinal += 1;
            if !t.hits().is_empty() {
                let lengths: Vec<Option<u32>> = (0..t.num_field_infos() as u32)
                    .map(|f| t.field_info(f).map(|i| i.field_length))
                    .collect();
                let hits = t.hits().clone();
                unpack_hits(
                    &hits,
                    &|f| lengths.get(f as usize).copied().flatten(),
                    0,
                    td,
                    match_data,
                    doc_id,
                );
            }
        }
        QueryNode::Connector(c) if c.kind == ConnectorKind::Phrase => {
            let first_ranked = matches!(c.children.first(), Some(QueryNode::Term(t)) if t.ranked);
            if !first_ranked {
                return;
            }
            let td = &term_data[*ordinal];
            *ordinal += 1;
            let mut hits = HitList::new();
            c.evaluate_hits(&mut hits);
            if !hits.is_empty() {
                let pos_adjust = c.children.len().saturating_sub(1) as u32;
                let lengths: Vec<Option<u32>> = (0..hits.iter().map(|h| h.field_id + 1).max().unwrap_or(0))
                    .map(|f| c.field_info(f).map(|i| i.field_length))
                    .collect();
                unpack_hits(
                    &hits,
                    &|f| lengths.get(f as usize).copied().flatten(),
                    pos_adjust,
                    td,
                    match_data,
                    doc_id,
                );
            }
        }
        QueryNode::Connector(c) => {
            for child in &mut c.children {
                unpack_walk(child, term_data, ordinal, match_data, doc_id);
            }
        }
        QueryNode::MultiTerm(m) => {
            if !m.terms.iter().any(|t| t.ranked) {
                return;
            }
            let td = &term_data[*ordinal];
            *ordinal += 1;
            match m.kind {
                MultiTermKind::DotProduct | MultiTermKind::Wand => {
                    let raw = m.raw_score();
                    if raw != 0.0 {
                        if let Some(field) = td.fields.first() {
                            match_data.resolve_term_field(field.handle).set_raw_score(doc_id, raw);
                        }
                    }
                }
                _ => {
                    let mut hits = HitList::new();
                    m.evaluate_hits(&mut hits);
                    if !hits.is_empty() {
                        let terms = &m.terms;
                        unpack_hits(
                            &hits,
                            &|f| {
                                terms
                                    .iter()
                                    .find_map(|t| t.field_info(f).map(|i| i.field_length))
                            },
                            0,
                            td,
                            match_data,
                            doc_id,
                        );
                    }
                }
            }
        }
        QueryNode::NearestNeighbor(n) => {
            let td = &term_data[*ordinal];
            *ordinal += 1;
            if let Some(raw) = n.raw_score() {
                if let Some(field) = td.fields.first() {
                    match_data.resolve_term_field(field.handle).set_raw_score(doc_id, raw);
                }
            }
        }
        QueryNode::True | QueryNode::False => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::DocumentId;
    use crate::query::hit::Hit;
    use crate::query::node::ConnectorNode;
    use crate::query::term::TermType;
    use std::collections::HashMap;

    fn view() -> HashMap<String, Vec<u32>> {
        let mut map = HashMap::new();
        map.insert("title".to_string(), vec![0]);
        map.insert("body".to_string(), vec![1]);
        map
    }

    fn doc(lid: u32) -> Arc<Document> {
        Arc::new(Document::new(DocumentId::new(format!("id:test:doc::{}", lid))))
    }

    fn term_node(index: &str, word: &str) -> QueryNode {
        QueryNode::Term(Box::new(QueryTerm::new(index, word, TermType::Word)))
    }

    #[test]
    fn test_ranked_terms_get_term_data() {
        let mut and = ConnectorNode::new(ConnectorKind::And);
        and.add_child(term_node("title", "a"));
        let mut unranked = QueryTerm::new("body", "b", TermType::Word);
        unranked.ranked = false;
        and.add_child(QueryNode::Term(Box::new(unranked)));
        let query = QueryNode::Connector(Box::new(and));
        let processor = RankProcessor::new_for_ranking(&query, &view(), 10);
        assert_eq!(processor.num_term_data(), 1);
        assert_eq!(processor.match_data().num_term_fields(), 1);
    }

    #[test]
    fn test_unpack_copies_hits_into_match_data() {
        let mut term = QueryTerm::new("title", "a", TermType::Word);
        term.set_field_length(0, 12);
        term.add_hit(Hit::new(0, 0, 7, 12, 3));
        let mut query = QueryNode::Term(Box::new(term));
        let mut processor = RankProcessor::new_for_ranking(&query, &view(), 10);
        processor.unpack_match_data(DocId(5), &mut query);
        let tmd = processor.match_data().term_field(0);
        assert_eq!(tmd.doc_id(), 5);
        assert_eq!(tmd.positions().len(), 1);
        let pos = tmd.positions()[0];
        assert_eq!((pos.position, pos.element_weight, pos.element_length), (3, 7, 12));
    }

    #[test]
    fn test_phrase_unpacks_first_term_position() {
        let mut a = QueryTerm::new("title", "x", TermType::Word);
        a.add_hit(Hit::new(0, 0, 1, 10, 3));
        let mut b = QueryTerm::new("title", "y", TermType::Word);
        b.add_hit(Hit::new(0, 0, 1, 10, 4));
        let mut phrase = ConnectorNode::new(ConnectorKind::Phrase);
        phrase.add_child(QueryNode::Term(Box::new(a)));
        phrase.add_child(QueryNode::Term(Box::new(b)));
        let mut query = QueryNode::Connector(Box::new(phrase));
        let mut processor = RankProcessor::new_for_ranking(&query, &view(), 10);
        assert_eq!(processor.num_term_data(), 1);
        processor.unpack_match_data(DocId(1), &mut query);
        let tmd = processor.match_data().term_field(0);
        // Phrase hit is at the last term (4); adjusted back to the first (3).
        assert_eq!(tmd.positions()[0].position, 3);
    }

    #[test]
    fn test_nearest_neighbor_writes_raw_score() {
        let mut nn = crate::query::node::NearestNeighborNode::new("title", "qvec");
        nn.set_raw_score(0.25);
        let mut query = QueryNode::NearestNeighbor(Box::new(nn));
        let mut processor = RankProcessor::new_for_ranking(&query, &view(), 10);
        processor.unpack_match_data(DocId(2), &mut query);
        assert_eq!(processor.match_data().term_field(0).raw_score(), 0.25);
    }

    #[test]
    fn test_non_finite_scores_clamp() {
        struct NanProgram {
            names: Vec<String>,
        }
        impl RankProgram for NanProgram {
            fn run(&mut self, _doc_id: u32, _tf: &[crate::rank::match_data::TermFieldMatchData]) {}
            fn score(&self) -> f64 {
                f64::NAN
            }
            fn feature_names(&self) -> &[String] {
                &self.names
            }
            fn feature_values(&self) -> Vec<f64> {
                Vec::new()
            }
        }
        let query = term_node("title", "a");
        let mut processor = RankProcessor::with_programs(
            &query,
            &view(),
            10,
            Some(RankPrograms {
                ranking: Box::new(NanProgram { names: Vec::new() }),
                summary: None,
                match_features: None,
            }),
            false,
        );
        processor.run_rank_program(DocId(1));
        assert_eq!(processor.score(), f64::NEG_INFINITY);
    }

    #[test]
    fn test_pipeline_scores_and_collects() {
        let mut term = QueryTerm::new("title", "a", TermType::Word);
        term.set_field_length(0, 10);
        term.add_hit(Hit::new(0, 0, 1, 10, 0));
        let mut query = QueryNode::Term(Box::new(term));
        let mut processor = RankProcessor::new_for_ranking(&query, &view(), 5);
        processor.unpack_match_data(DocId(1), &mut query);
        processor.run_rank_program(DocId(1));
        assert!(processor.score() > 0.0);
        assert!(processor.add_hit(doc(1), DocId(1), None));
        let mut result = SearchResult::new();
        processor.fill_search_result(&mut result);
        assert_eq!(processor.phase(), RankPhase::Emitting);
        assert_eq!(result.hits.len(), 1);
        assert!(!result.match_features.is_empty());
        assert_eq!(
            result.match_features.values.len(),
            result.match_features.names.len()
        );
    }
}
