use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::query::hit::{Hit, HitIteratorPack, HitList, merge_hit_lists};
use crate::query::near::{
    self, BoolSink, ElementSink, NegativeFilter, SharedElementGaps,
};
use crate::query::stack::{FLAG_FILTER, FLAG_NORANK, StackItem, StackItemType};
use crate::query::term::{FieldInfo, QueryTerm, TermType};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectorKind {
    And,
    Or,
    WeakAnd,
    AndNot,
    RankWith,
    Near,
    ONear,
    Phrase,
    SameElement,
    /// Alternatives treated as one term; children may be terms or phrases
    /// (the numeric-string rewrite produces the latter).
    Equiv,
}

impl ConnectorKind {
    pub fn stack_type(&self) -> StackItemType {
        match self {
            ConnectorKind::And => StackItemType::And,
            ConnectorKind::Or => StackItemType::Or,
            ConnectorKind::WeakAnd => StackItemType::WeakAnd,
            ConnectorKind::AndNot => StackItemType::AndNot,
            ConnectorKind::RankWith => StackItemType::RankWith,
            ConnectorKind::Near => StackItemType::Near,
            ConnectorKind::ONear => StackItemType::ONear,
            ConnectorKind::Phrase => StackItemType::Phrase,
            ConnectorKind::SameElement => StackItemType::SameElement,
            ConnectorKind::Equiv => StackItemType::Equiv,
        }
    }
}

/// N-ary query operator. Near kinds carry the window distance and the
/// element-gap table; phrase tracks per-field info for feature unpacking.
#[derive(Debug, Clone)]
pub struct ConnectorNode {
    pub kind: ConnectorKind,
    pub index: String,
    pub children: Vec<QueryNode>,
    pub distance: u32,
    pub target_hits: u32,
    pub element_gaps: SharedElementGaps,
    cached: Option<bool>,
    field_info: Vec<Option<FieldInfo>>,
}

impl PartialEq for ConnectorNode {
    fn eq(&self, other: &Self) -> bool {
        self.kind == other.kind
            && self.index == other.index
            && self.children == other.children
            && self.distance == other.distance
            && self.target_hits == other.target_hits
            && *self.element_gaps == *other.element_gaps
    }
}

impl ConnectorNode {
    pub fn new(kind: ConnectorKind) -> Self {
        ConnectorNode {
            kind,
            index: String::new(),
            children: Vec::new(),
            distance: 0,
            target_hits: 0,
            element_gaps: SharedElementGaps::default(),
            cached: None,
            field_info: Vec::new(),
        }
    }

    pub fn add_child(&mut self, child: QueryNode) {
        self.children.push(child);
    }

    pub fn field_info(&self, field_id: u32) -> Option<&FieldInfo> {
        self.field_info.get(field_id as usize).and_then(|i| i.as_ref())
    }

    fn evaluate(&mut self) -> bool {
        if let Some(cached) = self.cached {
            return cached;
        }
        let result = match self.kind {
            ConnectorKind::And => {
                !self.children.is_empty() && self.children.iter_mut().all(|c| c.evaluate())
            }
            ConnectorKind::Or | ConnectorKind::WeakAnd | ConnectorKind::Equiv => {
                self.children.iter_mut().any(|c| c.evaluate())
            }
            ConnectorKind::AndNot => {
                let mut it = self.children.iter_mut();
                match it.next() {
                    Some(first) => first.evaluate() && !it.any(|c| c.evaluate()),
                    None => false,
                }
            }
            ConnectorKind::RankWith => match self.children.first_mut() {
                Some(first) => first.evaluate(),
                None => false,
            },
            ConnectorKind::Near => {
                let (positives, filter) = self.near_inputs();
                let mut sink = BoolSink::default();
                near::evaluate_near(positives, &filter, self.distance, &self.element_gaps, &mut sink);
                sink.matched
            }
            ConnectorKind::ONear => {
                let (positives, filter) = self.near_inputs();
                let mut sink = BoolSink::default();
                near::evaluate_onear(positives, &filter, self.distance, &self.element_gaps, &mut sink);
                sink.matched
            }
            ConnectorKind::Phrase => {
                let mut hits = HitList::new();
                self.evaluate_phrase(&mut hits);
                !hits.is_empty()
            }
            ConnectorKind::SameElement => {
                let mut pack = self.child_iterator_pack();
                pack.all_valid() && pack.seek_to_matching_field_element()
            }
        };
        self.cached = Some(result);
        result
    }

    fn child_hit_lists(&mut self) -> Vec<HitList> {
        let mut lists = Vec::with_capacity(self.children.len());
        for child in &mut self.children {
            let mut hl = HitList::new();
            child.evaluate_hits(&mut hl);
            lists.push(hl);
        }
        lists
    }

    fn child_iterator_pack(&mut self) -> HitIteratorPack {
        HitIteratorPack::new(self.child_hit_lists())
    }

    /// Cursor inputs for near evaluation. An AND-NOT child contributes its
    /// first child as a positive cursor and the rest to the element filter.
    fn near_inputs(&mut self) -> (Vec<HitList>, NegativeFilter) {
        let mut positives = Vec::new();
        let mut filter = NegativeFilter::new();
        for child in &mut self.children {
            match child {
                QueryNode::Connector(c) if c.kind == ConnectorKind::AndNot => {
                    let mut it = c.children.iter_mut();
                    if let Some(first) = it.next() {
                        let mut hl = HitList::new();
                        first.evaluate_hits(&mut hl);
                        positives.push(hl);
                    }
                    for negative in it {
                        let mut hl = HitList::new();
                        negative.evaluate_hits(&mut hl);
                        filter.add_hits(&hl);
                    }
                }
                other => {
                    let mut hl = HitList::new();
                    other.evaluate_hits(&mut hl);
                    positives.push(hl);
                }
            }
        }
        (positives, filter)
    }

    fn update_field_info(&mut self, field_id: u32, hit_offset: usize, field_length: u32) {
        let field = field_id as usize;
        if self.field_info.len() <= field {
            self.field_info.resize(field + 1, None);
        }
        let info = self.field_info[field].get_or_insert_with(|| FieldInfo {
            hit_offset,
            hit_count: 0,
            field_length,
        });
        info.hit_count += 1;
    }

    /// Walk the shortest-anchored iterator pack: every child must hit at
    /// `first_position + child_offset` within one field-element; the match
    /// position emitted is the last child's.
    fn evaluate_phrase(&mut self, out: &mut HitList) {
        out.clear();
        self.field_info.clear();
        let lists = self.child_hit_lists();
        // Field lengths as seen by the last phrase term.
        let last_lengths: HashMap<u32, u32> = match self.children.last() {
            Some(QueryNode::Term(t)) => (0..t.num_field_infos() as u32)
                .filter_map(|f| t.field_info(f).map(|i| (f, i.field_length)))
                .collect(),
            _ => HashMap::new(),
        };
        let mut pack = HitIteratorPack::new(lists);
        if !pack.all_valid() {
            return;
        }
        while pack.seek_to_matching_field_element() {
            let mut first_position = pack.hit(0).position;
            let mut retry_element = true;
            while retry_element {
                let mut position_offset = 0u32;
                let mut matched = true;
                for idx in 0..pack.len() {
                    if !pack.seek_in_field_element(idx, first_position + position_offset) {
                        retry_element = false;
                        matched = false;
                        break;
                    }
                    if pack.hit(idx).position > first_position + position_offset {
                        first_position = pack.hit(idx).position - position_offset;
                        matched = false;
                        break;
                    }
                    position_offset += 1;
                }
                if matched {
                    let hit = *pack.hit(pack.len() - 1);
                    out.push(hit);
                    let field_length = last_lengths
                        .get(&hit.field_id)
                        .copied()
                        .unwrap_or(hit.element_length);
                    self.update_field_info(hit.field_id, out.len() - 1, field_length);
                    if !pack.step_in_field_element(0) {
                        retry_element = false;
                    }
                }
            }
        }
    }

    /// Equiv reads field lengths from its first child (or the first
    /// phrase-child's first term) for feature extraction.
    fn track_equiv_field_info(&mut self) {
        let infos: Vec<(u32, FieldInfo)> = {
            let source = match self.children.first() {
                Some(QueryNode::Term(t)) => Some(t.as_ref()),
                Some(QueryNode::Connector(c)) if c.kind == ConnectorKind::Phrase => {
                    match c.children.first() {
                        Some(QueryNode::Term(t)) => Some(t.as_ref()),
                        _ => None,
                    }
                }
                _ => None,
            };
            source
                .map(|t| {
                    (0..t.num_field_infos() as u32)
                        .filter_map(|f| t.field_info(f).map(|i| (f, *i)))
                        .collect()
                })
                .unwrap_or_default()
        };
        self.field_info.clear();
        for (field, info) in infos {
            let idx = field as usize;
            if self.field_info.len() <= idx {
                self.field_info.resize(idx + 1, None);
            }
            self.field_info[idx] = Some(info);
        }
    }

    pub(crate) fn evaluate_hits(&mut self, out: &mut HitList) {
        out.clear();
        match self.kind {
            ConnectorKind::Phrase => self.evaluate_phrase(out),
            ConnectorKind::Or | ConnectorKind::WeakAnd => {
                for list in self.child_hit_lists() {
                    *out = merge_hit_lists(out, &list);
                }
            }
            ConnectorKind::Equiv => {
                for list in self.child_hit_lists() {
                    *out = merge_hit_lists(out, &list);
                }
                self.track_equiv_field_info();
            }
            ConnectorKind::AndNot => {
                let mut it = self.children.iter_mut();
                if let Some(first) = it.next() {
                    first.evaluate_hits(out);
                }
                let mut filter = NegativeFilter::new();
                for negative in it {
                    let mut hl = HitList::new();
                    negative.evaluate_hits(&mut hl);
                    filter.add_hits(&hl);
                }
                if !filter.is_empty() {
                    out.retain(|h| filter.allows(h.field_id, h.element_id));
                }
            }
            ConnectorKind::SameElement => {
                let mut pack = self.child_iterator_pack();
                if !pack.all_valid() {
                    return;
                }
                while pack.seek_to_matching_field_element() {
                    let hit = *pack.hit(0);
                    out.push(hit);
                    let fe = pack.field_element();
                    while pack.valid(0) && pack.hit(0).field_element() == fe {
                        pack.advance(0);
                    }
                    if !pack.valid(0) {
                        break;
                    }
                    pack.set_field_element(pack.hit(0).field_element());
                }
            }
            _ => {
                // Connectors answer with a single synthetic hit.
                if self.evaluate() {
                    out.push(Hit::new(0, 0, 1, 1, 1));
                }
            }
        }
    }

    fn get_element_ids(&mut self, out: &mut Vec<u32>) {
        match self.kind {
            ConnectorKind::And | ConnectorKind::RankWith => {
                let mut it = self.children.iter_mut();
                if let Some(first) = it.next() {
                    first.get_element_ids(out);
                }
                for child in it {
                    if out.is_empty() {
                        return;
                    }
                    let mut other = Vec::new();
                    child.get_element_ids(&mut other);
                    out.retain(|e| other.binary_search(e).is_ok());
                }
            }
            ConnectorKind::Or | ConnectorKind::WeakAnd | ConnectorKind::Equiv => {
                for child in &mut self.children {
                    let mut other = Vec::new();
                    child.get_element_ids(&mut other);
                    out.extend_from_slice(&other);
                }
                out.sort_unstable();
                out.dedup();
            }
            ConnectorKind::AndNot => {}
            ConnectorKind::Near => {
                let (positives, filter) = self.near_inputs();
                let mut sink = ElementSink::new(out);
                near::evaluate_near(positives, &filter, self.distance, &self.element_gaps, &mut sink);
                sink.finish();
            }
            ConnectorKind::ONear => {
                let (positives, filter) = self.near_inputs();
                let mut sink = ElementSink::new(out);
                near::evaluate_onear(positives, &filter, self.distance, &self.element_gaps, &mut sink);
                sink.finish();
            }
            ConnectorKind::Phrase | ConnectorKind::SameElement => {
                let mut hits = HitList::new();
                self.evaluate_hits(&mut hits);
                out.extend(hits.iter().map(|h| h.element_id));
                out.sort_unstable();
                out.dedup();
            }
        }
    }

    fn reset(&mut self) {
        self.cached = None;
        self.field_info.clear();
        for child in &mut self.children {
            child.reset();
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MultiTermKind {
    WeightedSet,
    DotProduct,
    Wand,
    In,
    WordAlternatives,
}

impl MultiTermKind {
    pub fn stack_type(&self) -> StackItemType {
        match self {
            MultiTermKind::WeightedSet => StackItemType::WeightedSet,
            MultiTermKind::DotProduct => StackItemType::DotProduct,
            MultiTermKind::Wand => StackItemType::Wand,
            MultiTermKind::In => StackItemType::In,
            MultiTermKind::WordAlternatives => StackItemType::WordAlternatives,
        }
    }
}

/// A node owning a set of weighted child terms (weighted-set, dot-product,
/// WAND, IN, word-alternatives). IN terms compile their tokens into an fst
/// set for one-pass membership tests during field search.
#[derive(Clone)]
pub struct MultiTermNode {
    pub kind: MultiTermKind,
    pub index: String,
    pub terms: Vec<QueryTerm>,
    pub target_hits: u32,
    pub score_threshold: f64,
    token_set: Option<Arc<fst::Set<Vec<u8>>>>,
}

impl fmt::Debug for MultiTermNode {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("MultiTermNode")
            .field("kind", &self.kind)
            .field("index", &self.index)
            .field("terms", &self.terms)
            .field("target_hits", &self.target_hits)
            .field("score_threshold", &self.score_threshold)
            .finish()
    }
}

impl PartialEq for MultiTermNode {
    fn eq(&self, other: &Self) -> bool {
        self.kind == other.kind
            && self.index == other.index
            && self.terms == other.terms
            && self.target_hits == other.target_hits
            && self.score_threshold == other.score_threshold
    }
}

impl MultiTermNode {
    pub fn new(kind: MultiTermKind, index: impl Into<String>) -> Self {
        MultiTermNode {
            kind,
            index: index.into(),
            terms: Vec::new(),
            target_hits: 0,
            score_threshold: 0.0,
            token_set: None,
        }
    }

    pub fn add_term(&mut self, term: QueryTerm) {
        self.terms.push(term);
        self.token_set = None;
    }

    /// Compile the term tokens into an fst set. Called once when the node
    /// is bound to field searchers.
    pub fn build_token_set(&mut self) -> crate::core::error::Result<()> {
        let mut tokens: Vec<&str> = self.terms.iter().map(|t| t.term.as_str()).collect();
        tokens.sort_unstable();
        tokens.dedup();
        self.token_set = Some(Arc::new(fst::Set::from_iter(tokens)?));
        Ok(())
    }

    pub fn matches_token(&self, token: &str) -> bool {
        match &self.token_set {
            Some(set) => set.contains(token),
            None => self.terms.iter().any(|t| t.term == token),
        }
    }

    pub fn term_for_token_mut(&mut self, token: &str) -> Option<&mut QueryTerm> {
        self.terms.iter_mut().find(|t| t.term == token)
    }

    /// Sum of query weight times element weight over all hits.
    pub fn raw_score(&self) -> f64 {
        self.terms
            .iter()
            .flat_map(|t| t.hits().iter().map(move |h| t.weight as f64 * h.element_weight as f64))
            .sum()
    }

    fn evaluate(&self) -> bool {
        match self.kind {
            MultiTermKind::Wand => self.raw_score() > self.score_threshold,
            _ => self.terms.iter().any(|t| t.evaluate()),
        }
    }

    pub(crate) fn evaluate_hits(&self, out: &mut HitList) {
        out.clear();
        for term in &self.terms {
            let mut hl = HitList::new();
            term.evaluate_hits(&mut hl);
            *out = merge_hit_lists(out, &hl);
        }
    }

    fn reset(&mut self) {
        for term in &mut self.terms {
            term.reset();
        }
    }
}

/// Nearest-neighbor leaf. The tensor distance is computed by an external
/// collaborator which deposits a raw score per document; the node matches
/// iff a score is present.
#[derive(Debug, Clone)]
pub struct NearestNeighborNode {
    pub field: String,
    pub query_tensor_name: String,
    pub unique_id: u32,
    pub weight: i32,
    pub distance_threshold: f64,
    raw_score: Option<f64>,
}

impl PartialEq for NearestNeighborNode {
    fn eq(&self, other: &Self) -> bool {
        self.field == other.field
            && self.query_tensor_name == other.query_tensor_name
            && self.unique_id == other.unique_id
            && self.weight == other.weight
            && self.distance_threshold == other.distance_threshold
    }
}

impl NearestNeighborNode {
    pub fn new(field: impl Into<String>, query_tensor_name: impl Into<String>) -> Self {
        NearestNeighborNode {
            field: field.into(),
            query_tensor_name: query_tensor_name.into(),
            unique_id: 0,
            weight: 100,
            distance_threshold: f64::MAX,
            raw_score: None,
        }
    }

    pub fn set_raw_score(&mut self, score: f64) {
        self.raw_score = Some(score);
    }

    pub fn raw_score(&self) -> Option<f64> {
        self.raw_score
    }
}

/// The query tree. Boolean results are cached per node until `reset()` is
/// called between documents.
#[derive(Debug, Clone, PartialEq)]
pub enum QueryNode {
    True,
    False,
    Term(Box<QueryTerm>),
    MultiTerm(Box<MultiTermNode>),
    NearestNeighbor(Box<NearestNeighborNode>),
    Connector(Box<ConnectorNode>),
}

/// Mutable view of the units a field searcher can be bound to.
pub enum SearchableMut<'a> {
    Term(&'a mut QueryTerm),
    MultiTerm(&'a mut MultiTermNode),
    NearestNeighbor(&'a mut NearestNeighborNode),
}

impl QueryNode {
    pub fn evaluate(&mut self) -> bool {
        match self {
            QueryNode::True => true,
            QueryNode::False => false,
            QueryNode::Term(t) => t.evaluate(),
            QueryNode::MultiTerm(m) => m.evaluate(),
            QueryNode::NearestNeighbor(n) => n.raw_score().is_some(),
            QueryNode::Connector(c) => c.evaluate(),
        }
    }

    pub fn evaluate_hits(&mut self, out: &mut HitList) {
        match self {
            QueryNode::Term(t) => t.evaluate_hits(out),
            QueryNode::MultiTerm(m) => m.evaluate_hits(out),
            QueryNode::Connector(c) => c.evaluate_hits(out),
            QueryNode::True | QueryNode::False | QueryNode::NearestNeighbor(_) => out.clear(),
        }
    }

    pub fn get_element_ids(&mut self, out: &mut Vec<u32>) {
        match self {
            QueryNode::Term(t) => {
                out.extend(t.hits().iter().map(|h| h.element_id));
                out.sort_unstable();
                out.dedup();
            }
            QueryNode::MultiTerm(m) => {
                let mut hits = HitList::new();
                m.evaluate_hits(&mut hits);
                out.extend(hits.iter().map(|h| h.element_id));
                out.sort_unstable();
                out.dedup();
            }
            QueryNode::Connector(c) => c.get_element_ids(out),
            QueryNode::True | QueryNode::False | QueryNode::NearestNeighbor(_) => {}
        }
    }

    /// Clear per-document state everywhere in the tree.
    pub fn reset(&mut self) {
        match self {
            QueryNode::Term(t) => t.reset(),
            QueryNode::MultiTerm(m) => m.reset(),
            QueryNode::NearestNeighbor(n) => n.raw_score = None,
            QueryNode::Connector(c) => c.reset(),
            QueryNode::True | QueryNode::False => {}
        }
    }

    pub fn collect_leaves<'a>(&'a self, out: &mut Vec<&'a QueryTerm>) {
        match self {
            QueryNode::Term(t) => out.push(t),
            QueryNode::MultiTerm(m) => out.extend(m.terms.iter()),
            QueryNode::Connector(c) => {
                for child in &c.children {
                    child.collect_leaves(out);
                }
            }
            QueryNode::True | QueryNode::False | QueryNode::NearestNeighbor(_) => {}
        }
    }

    /// Depth-first walk over searchable units; binding and per-document
    /// searching rely on this order being stable.
    pub fn for_each_searchable_mut(&mut self, f: &mut impl FnMut(SearchableMut<'_>)) {
        match self {
            QueryNode::Term(t) => f(SearchableMut::Term(t)),
            QueryNode::MultiTerm(m) => f(SearchableMut::MultiTerm(m)),
            QueryNode::NearestNeighbor(n) => f(SearchableMut::NearestNeighbor(n)),
            QueryNode::Connector(c) => {
                for child in &mut c.children {
                    child.for_each_searchable_mut(f);
                }
            }
            QueryNode::True | QueryNode::False => {}
        }
    }

    pub fn depth(&self) -> usize {
        match self {
            QueryNode::Connector(c) => {
                1 + c.children.iter().map(|c| c.depth()).max().unwrap_or(0)
            }
            _ => 1,
        }
    }

    pub fn width(&self) -> usize {
        match self {
            QueryNode::Connector(c) => c.children.iter().map(|c| c.width()).sum(),
            QueryNode::MultiTerm(m) => m.terms.len(),
            _ => 1,
        }
    }

    /// Serialise back to depth-first stack descriptors.
    pub fn dump(&self, out: &mut Vec<StackItem>) {
        match self {
            QueryNode::True => out.push(StackItem::new(StackItemType::True)),
            QueryNode::False => out.push(StackItem::new(StackItemType::False)),
            QueryNode::Term(t) => out.push(dump_term(t)),
            QueryNode::MultiTerm(m) => {
                let mut item = StackItem::connector(m.kind.stack_type(), m.terms.len() as u32);
                item.index = m.index.clone();
                item.target_hits = m.target_hits;
                item.score_threshold = m.score_threshold;
                out.push(item);
                for term in &m.terms {
                    let mut child = StackItem::term(StackItemType::PureWeightedString, "", &term.term);
                    child.weight = term.weight;
                    child.unique_id = term.unique_id;
                    if !term.ranked {
                        child.flags |= FLAG_NORANK;
                    }
                    if term.filter {
                        child.flags |= FLAG_FILTER;
                    }
                    out.push(child);
                }
            }
            QueryNode::NearestNeighbor(n) => {
                let mut item = StackItem::term(StackItemType::NearestNeighbor, &n.field, &n.query_tensor_name);
                item.unique_id = n.unique_id;
                item.weight = n.weight;
                item.distance_threshold = n.distance_threshold;
                out.push(item);
            }
            QueryNode::Connector(c) => {
                let mut item = StackItem::connector(c.kind.stack_type(), c.children.len() as u32);
                item.index = c.index.clone();
                item.near_distance = c.distance;
                item.target_hits = c.target_hits;
                out.push(item);
                for child in &c.children {
                    child.dump(out);
                }
            }
        }
    }
}

fn dump_term(term: &QueryTerm) -> StackItem {
    let item_type = match term.term_type {
        TermType::Word => StackItemType::Term,
        TermType::Prefix => StackItemType::PrefixTerm,
        TermType::Suffix => StackItemType::SuffixTerm,
        TermType::Substring => StackItemType::SubstringTerm,
        TermType::Exact => StackItemType::ExactTerm,
        TermType::Regex => StackItemType::RegexpTerm,
        TermType::Fuzzy => StackItemType::FuzzyTerm,
        TermType::Range | TermType::Number => StackItemType::NumTerm,
        TermType::GeoLocation => StackItemType::GeoLocationTerm,
        TermType::NearestNeighbor => StackItemType::NearestNeighbor,
    };
    let mut item = StackItem::term(item_type, &term.index, &term.term);
    item.weight = term.weight;
    item.unique_id = term.unique_id;
    item.fuzzy_max_edits = term.fuzzy_max_edits;
    item.fuzzy_prefix_length = term.fuzzy_prefix_length;
    if !term.ranked {
        item.flags |= FLAG_NORANK;
    }
    if term.filter {
        item.flags |= FLAG_FILTER;
    }
    item
}
