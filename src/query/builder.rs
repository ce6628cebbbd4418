use crate::query::near::SharedElementGaps;
use crate::query::node::{
    ConnectorKind, ConnectorNode, MultiTermKind, MultiTermNode, NearestNeighborNode, QueryNode,
};
use crate::query::stack::{StackItem, StackItemType, StackIterator};
use crate::query::term::{QueryTerm, RangeSpec, TermType};

/// What the builder needs to know about the schema: whether an index is
/// text-matching (gates the numeric-string rewrite) and the per-field
/// element gaps handed to near nodes.
pub trait BuildEnv {
    fn rewrite_float_terms(&self) -> bool {
        true
    }
    fn is_text_index(&self, _index: &str) -> bool {
        false
    }
    fn element_gaps(&self) -> SharedElementGaps {
        SharedElementGaps::default()
    }
}

/// Environment with every rewrite disabled; tests and round-trip checks
/// use this.
#[derive(Debug, Default)]
pub struct PlainBuildEnv;

impl BuildEnv for PlainBuildEnv {
    fn rewrite_float_terms(&self) -> bool {
        false
    }
}

const DEFAULT_INDEX: &str = "default";

struct ParentInfo<'a> {
    index: &'a str,
    same_element: bool,
}

/// Build a query tree from a serialised stack blob. Unknown node types are
/// skipped with a warning; an empty or unusable stack yields `None`.
pub fn build_query(blob: &[u8], env: &dyn BuildEnv) -> Option<QueryNode> {
    let mut it = StackIterator::new(blob);
    if !it.next() {
        return None;
    }
    build_node(&mut it, env, true, None)
}

fn connector_kind(item_type: StackItemType) -> Option<ConnectorKind> {
    match item_type {
        StackItemType::And => Some(ConnectorKind::And),
        StackItemType::Or => Some(ConnectorKind::Or),
        StackItemType::WeakAnd => Some(ConnectorKind::WeakAnd),
        StackItemType::AndNot => Some(ConnectorKind::AndNot),
        StackItemType::RankWith => Some(ConnectorKind::RankWith),
        StackItemType::Near => Some(ConnectorKind::Near),
        StackItemType::ONear => Some(ConnectorKind::ONear),
        StackItemType::Phrase => Some(ConnectorKind::Phrase),
        StackItemType::SameElement => Some(ConnectorKind::SameElement),
        StackItemType::Equiv => Some(ConnectorKind::Equiv),
        _ => None,
    }
}

fn multi_term_kind(item_type: StackItemType) -> Option<MultiTermKind> {
    match item_type {
        StackItemType::WeightedSet => Some(MultiTermKind::WeightedSet),
        StackItemType::DotProduct => Some(MultiTermKind::DotProduct),
        StackItemType::Wand => Some(MultiTermKind::Wand),
        StackItemType::In => Some(MultiTermKind::In),
        StackItemType::WordAlternatives => Some(MultiTermKind::WordAlternatives),
        _ => None,
    }
}

/// Adjacent same-kind connectors are merged to shorten the tree.
fn is_flattenable(parent: ConnectorKind, child: StackItemType) -> bool {
    matches!(
        (parent, child),
        (ConnectorKind::And, StackItemType::And)
            | (ConnectorKind::Or, StackItemType::Or)
            | (ConnectorKind::WeakAnd, StackItemType::Or)
    )
}

/// Positional operators never see rewritten children.
fn disables_rewrite(kind: ConnectorKind) -> bool {
    matches!(
        kind,
        ConnectorKind::Near
            | ConnectorKind::ONear
            | ConnectorKind::Phrase
            | ConnectorKind::SameElement
            | ConnectorKind::Equiv
    )
}

fn build_node(
    it: &mut StackIterator<'_>,
    env: &dyn BuildEnv,
    allow_rewrite: bool,
    parent: Option<&ParentInfo<'_>>,
) -> Option<QueryNode> {
    let item = it.current()?.clone();
    if let Some(kind) = connector_kind(item.item_type) {
        return build_connector(it, env, allow_rewrite, kind, &item);
    }
    if let Some(kind) = multi_term_kind(item.item_type) {
        return build_multi_term(it, kind, &item);
    }
    match item.item_type {
        StackItemType::True => Some(QueryNode::True),
        StackItemType::False => Some(QueryNode::False),
        StackItemType::NearestNeighbor => {
            let mut node = NearestNeighborNode::new(item.index.clone(), item.term.clone());
            node.unique_id = item.unique_id;
            node.weight = item.weight;
            node.distance_threshold = item.distance_threshold;
            Some(QueryNode::NearestNeighbor(Box::new(node)))
        }
        StackItemType::Term
        | StackItemType::NumTerm
        | StackItemType::PrefixTerm
        | StackItemType::SubstringTerm
        | StackItemType::SuffixTerm
        | StackItemType::ExactTerm
        | StackItemType::RegexpTerm
        | StackItemType::FuzzyTerm
        | StackItemType::GeoLocationTerm
        | StackItemType::PureWeightedString
        | StackItemType::PureWeightedLong => build_term(env, allow_rewrite, &item, parent),
        StackItemType::Unknown(code) => {
            log::warn!("Unknown query stack item type {}, skipping subtree", code);
            skip_subtree(it, item.arity);
            None
        }
        _ => {
            log::warn!("Unhandled query stack item {:?}, skipping subtree", item.item_type);
            skip_subtree(it, item.arity);
            None
        }
    }
}

fn build_connector(
    it: &mut StackIterator<'_>,
    env: &dyn BuildEnv,
    allow_rewrite: bool,
    kind: ConnectorKind,
    item: &StackItem,
) -> Option<QueryNode> {
    let mut node = ConnectorNode::new(kind);
    node.index = item.index.clone();
    node.distance = item.near_distance;
    node.target_hits = item.target_hits;
    if matches!(kind, ConnectorKind::Near | ConnectorKind::ONear) {
        node.element_gaps = env.element_gaps();
    }
    let child_rewrite = allow_rewrite && !disables_rewrite(kind);
    let parent_info = ParentInfo {
        index: &node.index,
        same_element: kind == ConnectorKind::SameElement,
    };
    let mut arity = item.arity;
    let mut consumed = 0;
    while consumed < arity {
        consumed += 1;
        if !it.next() {
            break;
        }
        let child_item = it.current().expect("just advanced");
        if is_flattenable(kind, child_item.item_type) {
            arity += child_item.arity;
            continue;
        }
        let hidden = kind == ConnectorKind::AndNot && !node.children.is_empty();
        if let Some(mut child) = build_node(it, env, child_rewrite, Some(&parent_info)) {
            if hidden {
                mark_unranked(&mut child);
            }
            node.children.push(child);
        }
    }
    Some(QueryNode::Connector(Box::new(node)))
}

fn build_multi_term(
    it: &mut StackIterator<'_>,
    kind: MultiTermKind,
    item: &StackItem,
) -> Option<QueryNode> {
    let mut node = MultiTermNode::new(kind, item.index.clone());
    node.target_hits = item.target_hits;
    node.score_threshold = item.score_threshold;
    for _ in 0..item.arity {
        if !it.next() {
            break;
        }
        let child = it.current().expect("just advanced").clone();
        match child.item_type {
            StackItemType::PureWeightedString
            | StackItemType::PureWeightedLong
            | StackItemType::Term
            | StackItemType::NumTerm => {
                let text = if child.item_type == StackItemType::PureWeightedLong {
                    child.integer_term.to_string()
                } else {
                    child.term.clone()
                };
                let term_type = if kind == MultiTermKind::In {
                    TermType::Exact
                } else {
                    TermType::Word
                };
                let mut term = QueryTerm::new(item.index.clone(), text, term_type);
                term.weight = child.weight;
                term.unique_id = child.unique_id;
                term.ranked = child.ranked();
                term.filter = child.filter();
                node.add_term(term);
            }
            other => {
                log::warn!("Unexpected multi-term child {:?}, skipping subtree", other);
                skip_subtree(it, child.arity);
            }
        }
    }
    Some(QueryNode::MultiTerm(Box::new(node)))
}

fn term_type_for(item: &StackItem) -> TermType {
    match item.item_type {
        StackItemType::PrefixTerm => TermType::Prefix,
        StackItemType::SuffixTerm => TermType::Suffix,
        StackItemType::SubstringTerm => TermType::Substring,
        StackItemType::ExactTerm => TermType::Exact,
        StackItemType::RegexpTerm => TermType::Regex,
        StackItemType::FuzzyTerm => TermType::Fuzzy,
        StackItemType::GeoLocationTerm => TermType::GeoLocation,
        StackItemType::NumTerm => {
            if RangeSpec::parse(&item.term).is_some() {
                TermType::Range
            } else {
                TermType::Number
            }
        }
        _ => TermType::Word,
    }
}

fn build_term(
    env: &dyn BuildEnv,
    allow_rewrite: bool,
    item: &StackItem,
    parent: Option<&ParentInfo<'_>>,
) -> Option<QueryNode> {
    let mut index = item.index.clone();
    if index.is_empty() {
        let weighted = matches!(
            item.item_type,
            StackItemType::PureWeightedString | StackItemType::PureWeightedLong
        );
        index = match parent {
            Some(p) if weighted => p.index.to_string(),
            _ => DEFAULT_INDEX.to_string(),
        };
    }
    if let Some(p) = parent {
        if p.same_element {
            index = format!("{}.{}", p.index, index);
        }
    }
    // Only well-formed sddocname constraints are sent down, so the term
    // value itself is not checked.
    if index == "sddocname" {
        return Some(QueryNode::True);
    }
    let text = if item.item_type == StackItemType::PureWeightedLong {
        item.integer_term.to_string()
    } else {
        item.term.clone()
    };
    let mut term = QueryTerm::new(index.clone(), text, term_type_for(item));
    term.weight = item.weight;
    term.unique_id = item.unique_id;
    term.ranked = item.ranked();
    term.filter = item.filter();
    if term.term_type == TermType::Fuzzy {
        term.fuzzy_max_edits = item.fuzzy_max_edits;
        term.fuzzy_prefix_length = item.fuzzy_prefix_length;
    }

    let rewrite = term.term_type == TermType::Word
        && allow_rewrite
        && env.rewrite_float_terms()
        && env.is_text_index(&index)
        && term.is_float()
        && (term.term.contains('.') || term.term.contains('-'));
    if !rewrite {
        return Some(QueryNode::Term(Box::new(term)));
    }

    // Numbers searched in string fields match the literal token too:
    // "3.14" gets the alternative phrase "3" "14", "1e-5" gets "1e" "5",
    // and a term reduced to one differing part gets that part as an
    // alternative word.
    let parts = split_numeric_parts(&term.term);
    let alternative = if parts.len() > 1 {
        let mut phrase = ConnectorNode::new(ConnectorKind::Phrase);
        for part in &parts {
            phrase.add_child(QueryNode::Term(Box::new(QueryTerm::new(
                index.clone(),
                part.clone(),
                TermType::Word,
            ))));
        }
        Some(QueryNode::Connector(Box::new(phrase)))
    } else if parts.len() == 1 && parts[0] != term.term {
        Some(QueryNode::Term(Box::new(QueryTerm::new(
            index.clone(),
            parts[0].clone(),
            TermType::Word,
        ))))
    } else {
        None
    };
    match alternative {
        Some(alternative) => {
            let mut equiv = ConnectorNode::new(ConnectorKind::Equiv);
            equiv.add_child(QueryNode::Term(Box::new(term)));
            equiv.add_child(alternative);
            Some(QueryNode::Connector(Box::new(equiv)))
        }
        None => Some(QueryNode::Term(Box::new(term))),
    }
}

/// Tokenize a numeric string on its non-alphanumeric separators:
/// "3.14" becomes ["3", "14"], "-1.5e-3" becomes ["1", "5e", "3"].
fn split_numeric_parts(term: &str) -> Vec<String> {
    let mut parts: Vec<String> = Vec::new();
    let mut in_part = false;
    for c in term.chars() {
        if c.is_alphanumeric() {
            if !in_part {
                parts.push(String::new());
                in_part = true;
            }
            parts.last_mut().expect("just pushed").push(c);
        } else {
            in_part = false;
        }
    }
    parts
}

fn skip_subtree(it: &mut StackIterator<'_>, arity: u32) {
    let mut skip = arity;
    while skip > 0 && it.next() {
        skip -= 1;
        skip += it.current().expect("just advanced").arity;
    }
}

/// AND-NOT negatives and friends match but never contribute to ranking.
fn mark_unranked(node: &mut QueryNode) {
    match node {
        QueryNode::Term(t) => t.ranked = false,
        QueryNode::MultiTerm(m) => {
            for term in &mut m.terms {
                term.ranked = false;
            }
        }
        QueryNode::Connector(c) => {
            for child in &mut c.children {
                mark_unranked(child);
            }
        }
        QueryNode::True | QueryNode::False | QueryNode::NearestNeighbor(_) => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::stack::encode_stack;

    struct TextEnv;

    impl BuildEnv for TextEnv {
        fn is_text_index(&self, _index: &str) -> bool {
            true
        }
    }

    fn term_item(index: &str, term: &str) -> StackItem {
        StackItem::term(StackItemType::Term, index, term)
    }

    #[test]
    fn test_build_and_with_terms() {
        let items = vec![
            StackItem::connector(StackItemType::And, 2),
            term_item("title", "hello"),
            term_item("title", "world"),
        ];
        let blob = encode_stack(&items);
        let tree = build_query(&blob, &PlainBuildEnv).unwrap();
        match &tree {
            QueryNode::Connector(c) => {
                assert_eq!(c.kind, ConnectorKind::And);
                assert_eq!(c.children.len(), 2);
            }
            other => panic!("unexpected tree: {:?}", other),
        }
    }

    #[test]
    fn test_flattening_shortens_tree() {
        // AND(a, AND(b, c)) flattens into AND(a, b, c).
        let items = vec![
            StackItem::connector(StackItemType::And, 2),
            term_item("f", "a"),
            StackItem::connector(StackItemType::And, 2),
            term_item("f", "b"),
            term_item("f", "c"),
        ];
        let tree = build_query(&encode_stack(&items), &PlainBuildEnv).unwrap();
        match &tree {
            QueryNode::Connector(c) => {
                assert_eq!(c.kind, ConnectorKind::And);
                assert_eq!(c.children.len(), 3);
            }
            other => panic!("unexpected tree: {:?}", other),
        }
    }

    #[test]
    fn test_and_not_hides_negative_children() {
        let items = vec![
            StackItem::connector(StackItemType::AndNot, 2),
            term_item("f", "keep"),
            term_item("f", "drop"),
        ];
        let tree = build_query(&encode_stack(&items), &PlainBuildEnv).unwrap();
        let mut leaves = Vec::new();
        tree.collect_leaves(&mut leaves);
        assert_eq!(leaves.len(), 2);
        assert!(leaves[0].ranked);
        assert!(!leaves[1].ranked);
    }

    #[test]
    fn test_same_element_prefixes_child_indexes() {
        let mut parent = StackItem::connector(StackItemType::SameElement, 2);
        parent.index = "persons".to_string();
        let items = vec![parent, term_item("name", "joe"), term_item("age", "42")];
        let tree = build_query(&encode_stack(&items), &PlainBuildEnv).unwrap();
        let mut leaves = Vec::new();
        tree.collect_leaves(&mut leaves);
        assert_eq!(leaves[0].index, "persons.name");
        assert_eq!(leaves[1].index, "persons.age");
    }

    #[test]
    fn test_sddocname_becomes_true_node() {
        let items = vec![term_item("sddocname", "music")];
        let tree = build_query(&encode_stack(&items), &PlainBuildEnv).unwrap();
        assert_eq!(tree, QueryNode::True);
    }

    #[test]
    fn test_numeric_string_rewrite() {
        let items = vec![term_item("title", "3.14")];
        let tree = build_query(&encode_stack(&items), &TextEnv).unwrap();
        match &tree {
            QueryNode::Connector(c) => {
                assert_eq!(c.kind, ConnectorKind::Equiv);
                assert_eq!(c.children.len(), 2);
                match &c.children[1] {
                    QueryNode::Connector(p) => {
                        assert_eq!(p.kind, ConnectorKind::Phrase);
                        let mut leaves = Vec::new();
                        c.children[1].collect_leaves(&mut leaves);
                        let words: Vec<&str> = leaves.iter().map(|t| t.term.as_str()).collect();
                        assert_eq!(words, vec!["3", "14"]);
                    }
                    other => panic!("expected phrase, got {:?}", other),
                }
            }
            other => panic!("expected equiv, got {:?}", other),
        }
    }

    #[test]
    fn test_exponent_term_rewrite_triggers_on_minus() {
        // "1e-5" is a non-integer number with no dot; the minus alone
        // gates the rewrite.
        let items = vec![term_item("title", "1e-5")];
        let tree = build_query(&encode_stack(&items), &TextEnv).unwrap();
        match &tree {
            QueryNode::Connector(c) => {
                assert_eq!(c.kind, ConnectorKind::Equiv);
                let mut leaves = Vec::new();
                c.children[1].collect_leaves(&mut leaves);
                let words: Vec<&str> = leaves.iter().map(|t| t.term.as_str()).collect();
                assert_eq!(words, vec!["1e", "5"]);
            }
            other => panic!("expected equiv, got {:?}", other),
        }
    }

    #[test]
    fn test_multi_separator_rewrite_builds_nary_phrase() {
        let items = vec![term_item("title", "-1.5e-3")];
        let tree = build_query(&encode_stack(&items), &TextEnv).unwrap();
        match &tree {
            QueryNode::Connector(c) => {
                assert_eq!(c.kind, ConnectorKind::Equiv);
                match &c.children[1] {
                    QueryNode::Connector(p) => {
                        assert_eq!(p.kind, ConnectorKind::Phrase);
                        assert_eq!(p.children.len(), 3);
                        let mut leaves = Vec::new();
                        c.children[1].collect_leaves(&mut leaves);
                        let words: Vec<&str> = leaves.iter().map(|t| t.term.as_str()).collect();
                        assert_eq!(words, vec!["1", "5e", "3"]);
                    }
                    other => panic!("expected phrase, got {:?}", other),
                }
            }
            other => panic!("expected equiv, got {:?}", other),
        }
    }

    #[test]
    fn test_single_part_rewrite_uses_alternative_word() {
        // "-5e3" tokenizes to the one differing part "5e3", so the
        // alternative is a plain word term rather than a phrase.
        let items = vec![term_item("title", "-5e3")];
        let tree = build_query(&encode_stack(&items), &TextEnv).unwrap();
        match &tree {
            QueryNode::Connector(c) => {
                assert_eq!(c.kind, ConnectorKind::Equiv);
                assert_eq!(c.children.len(), 2);
                match &c.children[1] {
                    QueryNode::Term(t) => assert_eq!(t.term, "5e3"),
                    other => panic!("expected word alternative, got {:?}", other),
                }
            }
            other => panic!("expected equiv, got {:?}", other),
        }
    }

    #[test]
    fn test_negative_integer_not_rewritten() {
        // "-5" parses as an integer, so the minus does not trigger the
        // rewrite.
        let items = vec![term_item("title", "-5")];
        let tree = build_query(&encode_stack(&items), &TextEnv).unwrap();
        assert!(matches!(tree, QueryNode::Term(_)));
    }

    #[test]
    fn test_rewrite_disabled_under_phrase() {
        let items = vec![
            StackItem::connector(StackItemType::Phrase, 2),
            term_item("title", "3.14"),
            term_item("title", "pie"),
        ];
        let tree = build_query(&encode_stack(&items), &TextEnv).unwrap();
        match &tree {
            QueryNode::Connector(c) => {
                assert_eq!(c.kind, ConnectorKind::Phrase);
                assert!(matches!(c.children[0], QueryNode::Term(_)));
            }
            other => panic!("unexpected tree: {:?}", other),
        }
    }

    #[test]
    fn test_integer_term_not_rewritten() {
        let items = vec![term_item("title", "42")];
        let tree = build_query(&encode_stack(&items), &TextEnv).unwrap();
        assert!(matches!(tree, QueryNode::Term(_)));
    }

    #[test]
    fn test_unknown_node_skipped_not_fatal() {
        let mut unknown = StackItem::new(StackItemType::Unknown(77));
        unknown.arity = 1;
        let items = vec![
            StackItem::connector(StackItemType::And, 2),
            unknown,
            term_item("f", "inner"),
            term_item("f", "kept"),
        ];
        let tree = build_query(&encode_stack(&items), &PlainBuildEnv).unwrap();
        match &tree {
            QueryNode::Connector(c) => {
                assert_eq!(c.children.len(), 1);
                let mut leaves = Vec::new();
                tree.collect_leaves(&mut leaves);
                assert_eq!(leaves[0].term, "kept");
            }
            other => panic!("unexpected tree: {:?}", other),
        }
    }

    #[test]
    fn test_weighted_set_children_get_parent_index() {
        let mut parent = StackItem::connector(StackItemType::WeightedSet, 2);
        parent.index = "tags".to_string();
        let mut red = StackItem::term(StackItemType::PureWeightedString, "", "red");
        red.weight = 10;
        let mut n42 = StackItem::new(StackItemType::PureWeightedLong);
        n42.integer_term = 42;
        n42.weight = 20;
        let tree = build_query(&encode_stack(&[parent, red, n42]), &PlainBuildEnv).unwrap();
        match &tree {
            QueryNode::MultiTerm(m) => {
                assert_eq!(m.kind, MultiTermKind::WeightedSet);
                assert_eq!(m.terms.len(), 2);
                assert_eq!(m.terms[0].index, "tags");
                assert_eq!(m.terms[1].term, "42");
                assert_eq!(m.terms[1].weight, 20);
            }
            other => panic!("unexpected tree: {:?}", other),
        }
    }

    #[test]
    fn test_build_dump_round_trip() {
        let mut near = StackItem::connector(StackItemType::ONear, 2);
        near.near_distance = 4;
        let items = vec![
            StackItem::connector(StackItemType::AndNot, 2),
            StackItem::connector(StackItemType::Or, 2),
            term_item("title", "alpha"),
            term_item("title", "beta"),
            near,
            term_item("body", "gamma"),
            term_item("body", "delta"),
        ];
        // AND-NOT marks the near subtree unranked; encode that in the input
        // items so the round trip compares equal.
        let blob = encode_stack(&items);
        let tree = build_query(&blob, &PlainBuildEnv).unwrap();
        let mut dumped = Vec::new();
        tree.dump(&mut dumped);
        let rebuilt = build_query(&encode_stack(&dumped), &PlainBuildEnv).unwrap();
        assert_eq!(tree, rebuilt);
    }
}
