use roaring::RoaringBitmap;
use std::collections::HashMap;
use std::sync::Arc;

use crate::query::hit::{Hit, HitIteratorPack, HitKey, HitList};

/// Per-field gap allowing windows to continue into the next element.
/// A field without an entry does not match across element boundaries.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ElementGaps {
    gaps: HashMap<u32, u32>,
}

impl ElementGaps {
    pub fn new() -> Self {
        ElementGaps::default()
    }

    pub fn set(&mut self, field_id: u32, gap: u32) {
        self.gaps.insert(field_id, gap);
    }

    pub fn get(&self, field_id: u32) -> Option<u32> {
        self.gaps.get(&field_id).copied()
    }
}

pub type SharedElementGaps = Arc<ElementGaps>;

/// Elements that windows may not match inside, built from the hit lists of
/// terms on the negative side of an AND-NOT under a near node.
#[derive(Debug, Default)]
pub struct NegativeFilter {
    forbidden: HashMap<u32, RoaringBitmap>,
}

impl NegativeFilter {
    pub fn new() -> Self {
        NegativeFilter::default()
    }

    pub fn add_hits(&mut self, hits: &HitList) {
        for hit in hits {
            self.forbidden.entry(hit.field_id).or_default().insert(hit.element_id);
        }
    }

    pub fn allows(&self, field_id: u32, element_id: u32) -> bool {
        match self.forbidden.get(&field_id) {
            Some(elements) => !elements.contains(element_id),
            None => true,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.forbidden.is_empty()
    }
}

/// Window match consumer. The boolean sink short-circuits; the element-id
/// sink keeps enumerating every matching element.
pub trait MatchSink {
    const SHORTCUT: bool;
    fn register(&mut self, element_id: u32);
}

#[derive(Debug, Default)]
pub struct BoolSink {
    pub matched: bool,
}

impl MatchSink for BoolSink {
    const SHORTCUT: bool = true;
    fn register(&mut self, _element_id: u32) {
        self.matched = true;
    }
}

pub struct ElementSink<'a> {
    out: &'a mut Vec<u32>,
}

impl<'a> ElementSink<'a> {
    pub fn new(out: &'a mut Vec<u32>) -> Self {
        ElementSink { out }
    }

    pub fn finish(self) {
        self.out.sort_unstable();
        self.out.dedup();
    }
}

impl MatchSink for ElementSink<'_> {
    const SHORTCUT: bool = false;
    fn register(&mut self, element_id: u32) {
        self.out.push(element_id);
    }
}

/// Last position key still inside the window anchored at `hit`. With an
/// element gap configured the window may continue into the next element.
fn window_end(hit: &Hit, distance: u32, gaps: &ElementGaps) -> HitKey {
    match gaps.get(hit.field_id) {
        Some(gap) if hit.element_length + gap <= hit.position + distance => (
            hit.field_id,
            hit.element_id + 1,
            hit.position + distance - hit.element_length - gap,
        ),
        _ => (hit.field_id, hit.element_id, hit.position + distance),
    }
}

/// Unordered near: every cursor must land within `[first, first+distance]`
/// of the anchor cursor, in the anchor's field-element (or the next one
/// when joined by an element gap).
pub fn evaluate_near<S: MatchSink>(
    positives: Vec<HitList>,
    filter: &NegativeFilter,
    distance: u32,
    gaps: &ElementGaps,
    sink: &mut S,
) {
    let mut pack = HitIteratorPack::new(positives);
    if !pack.all_valid() {
        return;
    }
    let n = pack.len();
    'front: while pack.valid(0) {
        let front = *pack.hit(0);
        let last_allowed = window_end(&front, distance, gaps);
        let mut matched_elements = vec![front.element_id];
        let mut matched = true;
        for idx in 1..n {
            while pack.hit(idx).key() < front.key() {
                pack.advance(idx);
                if !pack.valid(idx) {
                    break 'front;
                }
            }
            let cur = *pack.hit(idx);
            if cur.key() > last_allowed || cur.field_id != front.field_id {
                matched = false;
                break;
            }
            matched_elements.push(cur.element_id);
        }
        if matched && matched_elements.iter().all(|e| filter.allows(front.field_id, *e)) {
            sink.register(front.element_id);
            if S::SHORTCUT {
                return;
            }
        }
        pack.advance(0);
    }
}

/// Ordered near: like `evaluate_near`, but each cursor must advance past
/// the previous cursor's position (child order is the required order).
pub fn evaluate_onear<S: MatchSink>(
    positives: Vec<HitList>,
    filter: &NegativeFilter,
    distance: u32,
    gaps: &ElementGaps,
    sink: &mut S,
) {
    let mut pack = HitIteratorPack::new(positives);
    if !pack.all_valid() {
        return;
    }
    let n = pack.len();
    let mut cur_term_pos: HitKey = (0, 0, 0);
    'front: while pack.valid(0) {
        let front = *pack.hit(0);
        let last_allowed = window_end(&front, distance, gaps);
        if last_allowed < cur_term_pos {
            pack.advance(0);
            continue;
        }
        let mut prev = front.key();
        let mut matched = true;
        let mut last_element = front.element_id;
        for idx in 1..n {
            while pack.hit(idx).key() <= prev {
                pack.advance(idx);
                if !pack.valid(idx) {
                    break 'front;
                }
            }
            cur_term_pos = pack.hit(idx).key();
            if last_allowed < cur_term_pos || pack.hit(idx).field_id != front.field_id {
                matched = false;
                break;
            }
            last_element = pack.hit(idx).element_id;
            prev = cur_term_pos;
        }
        if matched
            && filter.allows(front.field_id, front.element_id)
            && filter.allows(front.field_id, last_element)
        {
            sink.register(front.element_id);
            if S::SHORTCUT {
                return;
            }
        }
        pack.advance(0);
    }
}
