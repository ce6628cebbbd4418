use serde::{Serialize, Deserialize};

/// Position key `(field, element, position)` used for windowing and ordering.
pub type HitKey = (u32, u32, u32);

/// One positional match produced by a field searcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hit {
    pub field_id: u32,
    pub element_id: u32,
    pub element_weight: i32,
    /// Token count of the element this hit landed in.
    pub element_length: u32,
    pub position: u32,
}

impl Hit {
    pub fn new(field_id: u32, element_id: u32, element_weight: i32,
               element_length: u32, position: u32) -> Self {
        Hit { field_id, element_id, element_weight, element_length, position }
    }

    pub fn key(&self) -> HitKey {
        (self.field_id, self.element_id, self.position)
    }

    pub fn field_element(&self) -> (u32, u32) {
        (self.field_id, self.element_id)
    }
}

/// Ordered by `(field_id, element_id, position)`, duplicates on that key
/// collapsed.
pub type HitList = Vec<Hit>;

/// Insert keeping the sort invariant, collapsing duplicate keys.
pub fn insert_hit(list: &mut HitList, hit: Hit) {
    match list.binary_search_by_key(&hit.key(), |h| h.key()) {
        Ok(_) => {}
        Err(idx) => list.insert(idx, hit),
    }
}

/// Union of two sorted hit lists, de-duplicated on the position key.
pub fn merge_hit_lists(a: &HitList, b: &HitList) -> HitList {
    let mut out = HitList::with_capacity(a.len() + b.len());
    let (mut i, mut j) = (0, 0);
    while i < a.len() && j < b.len() {
        if a[i].key() < b[j].key() {
            out.push(a[i]);
            i += 1;
        } else if b[j].key() < a[i].key() {
            out.push(b[j]);
            j += 1;
        } else {
            out.push(a[i]);
            i += 1;
            j += 1;
        }
    }
    out.extend_from_slice(&a[i..]);
    out.extend_from_slice(&b[j..]);
    out
}

/// Cursor pack over the hit lists of a node's children, used by phrase,
/// same-element, near and onear evaluation.
pub struct HitIteratorPack {
    lists: Vec<HitList>,
    cursors: Vec<usize>,
    field_element: (u32, u32),
}

impl HitIteratorPack {
    pub fn new(lists: Vec<HitList>) -> Self {
        let cursors = vec![0; lists.len()];
        HitIteratorPack { lists, cursors, field_element: (0, 0) }
    }

    pub fn len(&self) -> usize {
        self.lists.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lists.is_empty()
    }

    pub fn field_element(&self) -> (u32, u32) {
        self.field_element
    }

    pub fn set_field_element(&mut self, fe: (u32, u32)) {
        self.field_element = fe;
    }

    pub fn valid(&self, idx: usize) -> bool {
        self.cursors[idx] < self.lists[idx].len()
    }

    pub fn hit(&self, idx: usize) -> &Hit {
        &self.lists[idx][self.cursors[idx]]
    }

    pub fn advance(&mut self, idx: usize) {
        self.cursors[idx] += 1;
    }

    pub fn all_valid(&self) -> bool {
        !self.lists.is_empty() && (0..self.lists.len()).all(|i| self.valid(i))
    }

    /// Advance cursor `idx` until its field-element is at least the pack's
    /// current one. Returns false when the cursor is exhausted.
    pub fn seek_to_field_element(&mut self, idx: usize) -> bool {
        while self.valid(idx) {
            if self.hit(idx).field_element() >= self.field_element {
                return true;
            }
            self.advance(idx);
        }
        false
    }

    /// Advance all cursors until they agree on a field-element. The pack's
    /// field-element tracks the highest one seen.
    pub fn seek_to_matching_field_element(&mut self) -> bool {
        let mut retry = true;
        while retry {
            retry = false;
            for idx in 0..self.len() {
                if !self.seek_to_field_element(idx) {
                    return false;
                }
                let fe = self.hit(idx).field_element();
                if fe > self.field_element {
                    self.field_element = fe;
                    retry = true;
                    break;
                }
            }
        }
        true
    }

    /// Step cursor `idx` one hit forward; false if it leaves the pack's
    /// current field-element (which is then updated).
    pub fn step_in_field_element(&mut self, idx: usize) -> bool {
        self.advance(idx);
        if !self.valid(idx) {
            return false;
        }
        let fe = self.hit(idx).field_element();
        if fe > self.field_element {
            self.field_element = fe;
            return false;
        }
        true
    }

    /// Advance cursor `idx` within the current field-element until its
    /// position is at least `word_pos`.
    pub fn seek_in_field_element(&mut self, idx: usize, word_pos: u32) -> bool {
        while self.hit(idx).position < word_pos {
            if !self.step_in_field_element(idx) {
                return false;
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn h(f: u32, e: u32, p: u32) -> Hit {
        Hit::new(f, e, 1, 100, p)
    }

    #[test]
    fn test_insert_keeps_order_and_collapses_duplicates() {
        let mut list = HitList::new();
        insert_hit(&mut list, h(0, 0, 5));
        insert_hit(&mut list, h(0, 0, 2));
        insert_hit(&mut list, h(0, 0, 5));
        insert_hit(&mut list, h(1, 0, 0));
        let keys: Vec<_> = list.iter().map(|x| x.key()).collect();
        assert_eq!(keys, vec![(0, 0, 2), (0, 0, 5), (1, 0, 0)]);
    }

    #[test]
    fn test_merge_dedups() {
        let a = vec![h(0, 0, 1), h(0, 0, 3)];
        let b = vec![h(0, 0, 2), h(0, 0, 3)];
        let merged = merge_hit_lists(&a, &b);
        let keys: Vec<_> = merged.iter().map(|x| x.key()).collect();
        assert_eq!(keys, vec![(0, 0, 1), (0, 0, 2), (0, 0, 3)]);
    }

    #[test]
    fn test_pack_seeks_to_common_element() {
        let lists = vec![
            vec![h(0, 0, 1), h(0, 2, 4)],
            vec![h(0, 1, 2), h(0, 2, 9)],
        ];
        let mut pack = HitIteratorPack::new(lists);
        assert!(pack.all_valid());
        assert!(pack.seek_to_matching_field_element());
        assert_eq!(pack.field_element(), (0, 2));
        assert_eq!(pack.hit(0).position, 4);
        assert_eq!(pack.hit(1).position, 9);
    }

    #[test]
    fn test_pack_runs_dry() {
        let lists = vec![vec![h(0, 0, 1)], vec![h(1, 0, 2)]];
        let mut pack = HitIteratorPack::new(lists);
        // Cursor 0 can never reach field 1.
        pack.set_field_element((1, 0));
        assert!(!pack.seek_to_matching_field_element() || pack.field_element() >= (1, 0));
    }
}
