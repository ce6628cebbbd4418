use std::collections::HashMap;

use crate::storage::layout::{DataLocation, DocumentPart, MetaSlot};

/// Enumerates, per part, each distinct on-disk location in first-seen
/// order together with the slots pointing at it. The rewrite path uses
/// this to write shared content once (content-addressed deduplication).
pub struct UniqueSlotGenerator {
    per_part: [Vec<(DataLocation, Vec<usize>)>; 2],
}

fn part_index(part: DocumentPart) -> usize {
    match part {
        DocumentPart::Header => 0,
        DocumentPart::Body => 1,
    }
}

impl UniqueSlotGenerator {
    pub fn new(slots: &[MetaSlot]) -> Self {
        let mut per_part: [Vec<(DataLocation, Vec<usize>)>; 2] = [Vec::new(), Vec::new()];
        let mut seen: [HashMap<DataLocation, usize>; 2] = [HashMap::new(), HashMap::new()];
        for (slot_idx, slot) in slots.iter().enumerate() {
            for part in DocumentPart::ALL {
                let loc = slot.location(part);
                if loc.is_empty() {
                    continue;
                }
                let p = part_index(part);
                match seen[p].get(&loc) {
                    Some(unique_idx) => per_part[p][*unique_idx].1.push(slot_idx),
                    None => {
                        seen[p].insert(loc, per_part[p].len());
                        per_part[p].push((loc, vec![slot_idx]));
                    }
                }
            }
        }
        UniqueSlotGenerator { per_part }
    }

    pub fn num_unique(&self, part: DocumentPart) -> usize {
        self.per_part[part_index(part)].len()
    }

    pub fn location(&self, part: DocumentPart, unique_idx: usize) -> DataLocation {
        self.per_part[part_index(part)][unique_idx].0
    }

    pub fn slots(&self, part: DocumentPart, unique_idx: usize) -> &[usize] {
        &self.per_part[part_index(part)][unique_idx].1
    }

    pub fn iter(&self, part: DocumentPart) -> impl Iterator<Item = &(DataLocation, Vec<usize>)> {
        self.per_part[part_index(part)].iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::Timestamp;

    fn slot(ts: u64, header: (u32, u32), body: (u32, u32)) -> MetaSlot {
        let mut slot = MetaSlot {
            timestamp: Timestamp(ts),
            ..MetaSlot::default()
        };
        slot.set_location(DocumentPart::Header, DataLocation::new(header.0, header.1));
        slot.set_location(DocumentPart::Body, DataLocation::new(body.0, body.1));
        slot.set_in_use(true);
        slot.update_checksum();
        slot
    }

    #[test]
    fn test_shared_locations_group_slots() {
        // Slots 0 and 2 share the same header bytes.
        let slots = vec![
            slot(1, (0, 100), (0, 50)),
            slot(2, (512, 80), (512, 60)),
            slot(3, (0, 100), (1024, 70)),
        ];
        let unique = UniqueSlotGenerator::new(&slots);
        assert_eq!(unique.num_unique(DocumentPart::Header), 2);
        assert_eq!(unique.num_unique(DocumentPart::Body), 3);
        assert_eq!(unique.slots(DocumentPart::Header, 0), &[0, 2]);
        assert_eq!(unique.location(DocumentPart::Header, 1), DataLocation::new(512, 80));
    }

    #[test]
    fn test_empty_locations_are_skipped() {
        let slots = vec![slot(1, (0, 100), (0, 0))];
        let unique = UniqueSlotGenerator::new(&slots);
        assert_eq!(unique.num_unique(DocumentPart::Header), 1);
        assert_eq!(unique.num_unique(DocumentPart::Body), 0);
    }
}
