use crate::storage::layout::{DataLocation, SECTOR_SIZE, align_down, align_up};

/// Turn the uncached locations of a block into a minimal list of disk
/// reads: sorted, rounded to 512-byte bounds and coalesced when the gap
/// between neighbours is below `max_gap`. Returned positions are absolute
/// within the file.
pub fn plan_reads(
    is_cached: &dyn Fn(DataLocation) -> bool,
    locations: &[DataLocation],
    max_gap: u32,
    block_start: u32,
) -> Vec<DataLocation> {
    let mut wanted: Vec<DataLocation> = locations
        .iter()
        .filter(|loc| loc.size > 0 && !is_cached(**loc))
        .map(|loc| DataLocation::new(loc.pos + block_start, loc.size))
        .collect();
    wanted.sort();

    let mut operations: Vec<DataLocation> = Vec::new();
    for loc in wanted {
        let start = align_down(loc.pos, SECTOR_SIZE);
        let stop = align_up(loc.end(), SECTOR_SIZE);
        if let Some(last) = operations.last_mut() {
            let last_stop = last.end();
            if last_stop >= start || start - last_stop < max_gap {
                if stop > last_stop {
                    last.size += stop - last_stop;
                }
                continue;
            }
        }
        operations.push(DataLocation::new(start, stop - start));
    }
    operations
}

pub fn total_read_size(operations: &[DataLocation]) -> u32 {
    operations.iter().map(|op| op.size).sum()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn no_cache(_: DataLocation) -> bool {
        false
    }

    #[test]
    fn test_locations_are_aligned_and_absolute() {
        let ops = plan_reads(&no_cache, &[DataLocation::new(100, 50)], 0, 1024);
        assert_eq!(ops, vec![DataLocation::new(1024, 512)]);
    }

    #[test]
    fn test_small_gaps_are_coalesced() {
        let locations = [DataLocation::new(0, 100), DataLocation::new(900, 100)];
        // Gap between aligned ranges is 512..512 -> 0 bytes after rounding;
        // with a generous max gap, a single read results.
        let ops = plan_reads(&no_cache, &locations, 4096, 0);
        assert_eq!(ops, vec![DataLocation::new(0, 1024)]);
    }

    #[test]
    fn test_large_gaps_split_reads() {
        let locations = [DataLocation::new(0, 100), DataLocation::new(64 * 1024, 100)];
        let ops = plan_reads(&no_cache, &locations, 512, 0);
        assert_eq!(ops.len(), 2);
        assert_eq!(ops[0], DataLocation::new(0, 512));
        assert_eq!(ops[1], DataLocation::new(64 * 1024, 512));
    }

    #[test]
    fn test_cached_and_empty_locations_are_skipped() {
        let cached = |loc: DataLocation| loc.pos == 0;
        let locations = [
            DataLocation::new(0, 100),
            DataLocation::new(2048, 0),
            DataLocation::new(4096, 10),
        ];
        let ops = plan_reads(&cached, &locations, 0, 0);
        assert_eq!(ops, vec![DataLocation::new(4096, 512)]);
    }

    #[test]
    fn test_contained_ranges_do_not_grow_the_read() {
        let locations = [DataLocation::new(0, 1000), DataLocation::new(100, 50)];
        let ops = plan_reads(&no_cache, &locations, 0, 0);
        assert_eq!(ops, vec![DataLocation::new(0, 1024)]);
        assert_eq!(total_read_size(&ops), 1024);
    }
}
