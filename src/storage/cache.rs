use std::collections::HashMap;

use crate::storage::layout::{DataLocation, DocumentPart};

/// Index into the cache's buffer arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferId(usize);

#[derive(Debug, Clone, Copy)]
struct CacheEntry {
    buffer: BufferId,
    offset: u32,
    len: u32,
    /// Whether the bytes at this location are also on disk.
    persisted: bool,
}

/// In-memory cache of header/body block ranges, keyed by `(part, pos,
/// size)`. Buffers live in an arena and entries hold handles, so remapping
/// a location after a write never copies data.
#[derive(Debug, Default)]
pub struct FileCache {
    buffers: Vec<Vec<u8>>,
    entries: [HashMap<DataLocation, CacheEntry>; 2],
}

fn part_index(part: DocumentPart) -> usize {
    match part {
        DocumentPart::Header => 0,
        DocumentPart::Body => 1,
    }
}

impl FileCache {
    pub fn new() -> Self {
        FileCache::default()
    }

    pub fn add_buffer(&mut self, data: Vec<u8>) -> BufferId {
        self.buffers.push(data);
        BufferId(self.buffers.len() - 1)
    }

    pub fn is_cached(&self, part: DocumentPart, loc: DataLocation) -> bool {
        self.entries[part_index(part)].contains_key(&loc)
    }

    pub fn is_persisted(&self, part: DocumentPart, loc: DataLocation) -> bool {
        self.entries[part_index(part)]
            .get(&loc)
            .map(|e| e.persisted)
            .unwrap_or(false)
    }

    /// Bind a location to a range of an arena buffer.
    pub fn cache_location(
        &mut self,
        part: DocumentPart,
        loc: DataLocation,
        buffer: BufferId,
        offset: u32,
        persisted: bool,
    ) {
        debug_assert!((offset + loc.size) as usize <= self.buffers[buffer.0].len());
        self.entries[part_index(part)]
            .insert(loc, CacheEntry { buffer, offset, len: loc.size, persisted });
    }

    /// Allocate a dedicated buffer for `data` and cache it at `loc`.
    pub fn insert_data(
        &mut self,
        part: DocumentPart,
        loc: DataLocation,
        data: Vec<u8>,
        persisted: bool,
    ) {
        debug_assert_eq!(loc.size as usize, data.len());
        let buffer = self.add_buffer(data);
        self.cache_location(part, loc, buffer, 0, persisted);
    }

    pub fn get(&self, part: DocumentPart, loc: DataLocation) -> Option<&[u8]> {
        let entry = self.entries[part_index(part)].get(&loc)?;
        let data = &self.buffers[entry.buffer.0];
        Some(&data[entry.offset as usize..(entry.offset + entry.len) as usize])
    }

    /// Move a single entry from `old` to `new` and mark it persisted.
    pub fn persist(&mut self, part: DocumentPart, old: DataLocation, new: DataLocation) {
        let map = &mut self.entries[part_index(part)];
        if let Some(mut entry) = map.remove(&old) {
            debug_assert_eq!(old.size, new.size);
            entry.persisted = true;
            map.insert(new, entry);
        }
    }

    /// Remap every entry present in `moves` in one pass; used after a full
    /// rewrite where all surviving locations change at once.
    pub fn remap_and_persist_all(
        &mut self,
        part: DocumentPart,
        moves: &HashMap<DataLocation, DataLocation>,
    ) {
        let map = &mut self.entries[part_index(part)];
        let mut remapped = HashMap::with_capacity(map.len());
        for (loc, mut entry) in map.drain() {
            match moves.get(&loc) {
                Some(new_loc) => {
                    entry.persisted = true;
                    remapped.insert(*new_loc, entry);
                }
                None => {
                    remapped.insert(loc, entry);
                }
            }
        }
        *map = remapped;
    }

    /// Locations whose bytes only exist in memory, per part.
    pub fn unpersisted_locations(&self, part: DocumentPart) -> Vec<DataLocation> {
        let mut out: Vec<DataLocation> = self.entries[part_index(part)]
            .iter()
            .filter(|(_, e)| !e.persisted)
            .map(|(loc, _)| *loc)
            .collect();
        out.sort();
        out
    }

    /// Drop every entry and buffer; used when structural reads invalidate
    /// the mapping entirely.
    pub fn clear(&mut self) {
        self.buffers.clear();
        for map in &mut self.entries {
            map.clear();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const HEADER: DocumentPart = DocumentPart::Header;
    const BODY: DocumentPart = DocumentPart::Body;

    #[test]
    fn test_cache_and_get_sub_ranges() {
        let mut cache = FileCache::new();
        let buf = cache.add_buffer(b"aaaabbbbcccc".to_vec());
        cache.cache_location(HEADER, DataLocation::new(0, 4), buf, 0, true);
        cache.cache_location(HEADER, DataLocation::new(512, 4), buf, 8, true);
        assert_eq!(cache.get(HEADER, DataLocation::new(0, 4)).unwrap(), b"aaaa");
        assert_eq!(cache.get(HEADER, DataLocation::new(512, 4)).unwrap(), b"cccc");
        assert!(cache.get(HEADER, DataLocation::new(512, 8)).is_none());
        assert!(cache.get(BODY, DataLocation::new(0, 4)).is_none());
    }

    #[test]
    fn test_persist_remaps_without_copy() {
        let mut cache = FileCache::new();
        cache.insert_data(BODY, DataLocation::new(0, 3), b"xyz".to_vec(), false);
        assert!(!cache.is_persisted(BODY, DataLocation::new(0, 3)));
        cache.persist(BODY, DataLocation::new(0, 3), DataLocation::new(1024, 3));
        assert!(cache.get(BODY, DataLocation::new(0, 3)).is_none());
        assert_eq!(cache.get(BODY, DataLocation::new(1024, 3)).unwrap(), b"xyz");
        assert!(cache.is_persisted(BODY, DataLocation::new(1024, 3)));
    }

    #[test]
    fn test_remap_all_in_one_pass() {
        let mut cache = FileCache::new();
        cache.insert_data(HEADER, DataLocation::new(0, 1), b"a".to_vec(), true);
        cache.insert_data(HEADER, DataLocation::new(512, 1), b"b".to_vec(), false);
        let mut moves = HashMap::new();
        moves.insert(DataLocation::new(0, 1), DataLocation::new(100, 1));
        moves.insert(DataLocation::new(512, 1), DataLocation::new(200, 1));
        cache.remap_and_persist_all(HEADER, &moves);
        assert_eq!(cache.get(HEADER, DataLocation::new(100, 1)).unwrap(), b"a");
        assert_eq!(cache.get(HEADER, DataLocation::new(200, 1)).unwrap(), b"b");
        assert!(cache.is_persisted(HEADER, DataLocation::new(200, 1)));
    }

    #[test]
    fn test_unpersisted_locations_sorted() {
        let mut cache = FileCache::new();
        cache.insert_data(BODY, DataLocation::new(512, 1), b"b".to_vec(), false);
        cache.insert_data(BODY, DataLocation::new(0, 1), b"a".to_vec(), false);
        cache.insert_data(BODY, DataLocation::new(1024, 1), b"c".to_vec(), true);
        assert_eq!(
            cache.unpersisted_locations(BODY),
            vec![DataLocation::new(0, 1), DataLocation::new(512, 1)]
        );
    }
}
