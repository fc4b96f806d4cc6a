//! Partition of a large virtual texture into bounded indirection maps.
//!
//! Each map covers `S x S` mip-0 tiles (`S = 2^(mip_levels - 1)`), so the
//! coarsest mip of a map is a single texel. Maps whose last valid entry is
//! cleared go on a free list and are reused for the next new key before
//! anything is allocated.

use rustc_hash::FxHashMap;
use strata_jobs::JobPool;
use tracing::{debug, trace};

use crate::error::VirtualTextureError;
use crate::indirection::{IndirectionMap, IndirectionSink, check_layout};
use crate::page_entry::MapEntry;
use crate::tile::{IndirectionTileKey, VirtualTile};

#[derive(Debug)]
struct MapSlot {
    key: Option<IndirectionTileKey>,
    map: IndirectionMap,
    in_free_list: bool,
}

/// Arena of indirection maps addressed by [`IndirectionTileKey`].
#[derive(Debug)]
pub struct IndirectionMapCache {
    map_size: u32,
    mip_count: u32,
    slots: Vec<MapSlot>,
    lookup: FxHashMap<IndirectionTileKey, usize>,
    free: Vec<usize>,
}

impl IndirectionMapCache {
    pub fn new(map_size: u32, mip_count: u32) -> Result<Self, VirtualTextureError> {
        check_layout(map_size, mip_count)?;
        Ok(Self {
            map_size,
            mip_count,
            slots: Vec::new(),
            lookup: FxHashMap::default(),
            free: Vec::new(),
        })
    }

    /// Mip-0 tiles per side covered by one map.
    pub fn map_size(&self) -> u32 {
        self.map_size
    }

    pub fn mip_count(&self) -> u32 {
        self.mip_count
    }

    /// Allocated maps, including ones waiting for reuse.
    pub fn tile_count(&self) -> usize {
        self.slots.len()
    }

    /// Maps currently bound to a key.
    pub fn active_count(&self) -> usize {
        self.lookup.len()
    }

    /// Maps with no valid entries, available for reuse.
    pub fn free_count(&self) -> usize {
        self.free.len()
    }

    /// Map key and texel holding `tile`, or `None` for mips out of range.
    pub fn locate(&self, tile: VirtualTile) -> Option<(IndirectionTileKey, u32, u32)> {
        if tile.mip >= self.mip_count {
            return None;
        }
        let side = self.map_size >> tile.mip;
        let key = IndirectionTileKey {
            x: tile.x / side,
            y: tile.y / side,
        };
        Some((key, tile.x % side, tile.y % side))
    }

    /// Index of the map for `key`, reusing an empty map or allocating one.
    pub fn get_or_create_indirection_tile(&mut self, key: IndirectionTileKey) -> usize {
        if let Some(&index) = self.lookup.get(&key) {
            return index;
        }

        while let Some(index) = self.free.pop() {
            let slot = &mut self.slots[index];
            slot.in_free_list = false;
            if !slot.map.is_empty() {
                continue;
            }
            if let Some(old) = slot.key.take() {
                self.lookup.remove(&old);
            }
            slot.map.reset();
            slot.key = Some(key);
            self.lookup.insert(key, index);
            trace!(?key, index, "reusing indirection map");
            return index;
        }

        let index = self.slots.len();
        self.slots.push(MapSlot {
            key: Some(key),
            map: IndirectionMap::with_layout(self.map_size, self.mip_count),
            in_free_list: false,
        });
        self.lookup.insert(key, index);
        debug!(?key, index, "allocated indirection map");
        index
    }

    /// Write the raw entry of `tile`. Returns `false` for invalid coordinates.
    pub fn set_tile(&mut self, tile: VirtualTile, entry: MapEntry) -> bool {
        let Some((key, x, y)) = self.locate(tile) else {
            return false;
        };
        let index = self.get_or_create_indirection_tile(key);
        self.slots[index].map.set_pixel(x, y, tile.mip, entry)
    }

    /// Invalidate the raw entry of `tile`.
    pub fn clear_tile(&mut self, tile: VirtualTile) -> bool {
        let Some((key, x, y)) = self.locate(tile) else {
            return false;
        };
        let Some(&index) = self.lookup.get(&key) else {
            return false;
        };
        let slot = &mut self.slots[index];
        let cleared = slot.map.clear_pixel(x, y, tile.mip);
        if slot.map.is_empty() && !slot.in_free_list {
            slot.in_free_list = true;
            self.free.push(index);
        }
        cleared
    }

    /// Raw entry of `tile`.
    pub fn raw_entry(&self, tile: VirtualTile) -> Option<MapEntry> {
        let (key, x, y) = self.locate(tile)?;
        self.map(key)?.raw(x, y, tile.mip)
    }

    /// Resolved (redirected) entry of `tile` as last collected.
    pub fn resolve(&self, tile: VirtualTile) -> Option<MapEntry> {
        let (key, x, y) = self.locate(tile)?;
        self.map(key)?.resolved(x, y, tile.mip)
    }

    pub fn map(&self, key: IndirectionTileKey) -> Option<&IndirectionMap> {
        self.lookup.get(&key).map(|&index| &self.slots[index].map)
    }

    /// Collect last frame's redirection jobs and upload them. Returns the
    /// number of maps uploaded.
    pub fn begin_mip_redirection_update(&mut self, sink: &mut dyn IndirectionSink) -> usize {
        let mut uploaded = 0;
        for slot in &mut self.slots {
            if let Some(key) = slot.key
                && slot.map.begin_mip_redirection_update(key, sink)
            {
                uploaded += 1;
            }
        }
        uploaded
    }

    /// Launch redirection jobs for dirty maps. Returns the number launched.
    pub fn end_mip_redirection_update(&mut self, pool: &JobPool) -> usize {
        let mut launched = 0;
        for slot in &mut self.slots {
            if slot.key.is_some() && slot.map.end_mip_redirection_update(pool) {
                launched += 1;
            }
        }
        launched
    }

    /// Block on every running redirection job.
    pub fn wait_all(&mut self) {
        for slot in &mut self.slots {
            slot.map.wait();
        }
    }

    /// Drop every map.
    pub fn clear(&mut self) {
        self.wait_all();
        self.slots.clear();
        self.lookup.clear();
        self.free.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(x: u32, y: u32) -> IndirectionTileKey {
        IndirectionTileKey { x, y }
    }

    #[test]
    fn test_locate_splits_by_map_size() {
        let cache = IndirectionMapCache::new(4, 3).unwrap();
        assert_eq!(cache.locate(VirtualTile::new(5, 2, 0)), Some((key(1, 0), 1, 2)));
        assert_eq!(cache.locate(VirtualTile::new(5, 2, 1)), Some((key(2, 1), 1, 0)));
        assert_eq!(cache.locate(VirtualTile::new(3, 3, 2)), Some((key(3, 3), 0, 0)));
        assert_eq!(cache.locate(VirtualTile::new(0, 0, 3)), None);
    }

    #[test]
    fn test_set_and_clear_through_keys() {
        let mut cache = IndirectionMapCache::new(4, 3).unwrap();
        let tile = VirtualTile::new(6, 1, 0);
        assert!(cache.set_tile(tile, MapEntry::new(2, 3, 0)));
        assert_eq!(cache.active_count(), 1);
        assert_eq!(cache.raw_entry(tile), Some(MapEntry::new(2, 3, 0)));
        assert!(cache.clear_tile(tile));
        assert_eq!(cache.raw_entry(tile), Some(MapEntry::INVALID));
        assert_eq!(cache.free_count(), 1);
        assert!(!cache.clear_tile(VirtualTile::new(100, 100, 0)));
        assert!(!cache.set_tile(VirtualTile::new(0, 0, 7), MapEntry::new(0, 0, 0)));
    }

    #[test]
    fn test_empty_map_is_reused_before_allocating() {
        let mut cache = IndirectionMapCache::new(2, 2).unwrap();
        let a = VirtualTile::new(0, 0, 0);
        let b = VirtualTile::new(4, 4, 0);
        cache.set_tile(a, MapEntry::new(1, 1, 0));
        cache.clear_tile(a);

        cache.set_tile(b, MapEntry::new(2, 2, 0));
        assert_eq!(cache.tile_count(), 1);
        assert_eq!(cache.active_count(), 1);
        assert!(cache.map(key(0, 0)).is_none());
        assert_eq!(cache.raw_entry(b), Some(MapEntry::new(2, 2, 0)));
        assert_eq!(cache.raw_entry(a), None);
    }

    #[test]
    fn test_refilled_map_is_not_reused() {
        let mut cache = IndirectionMapCache::new(2, 2).unwrap();
        let a = VirtualTile::new(0, 0, 0);
        cache.set_tile(a, MapEntry::new(1, 1, 0));
        cache.clear_tile(a);
        cache.set_tile(a, MapEntry::new(1, 1, 0));

        cache.set_tile(VirtualTile::new(4, 4, 0), MapEntry::new(2, 2, 0));
        assert_eq!(cache.tile_count(), 2);
        assert_eq!(cache.raw_entry(a), Some(MapEntry::new(1, 1, 0)));
    }

    #[test]
    fn test_redirection_runs_per_dirty_map() {
        let pool = JobPool::inline();
        let mut cache = IndirectionMapCache::new(2, 2).unwrap();
        cache.set_tile(VirtualTile::new(0, 0, 1), MapEntry::new(0, 0, 1));
        cache.set_tile(VirtualTile::new(1, 0, 1), MapEntry::new(1, 0, 1));
        assert_eq!(cache.end_mip_redirection_update(&pool), 2);

        let mut uploaded_keys = Vec::new();
        let mut sink = |k: IndirectionTileKey, mip: u32, _: u32, _: &[MapEntry]| {
            if mip == 0 {
                uploaded_keys.push(k);
            }
        };
        assert_eq!(cache.begin_mip_redirection_update(&mut sink), 2);
        drop(sink);
        uploaded_keys.sort();
        assert_eq!(uploaded_keys, vec![key(0, 0), key(1, 0)]);
        assert_eq!(
            cache.resolve(VirtualTile::new(3, 1, 0)),
            Some(MapEntry::new(1, 0, 1))
        );
        assert_eq!(cache.end_mip_redirection_update(&pool), 0);
    }
}
