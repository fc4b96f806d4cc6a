//! CPU-side indirection (page-table) pyramid and its mip redirection.
//!
//! An indirection map of size `S` holds `S >> mip` squared entries per mip.
//! Entries are written into the *raw* pyramid as tiles become resident or are
//! evicted. The renderer never sees the raw pyramid: a background job copies
//! it and fills every invalid entry with the resolved entry of its parent
//! texel, and the next frame uploads that *resolved* pyramid. The raw
//! snapshot and the job's destination buffer are owned by the job while it
//! runs, so the uploaded pyramid and the one being computed never alias.

use strata_jobs::{JobHandle, JobPool};
use tracing::{trace, warn};

use crate::error::VirtualTextureError;
use crate::page_entry::MapEntry;
use crate::tile::IndirectionTileKey;

/// Receiver of resolved indirection pyramids, one call per mip.
pub trait IndirectionSink {
    /// `entries` holds `side * side` records of mip `mip` of map `key`.
    fn upload(&mut self, key: IndirectionTileKey, mip: u32, side: u32, entries: &[MapEntry]);
}

impl<F> IndirectionSink for F
where
    F: FnMut(IndirectionTileKey, u32, u32, &[MapEntry]),
{
    fn upload(&mut self, key: IndirectionTileKey, mip: u32, side: u32, entries: &[MapEntry]) {
        self(key, mip, side, entries)
    }
}

/// Check that `size` is a power of two large enough for `mip_count` mips.
pub(crate) fn check_layout(size: u32, mip_count: u32) -> Result<(), VirtualTextureError> {
    if mip_count == 0 || mip_count > 32 || !size.is_power_of_two() || (size >> (mip_count - 1)) == 0
    {
        return Err(VirtualTextureError::IndirectionLayout { size, mip_count });
    }
    Ok(())
}

/// Start offset of every mip, plus the total length as the last element.
fn mip_offsets(size: u32, mip_count: u32) -> Vec<usize> {
    let mut offsets = Vec::with_capacity(mip_count as usize + 1);
    let mut offset = 0;
    for mip in 0..mip_count {
        offsets.push(offset);
        let side = (size >> mip) as usize;
        offset += side * side;
    }
    offsets.push(offset);
    offsets
}

/// Number of entries in a pyramid of `mip_count` mips starting at `size`.
pub fn pyramid_len(size: u32, mip_count: u32) -> usize {
    (0..mip_count)
        .map(|mip| ((size >> mip) as usize).pow(2))
        .sum()
}

/// Resolve `raw` into `dst`: the coarsest mip is copied, then every finer
/// invalid entry takes the resolved entry of its parent texel.
///
/// Returns `false` (leaving `dst` untouched) when the buffers do not match
/// the layout.
pub fn process_for_mip_redirection(
    raw: &[MapEntry],
    dst: &mut [MapEntry],
    size: u32,
    mip_count: u32,
) -> bool {
    if check_layout(size, mip_count).is_err() {
        return false;
    }
    let offsets = mip_offsets(size, mip_count);
    let len = offsets[mip_count as usize];
    if raw.len() != len || dst.len() != len {
        return false;
    }

    let top = (mip_count - 1) as usize;
    dst[offsets[top]..len].copy_from_slice(&raw[offsets[top]..len]);

    for mip in (0..top).rev() {
        let side = (size >> mip) as usize;
        let parent_side = side / 2;
        let (finer, coarser) = dst.split_at_mut(offsets[mip + 1]);
        let parents = &coarser[..parent_side * parent_side];
        for y in 0..side {
            for x in 0..side {
                let index = offsets[mip] + y * side + x;
                let entry = raw[index];
                finer[index] = if entry.is_valid() {
                    entry
                } else {
                    parents[(y / 2) * parent_side + x / 2]
                };
            }
        }
    }
    true
}

type RedirectionResult = (Vec<MapEntry>, Vec<MapEntry>);

/// One indirection tile: raw pyramid, resolved pyramid and the double-buffered
/// redirection job between them.
#[derive(Debug)]
pub struct IndirectionMap {
    size: u32,
    mip_count: u32,
    offsets: Vec<usize>,
    raw: Vec<MapEntry>,
    valid_count: usize,
    dirty: bool,
    resolved: Vec<MapEntry>,
    spare_resolved: Option<Vec<MapEntry>>,
    spare_snapshot: Option<Vec<MapEntry>>,
    job: Option<JobHandle<RedirectionResult>>,
    uploads: u64,
}

impl IndirectionMap {
    /// Create an all-invalid map of `size` entries per side at mip 0.
    pub fn new(size: u32, mip_count: u32) -> Result<Self, VirtualTextureError> {
        check_layout(size, mip_count)?;
        Ok(Self::with_layout(size, mip_count))
    }

    pub(crate) fn with_layout(size: u32, mip_count: u32) -> Self {
        let offsets = mip_offsets(size, mip_count);
        let len = offsets[mip_count as usize];
        Self {
            size,
            mip_count,
            offsets,
            raw: vec![MapEntry::INVALID; len],
            valid_count: 0,
            dirty: true,
            resolved: vec![MapEntry::INVALID; len],
            spare_resolved: None,
            spare_snapshot: None,
            job: None,
            uploads: 0,
        }
    }

    pub fn size(&self) -> u32 {
        self.size
    }

    pub fn mip_count(&self) -> u32 {
        self.mip_count
    }

    /// Number of valid raw entries across all mips.
    pub fn valid_count(&self) -> usize {
        self.valid_count
    }

    pub fn is_empty(&self) -> bool {
        self.valid_count == 0
    }

    /// Raw entries changed since the last redirection job was launched.
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// A redirection job has been launched and not yet collected.
    pub fn is_job_pending(&self) -> bool {
        self.job.is_some()
    }

    /// Number of resolved pyramids handed to a sink.
    pub fn upload_count(&self) -> u64 {
        self.uploads
    }

    fn index(&self, x: u32, y: u32, mip: u32) -> Option<usize> {
        if mip >= self.mip_count {
            return None;
        }
        let side = self.size >> mip;
        if x >= side || y >= side {
            return None;
        }
        Some(self.offsets[mip as usize] + (y * side + x) as usize)
    }

    /// Write a raw entry. Returns `false` for out-of-range coordinates.
    pub fn set_pixel(&mut self, x: u32, y: u32, mip: u32, entry: MapEntry) -> bool {
        let Some(index) = self.index(x, y, mip) else {
            return false;
        };
        let was_valid = self.raw[index].is_valid();
        match (was_valid, entry.is_valid()) {
            (false, true) => self.valid_count += 1,
            (true, false) => self.valid_count -= 1,
            _ => {}
        }
        self.raw[index] = entry;
        self.dirty = true;
        true
    }

    /// Invalidate a raw entry. Returns `false` for out-of-range coordinates.
    pub fn clear_pixel(&mut self, x: u32, y: u32, mip: u32) -> bool {
        self.set_pixel(x, y, mip, MapEntry::INVALID)
    }

    /// Raw entry as last written.
    pub fn raw(&self, x: u32, y: u32, mip: u32) -> Option<MapEntry> {
        self.index(x, y, mip).map(|i| self.raw[i])
    }

    /// Entry of the most recently collected resolved pyramid.
    pub fn resolved(&self, x: u32, y: u32, mip: u32) -> Option<MapEntry> {
        self.index(x, y, mip).map(|i| self.resolved[i])
    }

    /// Collect the previous frame's redirection job and upload its result.
    ///
    /// Returns `true` when a new resolved pyramid was handed to `sink`.
    pub fn begin_mip_redirection_update(
        &mut self,
        key: IndirectionTileKey,
        sink: &mut dyn IndirectionSink,
    ) -> bool {
        if !self.collect() {
            return false;
        }
        for mip in 0..self.mip_count {
            let range = self.offsets[mip as usize]..self.offsets[mip as usize + 1];
            sink.upload(key, mip, self.size >> mip, &self.resolved[range]);
        }
        self.uploads += 1;
        true
    }

    /// Launch a redirection job if the raw pyramid changed and none is running.
    ///
    /// Returns `true` when a job was launched.
    pub fn end_mip_redirection_update(&mut self, pool: &JobPool) -> bool {
        if !self.dirty || self.job.is_some() {
            return false;
        }
        let len = self.raw.len();
        let mut snapshot = self.spare_snapshot.take().unwrap_or_default();
        snapshot.clear();
        snapshot.extend_from_slice(&self.raw);
        let mut dst = self.spare_resolved.take().unwrap_or_default();
        dst.resize(len, MapEntry::INVALID);

        let (size, mip_count) = (self.size, self.mip_count);
        self.job = Some(pool.spawn(move || {
            process_for_mip_redirection(&snapshot, &mut dst, size, mip_count);
            (snapshot, dst)
        }));
        self.dirty = false;
        true
    }

    /// Block on a running job and make its result current without uploading.
    pub fn wait(&mut self) {
        self.collect();
    }

    fn collect(&mut self) -> bool {
        let Some(job) = self.job.take() else {
            return false;
        };
        match job.wait() {
            Some((snapshot, resolved)) => {
                let previous = std::mem::replace(&mut self.resolved, resolved);
                self.spare_resolved = Some(previous);
                self.spare_snapshot = Some(snapshot);
                trace!(valid = self.valid_count, "collected mip redirection");
                true
            }
            None => {
                warn!("mip redirection job did not complete, retrying next frame");
                self.dirty = true;
                false
            }
        }
    }

    /// Invalidate every entry, discarding any running job's result.
    pub fn reset(&mut self) {
        if let Some(job) = self.job.take() {
            let _ = job.wait();
        }
        self.raw.fill(MapEntry::INVALID);
        self.resolved.fill(MapEntry::INVALID);
        self.valid_count = 0;
        self.dirty = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(n: u8) -> MapEntry {
        MapEntry::new(n, n, 0)
    }

    #[test]
    fn test_layout_validation() {
        assert!(IndirectionMap::new(8, 4).is_ok());
        assert!(IndirectionMap::new(8, 5).is_err());
        assert!(IndirectionMap::new(6, 2).is_err());
        assert!(IndirectionMap::new(4, 0).is_err());
        assert_eq!(pyramid_len(8, 4), 64 + 16 + 4 + 1);
    }

    #[test]
    fn test_valid_count_tracks_transitions() {
        let mut map = IndirectionMap::new(4, 3).unwrap();
        assert!(map.set_pixel(1, 1, 0, entry(1)));
        assert!(map.set_pixel(1, 1, 0, entry(2)));
        assert_eq!(map.valid_count(), 1);
        assert!(map.set_pixel(0, 0, 2, entry(3)));
        assert_eq!(map.valid_count(), 2);
        assert!(map.clear_pixel(1, 1, 0));
        assert!(map.clear_pixel(1, 1, 0));
        assert_eq!(map.valid_count(), 1);
        assert!(!map.set_pixel(2, 0, 1, entry(4)));
        assert!(!map.set_pixel(0, 0, 3, entry(4)));
        assert_eq!(map.raw(0, 0, 2), Some(entry(3)));
    }

    #[test]
    fn test_redirection_fills_from_parents() {
        let size = 4;
        let mut raw = vec![MapEntry::INVALID; pyramid_len(size, 3)];
        // Coarsest mip (index 20) and one mip-1 texel (1, 0) -> index 16 + 1.
        raw[20] = MapEntry::new(9, 9, 2);
        raw[17] = MapEntry::new(5, 5, 1);
        // One mip-0 texel (3, 3).
        raw[15] = MapEntry::new(1, 2, 0);

        let mut dst = vec![MapEntry::INVALID; raw.len()];
        assert!(process_for_mip_redirection(&raw, &mut dst, size, 3));

        assert!(dst.iter().all(MapEntry::is_valid));
        assert_eq!(dst[15], MapEntry::new(1, 2, 0));
        // Mip-0 texel (2, 0) sits under mip-1 texel (1, 0).
        assert_eq!(dst[2], MapEntry::new(5, 5, 1));
        // Mip-0 texel (0, 3) falls back to the coarsest mip.
        assert_eq!(dst[12], MapEntry::new(9, 9, 2));
    }

    #[test]
    fn test_redirection_closure_property() {
        // Every pattern with a valid coarsest texel resolves completely.
        let size = 8;
        let len = pyramid_len(size, 4);
        for seed in 0u32..32 {
            let mut raw = vec![MapEntry::INVALID; len];
            raw[len - 1] = MapEntry::new(0, 0, 3);
            for (i, e) in raw.iter_mut().enumerate().take(len - 1) {
                if (i as u32).wrapping_mul(2_654_435_761).wrapping_add(seed * 97) % 7 == 0 {
                    *e = MapEntry::new(i as u8, seed as u8, 0);
                }
            }
            let mut dst = vec![MapEntry::INVALID; len];
            assert!(process_for_mip_redirection(&raw, &mut dst, size, 4));
            assert!(dst.iter().all(MapEntry::is_valid));
            for (r, d) in raw.iter().zip(&dst) {
                if r.is_valid() {
                    assert_eq!(r, d);
                }
            }
        }
    }

    #[test]
    fn test_unfilled_coarsest_leaves_holes() {
        let mut raw = vec![MapEntry::INVALID; pyramid_len(2, 2)];
        raw[0] = entry(1);
        let mut dst = vec![MapEntry::INVALID; raw.len()];
        assert!(process_for_mip_redirection(&raw, &mut dst, 2, 2));
        assert!(dst[0].is_valid());
        assert!(!dst[1].is_valid());
        assert!(!dst[4].is_valid());
    }

    #[test]
    fn test_mismatched_buffers_are_rejected() {
        let raw = vec![MapEntry::INVALID; 3];
        let mut dst = vec![MapEntry::INVALID; 3];
        assert!(!process_for_mip_redirection(&raw, &mut dst, 2, 2));
    }

    #[test]
    fn test_double_buffered_update_cycle() {
        let pool = JobPool::inline();
        let key = IndirectionTileKey { x: 0, y: 0 };
        let mut map = IndirectionMap::new(2, 2).unwrap();
        map.set_pixel(0, 0, 1, MapEntry::new(4, 4, 1));

        let mut uploads = Vec::new();
        let mut sink = |k: IndirectionTileKey, mip: u32, side: u32, entries: &[MapEntry]| {
            uploads.push((k, mip, side, entries.to_vec()));
        };

        // Nothing to collect on the first frame.
        assert!(!map.begin_mip_redirection_update(key, &mut sink));
        assert!(map.end_mip_redirection_update(&pool));
        assert!(!map.is_dirty());
        // The resolved pyramid only changes once collected.
        assert_eq!(map.resolved(1, 1, 0), Some(MapEntry::INVALID));

        assert!(map.begin_mip_redirection_update(key, &mut sink));
        assert_eq!(map.resolved(1, 1, 0), Some(MapEntry::new(4, 4, 1)));
        // Clean map: no new job.
        assert!(!map.end_mip_redirection_update(&pool));
        assert_eq!(map.upload_count(), 1);

        drop(sink);
        assert_eq!(uploads.len(), 2);
        assert_eq!(uploads[0].1, 0);
        assert_eq!(uploads[0].2, 2);
        assert_eq!(uploads[0].3, vec![MapEntry::new(4, 4, 1); 4]);
        assert_eq!(uploads[1].3, vec![MapEntry::new(4, 4, 1)]);
    }

    #[test]
    fn test_background_job_is_collected_once() {
        let pool = JobPool::new(1, 4).unwrap();
        let key = IndirectionTileKey { x: 1, y: 2 };
        let mut map = IndirectionMap::new(4, 3).unwrap();
        map.set_pixel(0, 0, 2, MapEntry::new(1, 1, 2));
        assert!(map.end_mip_redirection_update(&pool));
        // A second end before begin never stacks a second job.
        map.set_pixel(3, 3, 0, MapEntry::new(2, 2, 0));
        assert!(!map.end_mip_redirection_update(&pool));
        assert!(map.is_dirty());

        let mut count = 0;
        let mut sink = |_: IndirectionTileKey, _: u32, _: u32, _: &[MapEntry]| count += 1;
        assert!(map.begin_mip_redirection_update(key, &mut sink));
        assert!(!map.begin_mip_redirection_update(key, &mut sink));
        drop(sink);
        assert_eq!(count, 3);
        assert_eq!(map.resolved(3, 3, 0), Some(MapEntry::new(1, 1, 2)));
    }

    #[test]
    fn test_reset_invalidates_everything() {
        let pool = JobPool::inline();
        let mut map = IndirectionMap::new(2, 2).unwrap();
        map.set_pixel(0, 0, 1, MapEntry::new(4, 4, 1));
        map.end_mip_redirection_update(&pool);
        map.wait();
        assert!(map.resolved(0, 0, 0).unwrap().is_valid());
        map.reset();
        assert_eq!(map.valid_count(), 0);
        assert_eq!(map.resolved(0, 0, 0), Some(MapEntry::INVALID));
        assert!(map.is_dirty());
    }
}
