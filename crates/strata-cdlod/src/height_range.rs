//! Lazily computed min/max height pyramids, one per top-level quadtree node.
//!
//! Node bounding boxes need a vertical extent. The exact extent comes from a
//! [`HeightRangeProvider`]; until a top-level node's pyramid is ready the
//! conservative world-wide range is used, which only makes culling looser.

use std::sync::{Arc, Mutex};

use rustc_hash::FxHashMap;
use strata_jobs::JobPool;
use tracing::trace;

/// Source of terrain height bounds.
///
/// Coordinates are in leaf-node units relative to the quadtree origin; a node
/// at `lod_level` spans `2^lod_level` leaf units per axis. Results may be
/// approximate or stale; they only affect how conservative culling is.
pub trait HeightRangeProvider: Send + Sync {
    /// Minimum and maximum height inside the node `(local_x, local_y, lod_level)`.
    fn min_max_height(&self, local_x: u32, local_y: u32, lod_level: u32) -> (f32, f32);
}

/// A provider with the same height range everywhere.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ConstantHeightRange {
    /// Lowest height.
    pub min: f32,
    /// Highest height.
    pub max: f32,
}

impl HeightRangeProvider for ConstantHeightRange {
    fn min_max_height(&self, _local_x: u32, _local_y: u32, _lod_level: u32) -> (f32, f32) {
        (self.min, self.max)
    }
}

/// One level of a [`MinMaxPyramid`], row-major.
#[derive(Debug, Clone)]
struct PyramidLevel {
    width: u32,
    height: u32,
    ranges: Vec<(f32, f32)>,
}

impl PyramidLevel {
    fn get(&self, x: u32, y: u32) -> Option<(f32, f32)> {
        if x >= self.width || y >= self.height {
            return None;
        }
        self.ranges.get((y * self.width + x) as usize).copied()
    }
}

/// Min/max heights for every node inside one top-level node.
///
/// Level `l` covers at most `side(l)²` nodes, `side(l) = 2^(levels-1-l)`;
/// level `levels - 1` is the top-level node itself. Only nodes that overlap
/// the world's leaf extent are stored, so a top-level node that sticks out of
/// a small world costs no more than the leaves inside it.
#[derive(Debug, Clone)]
pub struct MinMaxPyramid {
    side: u32,
    levels: Vec<PyramidLevel>,
}

impl MinMaxPyramid {
    /// Build the pyramid by querying leaves and folding upwards.
    ///
    /// `world_leaves` is the number of leaf nodes the world spans per axis;
    /// leaves outside it are never queried.
    pub fn build(
        provider: &dyn HeightRangeProvider,
        top_x: u32,
        top_y: u32,
        lod_level_count: u32,
        world_leaves: (u32, u32),
    ) -> Self {
        let levels_count = lod_level_count.clamp(1, 32);
        let span = 1u32 << (levels_count - 1);
        let origin_x = top_x.saturating_mul(span);
        let origin_y = top_y.saturating_mul(span);
        let width = world_leaves.0.saturating_sub(origin_x).min(span);
        let height = world_leaves.1.saturating_sub(origin_y).min(span);

        let mut ranges = Vec::with_capacity(width as usize * height as usize);
        for y in 0..height {
            for x in 0..width {
                ranges.push(provider.min_max_height(origin_x + x, origin_y + y, 0));
            }
        }
        let mut levels = Vec::with_capacity(levels_count as usize);
        levels.push(PyramidLevel {
            width,
            height,
            ranges,
        });

        for _ in 1..levels_count {
            let children = &levels[levels.len() - 1];
            let width = children.width.div_ceil(2);
            let height = children.height.div_ceil(2);
            let mut ranges = Vec::with_capacity(width as usize * height as usize);
            for y in 0..height {
                for x in 0..width {
                    let quad = [
                        children.get(2 * x, 2 * y),
                        children.get(2 * x + 1, 2 * y),
                        children.get(2 * x, 2 * y + 1),
                        children.get(2 * x + 1, 2 * y + 1),
                    ];
                    let min = quad.iter().flatten().map(|r| r.0).fold(f32::INFINITY, f32::min);
                    let max = quad
                        .iter()
                        .flatten()
                        .map(|r| r.1)
                        .fold(f32::NEG_INFINITY, f32::max);
                    ranges.push((min, max));
                }
            }
            levels.push(PyramidLevel {
                width,
                height,
                ranges,
            });
        }

        Self { side: span, levels }
    }

    /// Number of levels in the pyramid.
    pub fn level_count(&self) -> u32 {
        self.levels.len() as u32
    }

    /// Leaf ranges actually stored; at most `side(0)²`.
    pub fn leaf_count(&self) -> usize {
        self.levels.first().map_or(0, |level| level.ranges.len())
    }

    /// Range of the node at `(local_x, local_y)` in level units inside this
    /// top-level node. `None` outside the node or outside the world.
    pub fn get(&self, local_x: u32, local_y: u32, lod_level: u32) -> Option<(f32, f32)> {
        let level = self.levels.get(lod_level as usize)?;
        let side = self.side >> lod_level;
        if local_x >= side || local_y >= side {
            return None;
        }
        level.get(local_x, local_y)
    }
}

#[derive(Debug, Clone)]
enum PyramidSlot {
    Pending,
    Ready(Arc<MinMaxPyramid>),
}

type PyramidMap = FxHashMap<(u32, u32), PyramidSlot>;

/// Per-top-level-node cache of [`MinMaxPyramid`]s.
///
/// The map is guarded by one mutex that is held only for lookup and insert;
/// the pyramid itself is computed outside the lock, on the job pool when one
/// is attached.
pub struct MinMaxHeightCache {
    provider: Arc<dyn HeightRangeProvider>,
    lod_level_count: u32,
    world_leaves: (u32, u32),
    fallback: (f32, f32),
    pyramids: Arc<Mutex<PyramidMap>>,
    pool: Option<Arc<JobPool>>,
}

impl MinMaxHeightCache {
    /// Create a cache that computes pyramids synchronously on first use.
    pub fn new(
        provider: Arc<dyn HeightRangeProvider>,
        lod_level_count: u32,
        fallback: (f32, f32),
    ) -> Self {
        Self {
            provider,
            lod_level_count: lod_level_count.max(1),
            world_leaves: (u32::MAX, u32::MAX),
            fallback,
            pyramids: Arc::new(Mutex::new(FxHashMap::default())),
            pool: None,
        }
    }

    /// Compute pyramids as background jobs. Until a job lands, lookups return
    /// the fallback range.
    pub fn with_pool(mut self, pool: Arc<JobPool>) -> Self {
        self.pool = Some(pool);
        self
    }

    /// Limit pyramids to the leaves a world of `leaves_x * leaves_y` leaf
    /// nodes actually covers. Unlimited by default.
    pub fn with_world_leaves(mut self, leaves_x: u32, leaves_y: u32) -> Self {
        self.world_leaves = (leaves_x, leaves_y);
        self
    }

    /// Leaf extent pyramids are clipped to.
    pub fn world_leaves(&self) -> (u32, u32) {
        self.world_leaves
    }

    /// Number of LOD levels each pyramid covers.
    pub fn lod_level_count(&self) -> u32 {
        self.lod_level_count
    }

    /// Conservative height range used while a pyramid is missing.
    pub fn fallback(&self) -> (f32, f32) {
        self.fallback
    }

    /// Fetch the pyramid of a top-level node, requesting it on a miss.
    pub fn pyramid(&self, top_x: u32, top_y: u32) -> Option<Arc<MinMaxPyramid>> {
        {
            let mut map = self.pyramids.lock().ok()?;
            match map.get(&(top_x, top_y)) {
                Some(PyramidSlot::Ready(pyramid)) => return Some(Arc::clone(pyramid)),
                Some(PyramidSlot::Pending) => return None,
                None => {
                    map.insert((top_x, top_y), PyramidSlot::Pending);
                }
            }
        }

        trace!(top_x, top_y, "requesting min/max height pyramid");
        let provider = Arc::clone(&self.provider);
        let pyramids = Arc::clone(&self.pyramids);
        let levels = self.lod_level_count;
        let world_leaves = self.world_leaves;
        let compute = move || {
            let pyramid = Arc::new(MinMaxPyramid::build(
                provider.as_ref(),
                top_x,
                top_y,
                levels,
                world_leaves,
            ));
            if let Ok(mut map) = pyramids.lock() {
                map.insert((top_x, top_y), PyramidSlot::Ready(Arc::clone(&pyramid)));
            }
            pyramid
        };

        match &self.pool {
            // Fire and forget: the job publishes into the map itself.
            Some(pool) => {
                let _ = pool.spawn(compute);
                None
            }
            None => Some(compute()),
        }
    }

    /// Height range of a node given in global leaf units, falling back to
    /// the conservative range when the pyramid is not ready.
    pub fn node_range(
        &self,
        pyramid: Option<&MinMaxPyramid>,
        x: u32,
        y: u32,
        lod_level: u32,
    ) -> (f32, f32) {
        let span = 1u32
            .checked_shl(self.lod_level_count - 1)
            .unwrap_or(u32::MAX);
        pyramid
            .and_then(|p| p.get((x % span) >> lod_level, (y % span) >> lod_level, lod_level))
            .unwrap_or(self.fallback)
    }

    /// Drop every cached pyramid (e.g. after the height data changed).
    pub fn invalidate(&self) {
        if let Ok(mut map) = self.pyramids.lock() {
            map.clear();
        }
    }

    /// Number of pyramids that finished computing.
    pub fn ready_count(&self) -> usize {
        self.pyramids
            .lock()
            .map(|map| {
                map.values()
                    .filter(|slot| matches!(slot, PyramidSlot::Ready(_)))
                    .count()
            })
            .unwrap_or(0)
    }
}

impl std::fmt::Debug for MinMaxHeightCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MinMaxHeightCache")
            .field("lod_level_count", &self.lod_level_count)
            .field("world_leaves", &self.world_leaves)
            .field("fallback", &self.fallback)
            .field("ready", &self.ready_count())
            .finish()
    }
}
