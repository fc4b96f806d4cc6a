//! Implicit CDLOD quadtree and its per-frame LOD selection.
//!
//! Nodes are never stored. A node is `(x, y, lod_level)` in leaf units, with
//! LOD 0 the finest level and `lod_level_count - 1` the top level. Selection
//! walks each top-level node with an explicit worklist kept inside the
//! caller's [`LodSelection`], visiting children in TL, TR, BL, BR order and
//! combining their results post-order.

use std::sync::Arc;

use glam::{Vec2, Vec3};
use strata_config::Config;
use strata_jobs::JobPool;
use tracing::{debug, warn};

use crate::frustum::{Aabb, Intersection};
use crate::height_range::{HeightRangeProvider, MinMaxHeightCache, MinMaxPyramid};
use crate::selection::{
    LodSelection, MAX_LOD_LEVELS, MipInterval, SelectedNode, SelectionDesc, SelectionFlags,
};
use crate::streaming::StreamingEvaluator;

/// Errors raised by [`CdlodQuadtree::try_new`].
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum QuadtreeError {
    /// LOD level count outside `1..=MAX_LOD_LEVELS`.
    #[error("lod level count {0} must be within 1..={max}", max = MAX_LOD_LEVELS)]
    LodLevelCount(u32),
    /// Leaf node size is zero, negative or not finite.
    #[error("leaf node size {0} must be positive")]
    LeafNodeSize(f32),
    /// World extent is zero, negative or not finite.
    #[error("world size {0:?} must be positive")]
    WorldSize(Vec2),
    /// The height cache was built for a different level count.
    #[error("height cache covers {cache} lod levels, quadtree has {tree}")]
    HeightCacheMismatch {
        /// Levels of the height cache.
        cache: u32,
        /// Levels of the quadtree.
        tree: u32,
    },
}

/// How a subtree contributed to the selection.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Outcome {
    /// Culled by the frustum (or outside the world).
    OutOfFrustum,
    /// Beyond its level's visibility range.
    OutOfRange,
    /// The node or one of its descendants was selected.
    Selected,
}

/// Report from a finished child to its parent.
#[derive(Clone, Copy, Debug)]
pub(crate) struct ChildReport {
    pub outcome: Outcome,
    pub mips: Option<MipInterval>,
}

impl ChildReport {
    pub(crate) fn of(outcome: Outcome) -> Self {
        Self {
            outcome,
            mips: None,
        }
    }
}

/// Decision taken when a node is first visited.
pub(crate) enum Visit {
    /// Skip the subtree.
    Prune(ChildReport),
    /// Finish the node without visiting children.
    Leaf,
    /// Visit the four children before finishing.
    Descend,
}

/// One pending node of the traversal worklist.
#[derive(Clone, Copy, Debug)]
pub(crate) struct TraversalFrame {
    pub x: u32,
    pub y: u32,
    pub lod: u32,
    pub aabb: Aabb,
    pub parent_inside: bool,
    pub inside: bool,
    pub entered: bool,
    pub descend: bool,
    next_child: u8,
    pub removed: [bool; 4],
    pub any_child_selected: bool,
    pub own_mips: Option<MipInterval>,
    pub children_mips: Option<MipInterval>,
}

impl TraversalFrame {
    fn new(x: u32, y: u32, lod: u32, parent_inside: bool) -> Self {
        Self {
            x,
            y,
            lod,
            aabb: Aabb::new(Vec3::ZERO, Vec3::ZERO),
            parent_inside,
            inside: false,
            entered: false,
            descend: false,
            next_child: 0,
            removed: [false; 4],
            any_child_selected: false,
            own_mips: None,
            children_mips: None,
        }
    }

    fn record(&mut self, report: ChildReport) {
        let index = (self.next_child as usize).saturating_sub(1);
        self.removed[index] = matches!(report.outcome, Outcome::OutOfFrustum | Outcome::Selected);
        if report.outcome == Outcome::Selected {
            self.any_child_selected = true;
        }
        if let Some(mips) = report.mips {
            self.children_mips = Some(match self.children_mips {
                Some(existing) => existing.union(mips),
                None => mips,
            });
        }
    }

    /// Squared camera distance to the closest point of the node.
    pub fn distance_sq(&self, camera: Vec3) -> f32 {
        self.aabb.min_distance_sq(camera)
    }

    /// Build the output record for this node.
    pub fn to_selected(&self, camera: Vec3, flags: [bool; 4]) -> SelectedNode {
        SelectedNode {
            x: self.x,
            y: self.y,
            lod_level: self.lod,
            aabb: self.aabb,
            tl: flags[0],
            tr: flags[1],
            bl: flags[2],
            br: flags[3],
            distance_sq: self.distance_sq(camera),
            mip_interval: None,
        }
    }
}

/// Per-query node evaluation plugged into the shared traversal.
pub(crate) trait NodeEvaluator {
    fn enter(&mut self, frame: &mut TraversalFrame, selection: &mut LodSelection) -> Visit;
    fn finish(&mut self, frame: &TraversalFrame, selection: &mut LodSelection) -> ChildReport;
}

/// Frustum classification honouring a fully-inside parent.
pub(crate) fn classify(
    desc: &SelectionDesc,
    frame: &mut TraversalFrame,
) -> Option<ChildReport> {
    if frame.parent_inside {
        frame.inside = true;
        return None;
    }
    match desc.frustum.test_aabb(&frame.aabb) {
        Intersection::Outside => Some(ChildReport::of(Outcome::OutOfFrustum)),
        Intersection::Inside => {
            frame.inside = true;
            None
        }
        Intersection::Intersecting => None,
    }
}

/// Record an overflow, warning on the first one of the query.
pub(crate) fn push_or_overflow(selection: &mut LodSelection, node: SelectedNode) -> bool {
    let first = !selection.overflowed();
    let pushed = selection.push(node);
    if !pushed && first {
        warn!(
            capacity = selection.capacity(),
            "LOD selection buffer full, dropping further nodes"
        );
    }
    pushed
}

/// Distance-based CDLOD selection.
struct RangeEvaluator<'a> {
    desc: &'a SelectionDesc,
    include_all: bool,
}

impl NodeEvaluator for RangeEvaluator<'_> {
    fn enter(&mut self, frame: &mut TraversalFrame, selection: &mut LodSelection) -> Visit {
        if let Some(culled) = classify(self.desc, frame) {
            return Visit::Prune(culled);
        }

        let camera = self.desc.camera_position;
        let range = selection.visibility_range(frame.lod);
        if !frame.aabb.intersects_sphere_sq(camera, range * range) {
            return Visit::Prune(ChildReport::of(Outcome::OutOfRange));
        }

        if frame.lod > self.desc.stop_at_lod {
            let next = selection.visibility_range(frame.lod - 1);
            if frame.aabb.intersects_sphere_sq(camera, next * next) {
                return Visit::Descend;
            }
        }
        Visit::Leaf
    }

    fn finish(&mut self, frame: &TraversalFrame, selection: &mut LodSelection) -> ChildReport {
        let fallback = if frame.any_child_selected {
            Outcome::Selected
        } else {
            Outcome::OutOfFrustum
        };

        let mut flags = [true; 4];
        if frame.descend && !self.include_all {
            if frame.removed.iter().all(|removed| *removed) {
                return ChildReport::of(fallback);
            }
            flags = frame.removed.map(|removed| !removed);
        }

        let camera = self.desc.camera_position;
        if !push_or_overflow(selection, frame.to_selected(camera, flags)) {
            return ChildReport::of(fallback);
        }

        if frame.lod + 1 < selection.lod_level_count() && !selection.visibility_distance_too_small()
        {
            let (next_morph_start, _) = selection.morph_range(frame.lod + 1);
            let max_distance = frame.aabb.max_distance_sq(camera).sqrt();
            if max_distance > next_morph_start {
                warn!(
                    lod = frame.lod,
                    max_distance,
                    next_morph_start,
                    "visibility distance too small for leaf node size and morph start ratio"
                );
                selection.flag_visibility_distance_too_small();
            }
        }
        ChildReport::of(Outcome::Selected)
    }
}

/// An implicit quadtree over a world-space rectangle.
#[derive(Debug)]
pub struct CdlodQuadtree {
    leaf_node_size: f32,
    lod_level_count: u32,
    world_min: Vec2,
    world_size: Vec2,
    leaves_x: u32,
    leaves_y: u32,
    top_nodes_x: u32,
    top_nodes_y: u32,
    heights: MinMaxHeightCache,
}

impl CdlodQuadtree {
    /// Create a quadtree covering `world_min .. world_min + world_size`.
    ///
    /// Inconsistent inputs produce a degenerate tree with no top-level nodes;
    /// use [`try_new`](Self::try_new) to get the reason instead.
    pub fn new(
        leaf_node_size: f32,
        lod_level_count: u32,
        world_min: Vec2,
        world_size: Vec2,
        heights: MinMaxHeightCache,
    ) -> Self {
        let valid = Self::check(leaf_node_size, lod_level_count, world_size, &heights).is_ok();
        let (leaves_x, leaves_y, top_nodes_x, top_nodes_y) = if valid {
            let leaves_x = (world_size.x / leaf_node_size).ceil() as u32;
            let leaves_y = (world_size.y / leaf_node_size).ceil() as u32;
            let span = 1u32 << (lod_level_count - 1);
            (leaves_x, leaves_y, leaves_x.div_ceil(span), leaves_y.div_ceil(span))
        } else {
            (0, 0, 0, 0)
        };
        let heights = heights.with_world_leaves(leaves_x, leaves_y);
        Self {
            leaf_node_size,
            lod_level_count,
            world_min,
            world_size,
            leaves_x,
            leaves_y,
            top_nodes_x,
            top_nodes_y,
            heights,
        }
    }

    /// Validating constructor.
    pub fn try_new(
        leaf_node_size: f32,
        lod_level_count: u32,
        world_min: Vec2,
        world_size: Vec2,
        heights: MinMaxHeightCache,
    ) -> Result<Self, QuadtreeError> {
        Self::check(leaf_node_size, lod_level_count, world_size, &heights)?;
        Ok(Self::new(
            leaf_node_size,
            lod_level_count,
            world_min,
            world_size,
            heights,
        ))
    }

    /// Build the quadtree described by the world and quadtree config sections.
    pub fn from_config(
        config: &Config,
        provider: Arc<dyn HeightRangeProvider>,
        pool: Option<Arc<JobPool>>,
    ) -> Result<Self, QuadtreeError> {
        let levels = config.quadtree.lod_level_count;
        let mut heights = MinMaxHeightCache::new(
            provider,
            levels,
            (config.world.min_height, config.world.max_height),
        );
        if let Some(pool) = pool {
            heights = heights.with_pool(pool);
        }
        Self::try_new(
            config.quadtree.leaf_node_size,
            levels,
            Vec2::from(config.world.origin),
            Vec2::from(config.world.size),
            heights,
        )
    }

    fn check(
        leaf_node_size: f32,
        lod_level_count: u32,
        world_size: Vec2,
        heights: &MinMaxHeightCache,
    ) -> Result<(), QuadtreeError> {
        if lod_level_count == 0 || lod_level_count as usize > MAX_LOD_LEVELS {
            return Err(QuadtreeError::LodLevelCount(lod_level_count));
        }
        if !(leaf_node_size.is_finite() && leaf_node_size > 0.0) {
            return Err(QuadtreeError::LeafNodeSize(leaf_node_size));
        }
        if !(world_size.is_finite() && world_size.x > 0.0 && world_size.y > 0.0) {
            return Err(QuadtreeError::WorldSize(world_size));
        }
        if heights.lod_level_count() != lod_level_count {
            return Err(QuadtreeError::HeightCacheMismatch {
                cache: heights.lod_level_count(),
                tree: lod_level_count,
            });
        }
        Ok(())
    }

    /// World size of a LOD 0 node.
    pub fn leaf_node_size(&self) -> f32 {
        self.leaf_node_size
    }

    /// Number of LOD levels.
    pub fn lod_level_count(&self) -> u32 {
        self.lod_level_count
    }

    /// World size of a top-level node.
    pub fn top_node_size(&self) -> f32 {
        self.leaf_node_size * self.top_span() as f32
    }

    /// Number of top-level nodes along x and y.
    pub fn top_node_count(&self) -> (u32, u32) {
        (self.top_nodes_x, self.top_nodes_y)
    }

    /// World-space minimum corner.
    pub fn world_min(&self) -> Vec2 {
        self.world_min
    }

    /// World extent.
    pub fn world_size(&self) -> Vec2 {
        self.world_size
    }

    /// The min/max height cache feeding node bounds.
    pub fn heights(&self) -> &MinMaxHeightCache {
        &self.heights
    }

    /// Worst-case selection size for this tree.
    pub fn suggested_selection_capacity(&self) -> usize {
        (4 * self.lod_level_count as usize)
            .saturating_mul(self.top_nodes_x as usize)
            .saturating_mul(self.top_nodes_y as usize)
    }

    fn top_span(&self) -> u32 {
        1u32 << (self.lod_level_count.clamp(1, MAX_LOD_LEVELS as u32) - 1)
    }

    /// World bounds of a node.
    pub fn node_aabb(&self, pyramid: Option<&MinMaxPyramid>, x: u32, y: u32, lod: u32) -> Aabb {
        let size = self.leaf_node_size * (1u32 << lod) as f32;
        let min = self.world_min + Vec2::new(x as f32, y as f32) * self.leaf_node_size;
        let (min_z, max_z) = self.heights.node_range(pyramid, x, y, lod);
        Aabb::new(min.extend(min_z), (min + Vec2::splat(size)).extend(max_z))
    }

    /// Next child of `frame` inside the world; children outside it count as removed.
    fn next_child(&self, frame: &mut TraversalFrame) -> Option<TraversalFrame> {
        let half = 1u32 << (frame.lod - 1);
        while frame.next_child < 4 {
            let index = frame.next_child;
            frame.next_child += 1;
            let x = frame.x + if index & 1 == 1 { half } else { 0 };
            let y = frame.y + if index & 2 == 2 { half } else { 0 };
            if x >= self.leaves_x || y >= self.leaves_y {
                frame.removed[index as usize] = true;
                continue;
            }
            return Some(TraversalFrame::new(x, y, frame.lod - 1, frame.inside));
        }
        None
    }

    pub(crate) fn traverse(&self, evaluator: &mut impl NodeEvaluator, selection: &mut LodSelection) {
        let span = self.top_span();
        let top_lod = self.lod_level_count.saturating_sub(1);
        for top_y in 0..self.top_nodes_y {
            for top_x in 0..self.top_nodes_x {
                let pyramid = self.heights.pyramid(top_x, top_y);
                selection.stack.clear();
                selection
                    .stack
                    .push(TraversalFrame::new(top_x * span, top_y * span, top_lod, false));

                let mut report: Option<ChildReport> = None;
                while let Some(mut frame) = selection.stack.pop() {
                    if !frame.entered {
                        frame.entered = true;
                        frame.aabb = self.node_aabb(pyramid.as_deref(), frame.x, frame.y, frame.lod);
                        match evaluator.enter(&mut frame, selection) {
                            Visit::Prune(pruned) => {
                                report = Some(pruned);
                                continue;
                            }
                            Visit::Leaf => frame.descend = false,
                            Visit::Descend => frame.descend = true,
                        }
                    } else if let Some(child) = report.take() {
                        frame.record(child);
                    }

                    if frame.descend
                        && let Some(child) = self.next_child(&mut frame)
                    {
                        selection.stack.push(frame);
                        selection.stack.push(child);
                        continue;
                    }
                    report = Some(evaluator.finish(&frame, selection));
                }
            }
        }
    }

    /// Select the nodes to render for `desc` into `selection`.
    ///
    /// Dispatches to [`lod_select_texture_streaming`](Self::lod_select_texture_streaming)
    /// when [`SelectionFlags::TEXTURE_STREAMING`] is set. A frozen selection is
    /// left untouched.
    pub fn lod_select(&self, desc: &SelectionDesc, selection: &mut LodSelection) {
        if desc.flags.contains(SelectionFlags::TEXTURE_STREAMING) {
            self.lod_select_texture_streaming(desc, selection);
            return;
        }
        if selection.is_frozen() {
            return;
        }

        selection.begin(desc, self.lod_level_count);
        let mut evaluator = RangeEvaluator {
            desc,
            include_all: desc.flags.contains(SelectionFlags::INCLUDE_ALL_NODES_IN_RANGE),
        };
        self.traverse(&mut evaluator, selection);
        selection.finish();

        debug!(
            nodes = selection.len(),
            min_lod = ?selection.min_selected_lod(),
            max_lod = ?selection.max_selected_lod(),
            overflowed = selection.overflowed(),
            "LOD selection"
        );
    }

    /// Select nodes by texture mip requirement.
    ///
    /// Every node whose own mip lies within the mip interval needed by it or
    /// its children is emitted whole, with its interval attached.
    pub fn lod_select_texture_streaming(&self, desc: &SelectionDesc, selection: &mut LodSelection) {
        if selection.is_frozen() {
            return;
        }

        selection.begin(desc, self.lod_level_count);
        let mut evaluator = StreamingEvaluator::new(desc);
        self.traverse(&mut evaluator, selection);
        selection.finish();

        debug!(
            nodes = selection.len(),
            overflowed = selection.overflowed(),
            "texture streaming selection"
        );
    }
}
