//! Selection query parameters and the reusable per-frame result buffer.

use bitflags::bitflags;
use glam::{Vec2, Vec3};
use strata_config::{Config, VirtualTextureConfig};

use crate::frustum::{Aabb, Frustum};
use crate::quadtree::TraversalFrame;

/// Upper bound on quadtree LOD levels.
pub const MAX_LOD_LEVELS: usize = strata_config::MAX_LOD_LEVELS as usize;

bitflags! {
    /// Options for a selection query.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
    pub struct SelectionFlags: u32 {
        /// Sort the result front to back by squared camera distance.
        const SORT_BY_DISTANCE = 1 << 0;
        /// Emit every in-range node as a whole node, ignoring morph layout.
        const INCLUDE_ALL_NODES_IN_RANGE = 1 << 1;
        /// Select by mip requirement instead of visibility ranges.
        const TEXTURE_STREAMING = 1 << 2;
    }
}

/// Screen-space texel density inputs for texture-streaming selection.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct TextureStreamingParams {
    /// Vertical field of view in radians.
    pub fov_y: f32,
    /// Render target height in pixels.
    pub screen_height: u32,
    /// Virtual texture density at mip 0.
    pub texels_per_meter: f32,
    /// Number of virtual mip levels.
    pub mip_levels: u32,
    /// Offset between node LOD and virtual mip.
    pub mip_bias: i32,
}

impl Default for TextureStreamingParams {
    fn default() -> Self {
        Self {
            fov_y: 60f32.to_radians(),
            screen_height: 1080,
            texels_per_meter: 1.0,
            mip_levels: 1,
            mip_bias: 0,
        }
    }
}

impl TextureStreamingParams {
    /// Fractional mip whose texels match one screen pixel at `distance`.
    pub fn mip_at_distance(&self, distance: f32) -> f32 {
        let pixel_world_size =
            2.0 * distance * (self.fov_y * 0.5).tan() / self.screen_height.max(1) as f32;
        let texels_per_pixel = pixel_world_size * self.texels_per_meter;
        let max_mip = self.mip_levels.saturating_sub(1) as f32;
        if texels_per_pixel <= 1.0 {
            return 0.0;
        }
        texels_per_pixel.log2().clamp(0.0, max_mip)
    }
}

/// Inputs of one selection query.
#[derive(Clone, Debug)]
pub struct SelectionDesc {
    /// Observer position in world space.
    pub camera_position: Vec3,
    /// Culling frustum.
    pub frustum: Frustum,
    /// Ratio between consecutive visibility ranges.
    pub lod_ratio: f32,
    /// Visibility range of LOD 0.
    pub initial_lod_distance: f32,
    /// Visibility range of the coarsest LOD.
    pub max_visibility_distance: f32,
    /// Finest LOD the traversal may descend to.
    pub stop_at_lod: u32,
    /// Fraction of each LOD band where morphing starts.
    pub morph_start_ratio: f32,
    /// Query options.
    pub flags: SelectionFlags,
    /// Texture-streaming inputs, used with [`SelectionFlags::TEXTURE_STREAMING`].
    pub streaming: TextureStreamingParams,
}

impl SelectionDesc {
    /// Build a rendering query from configuration.
    pub fn from_config(config: &Config, camera_position: Vec3, frustum: Frustum) -> Self {
        let mut flags = SelectionFlags::empty();
        if config.lod.sort_by_distance {
            flags |= SelectionFlags::SORT_BY_DISTANCE;
        }
        Self {
            camera_position,
            frustum,
            lod_ratio: config.lod.lod_ratio,
            initial_lod_distance: config.lod.initial_lod_distance,
            max_visibility_distance: config.lod.max_visibility_distance,
            stop_at_lod: 0,
            morph_start_ratio: config.lod.morph_start_ratio,
            flags,
            streaming: TextureStreamingParams {
                fov_y: config.camera.fov_y_degrees.to_radians(),
                screen_height: config.camera.screen_height,
                ..TextureStreamingParams::default()
            },
        }
    }

    /// Build a texture-streaming query for one virtual texture.
    pub fn texture_streaming(
        config: &Config,
        texture: &VirtualTextureConfig,
        camera_position: Vec3,
        frustum: Frustum,
    ) -> Self {
        let mut desc = Self::from_config(config, camera_position, frustum);
        desc.flags = SelectionFlags::TEXTURE_STREAMING | SelectionFlags::SORT_BY_DISTANCE;
        desc.streaming.texels_per_meter = texture.texels_per_meter;
        desc.streaming.mip_levels = texture.mip_levels;
        desc.streaming.mip_bias = config.streaming.lod_mip_bias;
        desc
    }
}

/// Continuous range of virtual mips a node needs.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct MipInterval {
    /// Most detailed mip (at the node's closest point).
    pub min: f32,
    /// Least detailed mip (at the node's farthest point).
    pub max: f32,
}

impl MipInterval {
    /// Smallest interval covering both.
    pub fn union(self, other: MipInterval) -> MipInterval {
        MipInterval {
            min: self.min.min(other.min),
            max: self.max.max(other.max),
        }
    }

    /// Whether the integer mip `level` falls inside the interval.
    pub fn contains_level(&self, level: u32) -> bool {
        let level = level as f32;
        self.min.floor() <= level && level <= self.max.ceil()
    }
}

/// One node chosen by the selector.
///
/// Quadrant flags follow raster order: TL is `(x, y)`, TR `(x + h, y)`,
/// BL `(x, y + h)`, BR `(x + h, y + h)` where `h` is half the node size.
/// A set flag means that quadrant is rendered at this node's LOD.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SelectedNode {
    /// Node origin in leaf units.
    pub x: u32,
    /// Node origin in leaf units.
    pub y: u32,
    /// LOD level (0 = finest).
    pub lod_level: u32,
    /// World-space bounds.
    pub aabb: Aabb,
    /// Top-left quadrant is rendered here.
    pub tl: bool,
    /// Top-right quadrant is rendered here.
    pub tr: bool,
    /// Bottom-left quadrant is rendered here.
    pub bl: bool,
    /// Bottom-right quadrant is rendered here.
    pub br: bool,
    /// Squared distance from the camera to the closest point of the bounds.
    pub distance_sq: f32,
    /// Mip requirement, set by texture-streaming queries.
    pub mip_interval: Option<MipInterval>,
}

impl SelectedNode {
    /// Node edge length in leaf units.
    pub fn size_in_leaves(&self) -> u32 {
        1 << self.lod_level
    }

    /// Quadrant flags as `[tl, tr, bl, br]`.
    pub fn quadrant_flags(&self) -> [bool; 4] {
        [self.tl, self.tr, self.bl, self.br]
    }

    /// Whether every quadrant is rendered at this node's LOD.
    pub fn is_full(&self) -> bool {
        self.tl && self.tr && self.bl && self.br
    }

    /// World-space XY footprint `(min, max)`.
    pub fn footprint(&self) -> (Vec2, Vec2) {
        (self.aabb.min.truncate(), self.aabb.max.truncate())
    }

    /// XY rectangles of the quadrants rendered at this LOD.
    pub fn rendered_quadrants(&self) -> impl Iterator<Item = (Vec2, Vec2)> + '_ {
        let (min, max) = self.footprint();
        let mid = (min + max) * 0.5;
        let rects = [
            (min, mid),
            (Vec2::new(mid.x, min.y), Vec2::new(max.x, mid.y)),
            (Vec2::new(min.x, mid.y), Vec2::new(mid.x, max.y)),
            (mid, max),
        ];
        self.quadrant_flags()
            .into_iter()
            .zip(rects)
            .filter_map(|(flag, rect)| flag.then_some(rect))
    }
}

/// Caller-owned, reusable result of a selection query.
///
/// The node buffer has a fixed capacity; a query that finds more nodes drops
/// the excess and reports [`overflowed`](Self::overflowed).
#[derive(Debug)]
pub struct LodSelection {
    nodes: Vec<SelectedNode>,
    capacity: usize,
    lod_level_count: u32,
    visibility_ranges: [f32; MAX_LOD_LEVELS],
    morph_start: [f32; MAX_LOD_LEVELS],
    morph_end: [f32; MAX_LOD_LEVELS],
    camera_position: Vec3,
    flags: SelectionFlags,
    overflowed: bool,
    visibility_distance_too_small: bool,
    frozen: bool,
    pub(crate) stack: Vec<TraversalFrame>,
}

impl LodSelection {
    /// Create an empty selection holding at most `capacity` nodes.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            nodes: Vec::with_capacity(capacity),
            capacity,
            lod_level_count: 0,
            visibility_ranges: [0.0; MAX_LOD_LEVELS],
            morph_start: [0.0; MAX_LOD_LEVELS],
            morph_end: [0.0; MAX_LOD_LEVELS],
            camera_position: Vec3::ZERO,
            flags: SelectionFlags::empty(),
            overflowed: false,
            visibility_distance_too_small: false,
            frozen: false,
            stack: Vec::with_capacity(MAX_LOD_LEVELS * 4),
        }
    }

    /// Selected nodes in traversal (or distance) order.
    pub fn nodes(&self) -> &[SelectedNode] {
        &self.nodes
    }

    /// Number of selected nodes.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Whether nothing was selected.
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Maximum number of nodes one query can return.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// The last query found more nodes than fit.
    pub fn overflowed(&self) -> bool {
        self.overflowed
    }

    /// A selected node reached past the morph start of the next LOD, meaning
    /// the leaf size and morph start ratio do not fit together.
    pub fn visibility_distance_too_small(&self) -> bool {
        self.visibility_distance_too_small
    }

    /// Camera position of the last query.
    pub fn camera_position(&self) -> Vec3 {
        self.camera_position
    }

    /// Flags of the last query.
    pub fn flags(&self) -> SelectionFlags {
        self.flags
    }

    /// Number of LOD levels of the tree that produced this selection.
    pub fn lod_level_count(&self) -> u32 {
        self.lod_level_count
    }

    /// Visibility range per LOD level.
    pub fn visibility_ranges(&self) -> &[f32] {
        &self.visibility_ranges[..self.lod_level_count as usize]
    }

    /// Visibility range of one LOD level.
    pub fn visibility_range(&self, level: u32) -> f32 {
        self.visibility_ranges
            .get(level as usize)
            .copied()
            .unwrap_or(0.0)
    }

    /// `(morph_start, morph_end)` distances of one LOD level.
    pub fn morph_range(&self, level: u32) -> (f32, f32) {
        let index = (level as usize).min(MAX_LOD_LEVELS - 1);
        (self.morph_start[index], self.morph_end[index])
    }

    /// Vertex-morph shader constants of one LOD level:
    /// `[start, 1 / range, end / range, 1 / range]`.
    pub fn morph_constants(&self, level: u32) -> [f32; 4] {
        let (start, end) = self.morph_range(level);
        let range = (end - start).max(1e-4);
        [start, 1.0 / range, end / range, 1.0 / range]
    }

    /// Finest LOD among the selected nodes.
    pub fn min_selected_lod(&self) -> Option<u32> {
        self.nodes.iter().map(|n| n.lod_level).min()
    }

    /// Coarsest LOD among the selected nodes.
    pub fn max_selected_lod(&self) -> Option<u32> {
        self.nodes.iter().map(|n| n.lod_level).max()
    }

    /// Drop the selected nodes and diagnostics, keeping the buffers.
    pub fn reset(&mut self) {
        self.nodes.clear();
        self.stack.clear();
        self.overflowed = false;
        self.visibility_distance_too_small = false;
    }

    /// Freeze the selection: queries leave the previous result untouched.
    pub fn set_frozen(&mut self, frozen: bool) {
        self.frozen = frozen;
    }

    /// Whether queries are currently ignored.
    pub fn is_frozen(&self) -> bool {
        self.frozen
    }

    /// Reset for a new query and derive the per-level ranges.
    pub(crate) fn begin(&mut self, desc: &SelectionDesc, lod_level_count: u32) {
        self.reset();
        self.camera_position = desc.camera_position;
        self.flags = desc.flags;
        self.lod_level_count = lod_level_count.min(MAX_LOD_LEVELS as u32);

        let count = self.lod_level_count as usize;
        compute_visibility_ranges(desc, &mut self.visibility_ranges[..count]);

        let mut prev_end = 0.0;
        for level in 0..count {
            let end = self.visibility_ranges[level];
            self.morph_end[level] = end;
            self.morph_start[level] = prev_end + (end - prev_end) * desc.morph_start_ratio;
            prev_end = end;
        }
    }

    /// Append a node; returns `false` and records the overflow when full.
    pub(crate) fn push(&mut self, node: SelectedNode) -> bool {
        if self.nodes.len() >= self.capacity {
            self.overflowed = true;
            return false;
        }
        self.nodes.push(node);
        true
    }

    pub(crate) fn flag_visibility_distance_too_small(&mut self) {
        self.visibility_distance_too_small = true;
    }

    pub(crate) fn finish(&mut self) {
        if self.flags.contains(SelectionFlags::SORT_BY_DISTANCE) {
            self.nodes
                .sort_by(|a, b| a.distance_sq.total_cmp(&b.distance_sq));
        }
    }
}

/// Fill `ranges` with the visibility range of each LOD level.
///
/// Level `i` reaches `initial_lod_distance * lod_ratio^i`, capped by
/// `max_visibility_distance`; the coarsest level always reaches
/// `max_visibility_distance`.
pub fn compute_visibility_ranges(desc: &SelectionDesc, ranges: &mut [f32]) {
    let count = ranges.len();
    let mut range = desc.initial_lod_distance;
    for (level, out) in ranges.iter_mut().enumerate() {
        *out = if level + 1 == count {
            desc.max_visibility_distance
        } else {
            range.min(desc.max_visibility_distance)
        };
        range *= desc.lod_ratio;
    }
}
