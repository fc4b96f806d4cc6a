//! CDLOD terrain quadtree: frustum culling, min/max height bounds and
//! per-frame LOD selection, including the texture-streaming variant.

mod frustum;
mod height_range;
mod quadtree;
mod selection;
mod streaming;

pub use frustum::{Aabb, Frustum, Intersection};
pub use height_range::{ConstantHeightRange, HeightRangeProvider, MinMaxHeightCache, MinMaxPyramid};
pub use quadtree::{CdlodQuadtree, QuadtreeError};
pub use selection::{
    LodSelection, MAX_LOD_LEVELS, MipInterval, SelectedNode, SelectionDesc, SelectionFlags,
    TextureStreamingParams, compute_visibility_ranges,
};
