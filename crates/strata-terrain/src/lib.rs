//! Terrain streaming on top of the CDLOD quadtree and virtual textures:
//! procedural heights, tile fillers, and the texture cache that turns
//! selections into tile requests.

mod filler;
mod heightmap;
mod texture_cache;

pub use filler::{
    HeightTileFiller, MaterialLayer, MaterialTileFiller, PhysicalCache, default_layers,
};
pub use heightmap::{HeightmapParams, HeightmapSampler, TerrainHeightRange};
pub use texture_cache::{CacheStats, CacheUpdateStats, TerrainTextureCache};
