//! Virtual texture paging: a bounded physical tile cache addressed through a
//! page table, with LRU eviction and mip redirection so every sampled texel
//! resolves to some resident tile.

mod error;
mod indirection;
mod indirection_cache;
mod lru;
mod page_entry;
mod tile;
mod wrapper;

/// Highest supported number of virtual mip levels.
pub const MAX_MIP_LEVELS: u32 = 12;

/// Page-table records store physical tile coordinates as `u8`.
pub const MAX_PHYSICAL_TILES_PER_AXIS: u32 = strata_config::MAX_PHYSICAL_TILES_PER_AXIS;

pub use error::VirtualTextureError;
pub use indirection::{IndirectionMap, IndirectionSink, process_for_mip_redirection, pyramid_len};
pub use indirection_cache::IndirectionMapCache;
pub use lru::{LruHandle, LruQueue};
pub use page_entry::{MapEntry, entries_as_bytes};
pub use tile::{
    IndirectionTileKey, PhysicalTile, SlotTicket, TileViewport, VirtualTile, WorldRect,
};
pub use wrapper::{
    ChunkConstants, TextureBinder, TileFillRequest, TileFiller, UpdateStats, VirtualTextureDesc,
    VirtualTileWrapper, WrapperStats,
};
