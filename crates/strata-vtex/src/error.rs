use thiserror::Error;

/// Errors raised while validating a virtual texture layout.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum VirtualTextureError {
    /// Tile edge length is zero.
    #[error("tile size must be > 0")]
    ZeroTileSize,
    /// Physical cache grid has no slots.
    #[error("physical cache needs at least one tile per axis")]
    EmptyPhysicalCache,
    /// Physical tile coordinates must fit the 8-bit page-table record.
    #[error("physical cache of {x}x{y} tiles exceeds {max} per axis", max = crate::MAX_PHYSICAL_TILES_PER_AXIS)]
    PhysicalCacheTooLarge { x: u32, y: u32 },
    /// Mip count is zero or above the supported maximum.
    #[error("mip level count {0} must be within 1..={max}", max = crate::MAX_MIP_LEVELS)]
    MipLevels(u32),
    /// The virtual texture covers no tiles.
    #[error("virtual texture must cover at least one tile")]
    EmptyVirtualTexture,
    /// World size of a tile is not a positive finite number.
    #[error("tile world size {0} must be positive")]
    TileWorldSize(f32),
    /// Indirection size is not a power of two that fits its mips.
    #[error("indirection size {size} cannot hold {mip_count} mips")]
    IndirectionLayout { size: u32, mip_count: u32 },
}
