//! The 4-byte page-table record uploaded to the indirection texture.

use bytemuck::{Pod, Zeroable};

/// One indirection texel.
///
/// Layout (4 bytes):
///   - `[0]` physical tile column
///   - `[1]` physical tile row
///   - `[2]` virtual mip stored in that physical tile
///   - `[3]` `0xFF` valid, `0x00` invalid
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Pod, Zeroable)]
pub struct MapEntry {
    pub tile_x: u8,
    pub tile_y: u8,
    pub tile_mip: u8,
    pub flags: u8,
}

static_assertions::assert_eq_size!(MapEntry, [u8; 4]);

impl MapEntry {
    /// Flag byte of a valid entry.
    pub const VALID: u8 = 0xFF;
    /// Flag byte of an invalid entry.
    pub const INVALID_FLAG: u8 = 0x00;
    /// The all-zero invalid entry.
    pub const INVALID: MapEntry = MapEntry {
        tile_x: 0,
        tile_y: 0,
        tile_mip: 0,
        flags: Self::INVALID_FLAG,
    };

    /// A valid entry pointing at physical tile `(tile_x, tile_y)` holding `tile_mip`.
    pub const fn new(tile_x: u8, tile_y: u8, tile_mip: u8) -> Self {
        Self {
            tile_x,
            tile_y,
            tile_mip,
            flags: Self::VALID,
        }
    }

    pub const fn is_valid(&self) -> bool {
        self.flags == Self::VALID
    }
}

/// Raw bytes of a run of entries, ready for a texture upload.
pub fn entries_as_bytes(entries: &[MapEntry]) -> &[u8] {
    bytemuck::cast_slice(entries)
}
