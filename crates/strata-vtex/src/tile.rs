//! Virtual and physical tile addresses.

use std::cmp::Ordering;

use glam::Vec2;

/// Address of a tile in the logical texture.
///
/// Ordering puts more detailed mips first, then rows, then columns, which is
/// the order pending requests are served in.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct VirtualTile {
    /// Column at `mip`.
    pub x: u32,
    /// Row at `mip`.
    pub y: u32,
    /// Mip level (0 = most detailed).
    pub mip: u32,
}

impl VirtualTile {
    /// Create a tile address.
    pub const fn new(x: u32, y: u32, mip: u32) -> Self {
        Self { x, y, mip }
    }

    /// The tile one mip up that contains this one.
    pub fn parent(&self) -> VirtualTile {
        VirtualTile::new(self.x / 2, self.y / 2, self.mip + 1)
    }

    /// Top-left corner in mip-0 tile units, saturating at `u32::MAX`.
    pub fn to_mip0_origin(&self) -> (u32, u32) {
        (saturating_shl(self.x, self.mip), saturating_shl(self.y, self.mip))
    }
}

fn saturating_shl(value: u32, shift: u32) -> u32 {
    match u32::MAX.checked_shr(shift) {
        Some(limit) if value <= limit => value << shift,
        _ if value == 0 => 0,
        _ => u32::MAX,
    }
}

impl Ord for VirtualTile {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.mip, self.y, self.x).cmp(&(other.mip, other.y, other.x))
    }
}

impl PartialOrd for VirtualTile {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// One slot of the physical tile cache.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PhysicalTile {
    /// Column in the cache grid.
    pub x: u8,
    /// Row in the cache grid.
    pub y: u8,
    /// Virtual tile currently stored here, `None` when unmapped.
    pub resident: Option<VirtualTile>,
    /// Incremented every time a fill successfully remaps the slot.
    pub generation: u32,
}

impl PhysicalTile {
    /// An unmapped slot at `(x, y)`.
    pub fn empty(x: u8, y: u8) -> Self {
        Self {
            x,
            y,
            resident: None,
            generation: 0,
        }
    }
}

/// Pixel rectangle inside the physical cache texture, padding included.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TileViewport {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

/// Address of one indirection tile.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct IndirectionTileKey {
    pub x: u32,
    pub y: u32,
}

/// Identifies one hand-out of a physical slot to a fill.
///
/// A ticket stays current until another tile is filled into the slot, so a
/// fill that completes late can check whether its destination still belongs
/// to it. Failed fills do not retire the resident tile's ticket.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SlotTicket {
    /// Physical slot handle.
    pub slot: usize,
    /// Slot generation at hand-out.
    pub generation: u32,
    /// Tile the slot was handed out for.
    pub tile: VirtualTile,
}

/// Axis-aligned world-space rectangle on the XY plane.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct WorldRect {
    pub min: Vec2,
    pub max: Vec2,
}

impl WorldRect {
    /// Rectangle from its corners.
    pub fn new(min: Vec2, max: Vec2) -> Self {
        Self { min, max }
    }

    /// Rectangle from origin and size.
    pub fn from_origin_size(origin: Vec2, size: Vec2) -> Self {
        Self {
            min: origin,
            max: origin + size,
        }
    }

    /// Grow (or shrink, when negative) every side by `amount`.
    pub fn expand(&self, amount: f32) -> Self {
        let min = self.min - Vec2::splat(amount);
        let max = self.max + Vec2::splat(amount);
        Self {
            min: min.min((min + max) * 0.5),
            max: max.max((min + max) * 0.5),
        }
    }

    pub fn center(&self) -> Vec2 {
        (self.min + self.max) * 0.5
    }

    pub fn size(&self) -> Vec2 {
        self.max - self.min
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;

    #[test]
    fn test_pending_order_prefers_detailed_mips() {
        let set: BTreeSet<_> = [
            VirtualTile::new(0, 0, 2),
            VirtualTile::new(5, 1, 0),
            VirtualTile::new(1, 3, 0),
            VirtualTile::new(0, 3, 0),
            VirtualTile::new(9, 0, 1),
        ]
        .into_iter()
        .collect();
        let order: Vec<_> = set.into_iter().collect();
        assert_eq!(
            order,
            vec![
                VirtualTile::new(5, 1, 0),
                VirtualTile::new(0, 3, 0),
                VirtualTile::new(1, 3, 0),
                VirtualTile::new(9, 0, 1),
                VirtualTile::new(0, 0, 2),
            ]
        );
    }

    #[test]
    fn test_parent_and_origin() {
        let tile = VirtualTile::new(5, 6, 1);
        assert_eq!(tile.parent(), VirtualTile::new(2, 3, 2));
        assert_eq!(tile.to_mip0_origin(), (10, 12));
    }

    /// Coordinates too large for mip 0 clamp instead of wrapping.
    #[test]
    fn test_mip0_origin_saturates() {
        assert_eq!(VirtualTile::new(3, 1, 31).to_mip0_origin(), (u32::MAX, 1 << 31));
        assert_eq!(VirtualTile::new(1, 0, 32).to_mip0_origin(), (u32::MAX, 0));
        assert_eq!(VirtualTile::new(u32::MAX, 7, 0).to_mip0_origin(), (u32::MAX, 7));
        assert_eq!(VirtualTile::new(0x8000, 2, 16).to_mip0_origin(), (1 << 31, 1 << 17));
    }

    #[test]
    fn test_rect_shrink_never_inverts() {
        let rect = WorldRect::new(Vec2::ZERO, Vec2::splat(1.0));
        let shrunk = rect.expand(-0.25);
        assert_eq!(shrunk, WorldRect::new(Vec2::splat(0.25), Vec2::splat(0.75)));
        let collapsed = rect.expand(-5.0);
        assert!(collapsed.min.x <= collapsed.max.x);
        assert_eq!(rect.expand(1.0).size(), Vec2::splat(3.0));
    }
}
