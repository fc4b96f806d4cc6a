//! Virtual tile wrapper: physical tile cache, LRU eviction, pending requests
//! and the page table behind one virtual texture.
//!
//! A virtual tile is either not requested, pending (in the request set),
//! resident (mapped to a physical slot with a page-table entry) or evicted,
//! which is the same as not requested. Residency only changes inside
//! [`VirtualTileWrapper::update`].

use std::collections::BTreeSet;

use bytemuck::{Pod, Zeroable};
use glam::Vec2;
use rustc_hash::FxHashMap;
use strata_config::{VirtualTextureConfig, WorldConfig};
use strata_jobs::JobPool;
use tracing::{debug, trace};

use crate::error::VirtualTextureError;
use crate::indirection::IndirectionSink;
use crate::indirection_cache::IndirectionMapCache;
use crate::lru::{LruHandle, LruQueue};
use crate::page_entry::MapEntry;
use crate::tile::{
    IndirectionTileKey, PhysicalTile, SlotTicket, TileViewport, VirtualTile, WorldRect,
};
use crate::{MAX_MIP_LEVELS, MAX_PHYSICAL_TILES_PER_AXIS};

/// Layout of one virtual texture.
#[derive(Debug, Clone, PartialEq)]
pub struct VirtualTextureDesc {
    /// Name used in logs and handed to the texture binder.
    pub name: String,
    /// Virtual width in mip-0 tiles.
    pub width_in_tiles: u32,
    /// Virtual height in mip-0 tiles.
    pub height_in_tiles: u32,
    pub mip_levels: u32,
    pub physical_tiles_x: u32,
    pub physical_tiles_y: u32,
    /// Tile edge in texels, excluding padding.
    pub tile_size: u32,
    /// Border texels on each side.
    pub tile_padding: u32,
    /// World position of virtual tile `(0, 0)`.
    pub world_origin: Vec2,
    /// World meters covered by one mip-0 tile.
    pub tile_world_size: f32,
}

impl VirtualTextureDesc {
    /// Layout covering the configured world.
    pub fn from_config(name: &str, texture: &VirtualTextureConfig, world: &WorldConfig) -> Self {
        let tile_world_size = texture.tile_world_size();
        let tiles = |extent: f32| (extent / tile_world_size).ceil().max(0.0) as u32;
        Self {
            name: name.to_string(),
            width_in_tiles: tiles(world.size[0]),
            height_in_tiles: tiles(world.size[1]),
            mip_levels: texture.mip_levels,
            physical_tiles_x: texture.physical_tiles_x,
            physical_tiles_y: texture.physical_tiles_y,
            tile_size: texture.tile_size,
            tile_padding: texture.tile_padding,
            world_origin: Vec2::from(world.origin),
            tile_world_size,
        }
    }

    pub fn validate(&self) -> Result<(), VirtualTextureError> {
        if self.tile_size == 0 {
            return Err(VirtualTextureError::ZeroTileSize);
        }
        if self.physical_tiles_x == 0 || self.physical_tiles_y == 0 {
            return Err(VirtualTextureError::EmptyPhysicalCache);
        }
        if self.physical_tiles_x > MAX_PHYSICAL_TILES_PER_AXIS
            || self.physical_tiles_y > MAX_PHYSICAL_TILES_PER_AXIS
        {
            return Err(VirtualTextureError::PhysicalCacheTooLarge {
                x: self.physical_tiles_x,
                y: self.physical_tiles_y,
            });
        }
        if self.mip_levels == 0 || self.mip_levels > MAX_MIP_LEVELS {
            return Err(VirtualTextureError::MipLevels(self.mip_levels));
        }
        if self.width_in_tiles == 0 || self.height_in_tiles == 0 {
            return Err(VirtualTextureError::EmptyVirtualTexture);
        }
        if !(self.tile_world_size.is_finite() && self.tile_world_size > 0.0) {
            return Err(VirtualTextureError::TileWorldSize(self.tile_world_size));
        }
        Ok(())
    }

    /// Mip-0 tiles per side of one indirection map.
    pub fn indirection_size(&self) -> u32 {
        1 << (self.mip_levels.max(1) - 1)
    }

    /// Tile edge in texels including padding on both sides.
    pub fn padded_tile_size(&self) -> u32 {
        self.tile_size + 2 * self.tile_padding
    }

    /// Physical cache texture size in texels.
    pub fn physical_size(&self) -> (u32, u32) {
        let padded = self.padded_tile_size();
        (self.physical_tiles_x * padded, self.physical_tiles_y * padded)
    }

    /// Virtual size in tiles at `mip`.
    pub fn tiles_at_mip(&self, mip: u32) -> (u32, u32) {
        let scale = 1u32 << mip.min(31);
        (
            self.width_in_tiles.div_ceil(scale).max(1),
            self.height_in_tiles.div_ceil(scale).max(1),
        )
    }

    /// World meters covered by one tile at `mip`.
    pub fn tile_world_size_at(&self, mip: u32) -> f32 {
        self.tile_world_size * (1u32 << mip.min(31)) as f32
    }

    /// World meters covered by one indirection map.
    pub fn chunk_world_size(&self) -> f32 {
        self.tile_world_size * self.indirection_size() as f32
    }

    fn contains(&self, tile: VirtualTile) -> bool {
        if tile.mip >= self.mip_levels {
            return false;
        }
        let (w, h) = self.tiles_at_mip(tile.mip);
        tile.x < w && tile.y < h
    }
}

/// Everything a fill callback needs to produce one tile.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TileFillRequest {
    pub tile: VirtualTile,
    /// Destination in the physical cache texture, padding included.
    pub viewport: TileViewport,
    /// Identifies this hand-out of the destination slot.
    pub ticket: SlotTicket,
    /// World rectangle covered by the unpadded tile.
    pub world: WorldRect,
    /// Unpadded tile edge in texels.
    pub tile_size: u32,
    /// Border texels on each side.
    pub padding: u32,
}

impl TileFillRequest {
    /// World meters per texel.
    pub fn texel_world_size(&self) -> f32 {
        self.world.size().x / self.tile_size.max(1) as f32
    }

    /// World rectangle including the padding border.
    pub fn padded_world(&self) -> WorldRect {
        self.world.expand(self.padding as f32 * self.texel_world_size())
    }
}

/// Produces tile contents into the physical cache.
///
/// Returning `false` means "not ready, retry later"; the tile stays unmapped
/// and is served again once re-requested.
pub trait TileFiller {
    fn fill(&mut self, request: &TileFillRequest) -> bool;
}

impl<F> TileFiller for F
where
    F: FnMut(&TileFillRequest) -> bool,
{
    fn fill(&mut self, request: &TileFillRequest) -> bool {
        self(request)
    }
}

/// Eight shader constants describing the indirection chunk a node samples.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Pod, Zeroable)]
pub struct ChunkConstants {
    /// `1 / chunk world size`.
    pub inv_chunk_size: [f32; 2],
    /// Unpadded tile size in physical texture UV.
    pub tile_uv_size: [f32; 2],
    /// Padded tile size in physical texture UV.
    pub padded_tile_uv_size: [f32; 2],
    /// World position of the chunk origin.
    pub chunk_origin: [f32; 2],
}

static_assertions::assert_eq_size!(ChunkConstants, [f32; 8]);

/// Binds the textures and constants for rendering one node.
///
/// Stage and sampler are opaque handles passed through unchanged.
pub trait TextureBinder {
    type Stage: Copy;
    type Sampler: Copy;

    fn bind_indirection(
        &mut self,
        texture: &str,
        stage: Self::Stage,
        sampler: Self::Sampler,
        key: IndirectionTileKey,
    );
    fn bind_physical(&mut self, texture: &str, stage: Self::Stage, sampler: Self::Sampler);
    fn set_constants(&mut self, texture: &str, stage: Self::Stage, constants: &ChunkConstants);
    fn unbind(&mut self, texture: &str, stage: Self::Stage);
}

/// Result of one [`VirtualTileWrapper::update`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UpdateStats {
    /// Requests handed to the filler.
    pub processed: usize,
    /// Fills that succeeded and were mapped.
    pub filled: usize,
    /// Fills that reported not ready.
    pub failed: usize,
    /// Resident tiles displaced by a successful fill.
    pub evicted: usize,
    /// Pending requests discarded unprocessed.
    pub dropped: usize,
}

/// Counters accumulated over the wrapper's lifetime.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WrapperStats {
    pub requests: u64,
    pub hits: u64,
    pub fills: u64,
    pub fill_failures: u64,
    pub evictions: u64,
    pub dropped: u64,
}

/// Page table plus physical tile cache for one virtual texture.
#[derive(Debug)]
pub struct VirtualTileWrapper {
    desc: VirtualTextureDesc,
    slots: LruQueue<PhysicalTile>,
    resident: FxHashMap<VirtualTile, LruHandle>,
    pending: BTreeSet<VirtualTile>,
    indirection: IndirectionMapCache,
    unsatisfied: usize,
    stats: WrapperStats,
}

impl VirtualTileWrapper {
    pub fn new(desc: VirtualTextureDesc) -> Result<Self, VirtualTextureError> {
        desc.validate()?;
        let indirection = IndirectionMapCache::new(desc.indirection_size(), desc.mip_levels)?;
        let slots = Self::build_slots(&desc);
        debug!(
            texture = %desc.name,
            tiles = slots.len(),
            virtual_tiles = ?(desc.width_in_tiles, desc.height_in_tiles),
            mips = desc.mip_levels,
            "created virtual texture"
        );
        Ok(Self {
            desc,
            slots,
            resident: FxHashMap::default(),
            pending: BTreeSet::new(),
            indirection,
            unsatisfied: 0,
            stats: WrapperStats::default(),
        })
    }

    fn build_slots(desc: &VirtualTextureDesc) -> LruQueue<PhysicalTile> {
        let count = (desc.physical_tiles_x * desc.physical_tiles_y) as usize;
        let mut slots = LruQueue::with_capacity(count);
        for y in 0..desc.physical_tiles_y {
            for x in 0..desc.physical_tiles_x {
                slots.push_back(PhysicalTile::empty(x as u8, y as u8));
            }
        }
        slots
    }

    pub fn desc(&self) -> &VirtualTextureDesc {
        &self.desc
    }

    pub fn stats(&self) -> WrapperStats {
        self.stats
    }

    /// Number of physical slots.
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Number of resident virtual tiles.
    pub fn resident_count(&self) -> usize {
        self.resident.len()
    }

    /// Requests waiting for the next update.
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Requests the last update could not satisfy.
    pub fn outstanding_requests(&self) -> usize {
        self.unsatisfied
    }

    pub fn indirection(&self) -> &IndirectionMapCache {
        &self.indirection
    }

    pub fn is_resident(&self, tile: VirtualTile) -> bool {
        self.resident.contains_key(&tile)
    }

    /// Physical slot currently holding `tile`.
    pub fn physical_tile(&self, tile: VirtualTile) -> Option<PhysicalTile> {
        let &slot = self.resident.get(&tile)?;
        self.slots.get(slot).copied()
    }

    /// Physical slots from least to most recently used.
    pub fn lru_order(&self) -> impl Iterator<Item = &PhysicalTile> {
        self.slots.iter().map(|(_, tile)| tile)
    }

    /// Resolved page-table entry for `tile` as last uploaded.
    pub fn resolve(&self, tile: VirtualTile) -> Option<MapEntry> {
        self.indirection.resolve(tile)
    }

    /// Raw page-table entry for `tile`.
    pub fn page_entry(&self, tile: VirtualTile) -> Option<MapEntry> {
        self.indirection.raw_entry(tile)
    }

    /// Whether the slot named by `ticket` still holds the fill it was issued for.
    pub fn is_ticket_current(&self, ticket: &SlotTicket) -> bool {
        self.slots.get(ticket.slot).is_some_and(|physical| {
            physical.generation == ticket.generation && physical.resident == Some(ticket.tile)
        })
    }

    /// Request one tile. Returns `true` if it is resident (and marks it used),
    /// `false` if it was queued or the address is invalid.
    pub fn request_tile(&mut self, x: u32, y: u32, mip: u32) -> bool {
        let tile = VirtualTile::new(x, y, mip);
        if !self.desc.contains(tile) {
            return false;
        }
        self.stats.requests += 1;
        if let Some(&slot) = self.resident.get(&tile) {
            self.slots.touch(slot);
            self.stats.hits += 1;
            return true;
        }
        self.pending.insert(tile);
        false
    }

    /// Request every tile at `mip` overlapping `rect`. Returns `true` when all
    /// of them are resident; a rectangle outside the texture needs nothing.
    pub fn request_tiles(&mut self, rect: WorldRect, mip: u32) -> bool {
        if mip >= self.desc.mip_levels {
            return false;
        }
        let (tiles_x, tiles_y) = self.desc.tiles_at_mip(mip);
        let tile_world = self.desc.tile_world_size_at(mip);
        let local_min = (rect.min - self.desc.world_origin) / tile_world;
        let local_max = (rect.max - self.desc.world_origin) / tile_world;
        if !(local_max.x > 0.0
            && local_max.y > 0.0
            && local_min.x < tiles_x as f32
            && local_min.y < tiles_y as f32)
        {
            return true;
        }

        let x0 = local_min.x.floor().max(0.0) as u32;
        let y0 = local_min.y.floor().max(0.0) as u32;
        let x1 = (local_max.x.ceil() as u32).clamp(x0 + 1, tiles_x);
        let y1 = (local_max.y.ceil() as u32).clamp(y0 + 1, tiles_y);

        let mut all_resident = true;
        for y in y0..y1 {
            for x in x0..x1 {
                let resident = self.request_tile(x, y, mip);
                all_resident &= resident;
            }
        }
        all_resident
    }

    fn viewport(&self, physical: &PhysicalTile) -> TileViewport {
        let padded = self.desc.padded_tile_size();
        TileViewport {
            x: physical.x as u32 * padded,
            y: physical.y as u32 * padded,
            width: padded,
            height: padded,
        }
    }

    fn tile_world_rect(&self, tile: VirtualTile) -> WorldRect {
        let size = self.desc.tile_world_size_at(tile.mip);
        let origin = self.desc.world_origin + Vec2::new(tile.x as f32, tile.y as f32) * size;
        WorldRect::from_origin_size(origin, Vec2::splat(size))
    }

    /// Serve up to `max_requests` pending requests, most detailed mip first.
    ///
    /// Each request takes the least recently used slot, resident or not. On a
    /// successful fill the slot's previous tile loses its page-table entry and
    /// the new one gains it. Failed fills still count against the budget.
    /// Whatever remains pending afterwards is dropped.
    pub fn update(&mut self, max_requests: usize, filler: &mut impl TileFiller) -> UpdateStats {
        let requested = self.pending.len();
        let mut stats = UpdateStats::default();

        while stats.processed < max_requests {
            let Some(tile) = self.pending.pop_first() else {
                break;
            };
            if let Some(&slot) = self.resident.get(&tile) {
                self.slots.touch(slot);
                continue;
            }
            let Some(slot) = self.slots.front() else {
                break;
            };
            let Some(&physical) = self.slots.get(slot) else {
                break;
            };
            // The generation only advances once the slot actually changes hands.
            let generation = physical.generation.wrapping_add(1);

            stats.processed += 1;
            let request = TileFillRequest {
                tile,
                viewport: self.viewport(&physical),
                ticket: SlotTicket {
                    slot,
                    generation,
                    tile,
                },
                world: self.tile_world_rect(tile),
                tile_size: self.desc.tile_size,
                padding: self.desc.tile_padding,
            };

            if !filler.fill(&request) {
                trace!(texture = %self.desc.name, ?tile, "tile fill not ready");
                stats.failed += 1;
                continue;
            }

            if let Some(old) = physical.resident {
                self.resident.remove(&old);
                self.indirection.clear_tile(old);
                stats.evicted += 1;
                trace!(texture = %self.desc.name, ?old, ?tile, "evicted tile");
            }
            if let Some(slot_tile) = self.slots.get_mut(slot) {
                slot_tile.resident = Some(tile);
                slot_tile.generation = generation;
            }
            self.resident.insert(tile, slot);
            self.indirection
                .set_tile(tile, MapEntry::new(physical.x, physical.y, tile.mip as u8));
            self.slots.touch(slot);
            stats.filled += 1;
        }

        stats.dropped = self.pending.len();
        self.pending.clear();
        self.unsatisfied = requested.saturating_sub(stats.filled);

        self.stats.fills += stats.filled as u64;
        self.stats.fill_failures += stats.failed as u64;
        self.stats.evictions += stats.evicted as u64;
        self.stats.dropped += stats.dropped as u64;

        if stats.processed > 0 {
            debug!(
                texture = %self.desc.name,
                processed = stats.processed,
                filled = stats.filled,
                failed = stats.failed,
                evicted = stats.evicted,
                dropped = stats.dropped,
                "virtual texture update"
            );
        }
        stats
    }

    /// Collect last frame's mip redirection and upload it through `sink`.
    pub fn begin_frame(&mut self, sink: &mut dyn IndirectionSink) -> usize {
        self.indirection.begin_mip_redirection_update(sink)
    }

    /// Launch mip redirection for every map changed this frame.
    pub fn end_frame(&mut self, pool: &JobPool) -> usize {
        self.indirection.end_mip_redirection_update(pool)
    }

    /// Bind the textures and constants for rendering the node covering
    /// `footprint`. Returns `false` (binding nothing) while the node's
    /// indirection map cannot resolve any texel.
    ///
    /// Only the indirection map under the centre of `footprint` is bound. A
    /// footprint that crosses into a neighbouring map samples the bound map
    /// outside its chunk, so nodes should not be larger than one chunk.
    pub fn begin_rendering<B: TextureBinder>(
        &self,
        binder: &mut B,
        stage: B::Stage,
        sampler: B::Sampler,
        footprint: WorldRect,
    ) -> bool {
        let chunk = self.desc.chunk_world_size();
        let local = (footprint.center() - self.desc.world_origin) / chunk;
        if !(local.x >= 0.0 && local.y >= 0.0) {
            return false;
        }
        let key = IndirectionTileKey {
            x: local.x.floor() as u32,
            y: local.y.floor() as u32,
        };
        let Some(map) = self.indirection.map(key) else {
            return false;
        };
        let coarsest = map.mip_count() - 1;
        if !map.resolved(0, 0, coarsest).is_some_and(|e| e.is_valid()) {
            return false;
        }

        let (physical_w, physical_h) = self.desc.physical_size();
        let (physical_w, physical_h) = (physical_w as f32, physical_h as f32);
        let tile = self.desc.tile_size as f32;
        let padded = self.desc.padded_tile_size() as f32;
        let origin = self.desc.world_origin + Vec2::new(key.x as f32, key.y as f32) * chunk;
        let constants = ChunkConstants {
            inv_chunk_size: [1.0 / chunk; 2],
            tile_uv_size: [tile / physical_w, tile / physical_h],
            padded_tile_uv_size: [padded / physical_w, padded / physical_h],
            chunk_origin: origin.to_array(),
        };

        binder.bind_indirection(&self.desc.name, stage, sampler, key);
        binder.bind_physical(&self.desc.name, stage, sampler);
        binder.set_constants(&self.desc.name, stage, &constants);
        true
    }

    pub fn end_rendering<B: TextureBinder>(&self, binder: &mut B, stage: B::Stage) {
        binder.unbind(&self.desc.name, stage);
    }

    /// Forget every resident tile and pending request.
    pub fn reset(&mut self) {
        self.indirection.clear();
        self.slots = Self::build_slots(&self.desc);
        self.resident.clear();
        self.pending.clear();
        self.unsatisfied = 0;
    }
}
