//! Terrain texture cache: turns quadtree selections into tile requests for
//! the height and material virtual textures.
//!
//! Height requests are padded because neighbouring nodes sample across their
//! borders; material requests are shrunk slightly so a node never pulls in
//! tiles it only touches at an edge. Every node also requests the coarsest
//! mip under it, so mip redirection always has a valid root to fall back on.

use glam::Vec2;
use strata_cdlod::{LodSelection, SelectedNode};
use strata_config::{Config, StreamingConfig};
use strata_jobs::JobPool;
use strata_vtex::{
    IndirectionSink, TextureBinder, TileFiller, UpdateStats, VirtualTextureDesc,
    VirtualTextureError, VirtualTileWrapper, WorldRect, WrapperStats,
};
use tracing::{debug, trace};

/// Result of one [`TerrainTextureCache::update`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheUpdateStats {
    pub height: UpdateStats,
    pub material: UpdateStats,
}

/// Lifetime counters of both virtual textures.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub height: WrapperStats,
    pub material: WrapperStats,
}

/// Height and material virtual textures driven by quadtree selections.
#[derive(Debug)]
pub struct TerrainTextureCache {
    height: VirtualTileWrapper,
    material: VirtualTileWrapper,
    streaming: StreamingConfig,
    height_requests_per_frame: usize,
    material_requests_per_frame: usize,
}

impl TerrainTextureCache {
    pub fn new(config: &Config) -> Result<Self, VirtualTextureError> {
        let height = VirtualTileWrapper::new(VirtualTextureDesc::from_config(
            "height",
            &config.height_texture,
            &config.world,
        ))?;
        let material = VirtualTileWrapper::new(VirtualTextureDesc::from_config(
            "material",
            &config.material_texture,
            &config.world,
        ))?;
        Ok(Self {
            height,
            material,
            streaming: config.streaming.clone(),
            height_requests_per_frame: config.height_texture.requests_per_frame,
            material_requests_per_frame: config.material_texture.requests_per_frame,
        })
    }

    pub fn height(&self) -> &VirtualTileWrapper {
        &self.height
    }

    pub fn material(&self) -> &VirtualTileWrapper {
        &self.material
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            height: self.height.stats(),
            material: self.material.stats(),
        }
    }

    /// Virtual mip a node at `lod_level` reads from `texture`.
    fn node_mip(&self, texture: &VirtualTileWrapper, lod_level: u32) -> u32 {
        let max_mip = texture.desc().mip_levels.saturating_sub(1) as i64;
        (lod_level as i64 + self.streaming.lod_mip_bias as i64).clamp(0, max_mip) as u32
    }

    fn node_rect(node: &SelectedNode) -> WorldRect {
        let (min, max) = node.footprint();
        WorldRect::new(min, max)
    }

    /// Request height tiles covering a world rectangle at `mip`.
    pub fn request_height_tiles(&mut self, origin: Vec2, size: Vec2, mip: u32) -> bool {
        self.height
            .request_tiles(WorldRect::from_origin_size(origin, size), mip)
    }

    /// Request material tiles covering a world rectangle at `mip`.
    pub fn request_material_tiles(&mut self, origin: Vec2, size: Vec2, mip: u32) -> bool {
        self.material
            .request_tiles(WorldRect::from_origin_size(origin, size), mip)
    }

    /// Request the tiles one node needs from both textures. Returns `true`
    /// when all of them are already resident.
    pub fn request_for_node(&mut self, node: &SelectedNode) -> bool {
        let rect = Self::node_rect(node);

        let height_rect = rect.expand(self.streaming.height_padding);
        let height_mip = self.node_mip(&self.height, node.lod_level);
        let height_root = self.height.desc().mip_levels - 1;
        let mut resident = self.height.request_tiles(height_rect, height_mip);
        if height_mip != height_root {
            resident &= self.height.request_tiles(height_rect, height_root);
        }

        let material_rect = rect.expand(-self.streaming.material_shrink);
        let material_mip = self.node_mip(&self.material, node.lod_level);
        let material_root = self.material.desc().mip_levels - 1;
        resident &= self.material.request_tiles(material_rect, material_mip);
        if material_mip != material_root {
            resident &= self.material.request_tiles(material_rect, material_root);
        }
        resident
    }

    /// Request tiles for every node of a selection. Returns the number of
    /// nodes whose tiles were all resident.
    pub fn request_for_selection(&mut self, selection: &LodSelection) -> usize {
        let mut ready = 0;
        for node in selection.nodes() {
            if self.request_for_node(node) {
                ready += 1;
            }
        }
        trace!(
            nodes = selection.len(),
            ready,
            height_pending = self.height.pending_count(),
            material_pending = self.material.pending_count(),
            "requested tiles for selection"
        );
        ready
    }

    /// Serve pending requests within each texture's per-frame budget.
    pub fn update(
        &mut self,
        height_filler: &mut impl TileFiller,
        material_filler: &mut impl TileFiller,
    ) -> CacheUpdateStats {
        let stats = CacheUpdateStats {
            height: self
                .height
                .update(self.height_requests_per_frame, height_filler),
            material: self
                .material
                .update(self.material_requests_per_frame, material_filler),
        };
        if stats.height.processed + stats.material.processed > 0 {
            debug!(
                height_filled = stats.height.filled,
                material_filled = stats.material.filled,
                height_outstanding = self.height.outstanding_requests(),
                material_outstanding = self.material.outstanding_requests(),
                "terrain texture cache update"
            );
        }
        stats
    }

    /// Outstanding height requests: this frame's pending ones, or what the
    /// last update left unsatisfied.
    pub fn outstanding_height_requests(&self) -> usize {
        self.height
            .pending_count()
            .max(self.height.outstanding_requests())
    }

    /// Outstanding material requests, counted like the height ones.
    pub fn outstanding_material_requests(&self) -> usize {
        self.material
            .pending_count()
            .max(self.material.outstanding_requests())
    }

    /// Soft readiness: both textures have only a few requests left.
    pub fn is_ready(&self) -> bool {
        self.outstanding_height_requests() < self.streaming.height_ready_threshold
            && self.outstanding_material_requests() < self.streaming.material_ready_threshold
    }

    /// Collect last frame's mip redirection and upload it.
    pub fn begin_frame(
        &mut self,
        height_sink: &mut dyn IndirectionSink,
        material_sink: &mut dyn IndirectionSink,
    ) -> usize {
        self.height.begin_frame(height_sink) + self.material.begin_frame(material_sink)
    }

    /// Launch mip redirection for everything that changed this frame.
    pub fn end_frame(&mut self, pool: &JobPool) -> usize {
        self.height.end_frame(pool) + self.material.end_frame(pool)
    }

    /// Bind both textures for rendering `node`. Returns `false`, with nothing
    /// left bound, if either cannot be sampled yet.
    ///
    /// Each texture binds the indirection map under the node's centre, even
    /// when the node's footprint reaches into the next map.
    pub fn begin_rendering<B: TextureBinder>(
        &self,
        binder: &mut B,
        stage: B::Stage,
        sampler: B::Sampler,
        node: &SelectedNode,
    ) -> bool {
        let rect = Self::node_rect(node);
        if !self.height.begin_rendering(binder, stage, sampler, rect) {
            return false;
        }
        if !self.material.begin_rendering(binder, stage, sampler, rect) {
            self.height.end_rendering(binder, stage);
            return false;
        }
        true
    }

    pub fn end_rendering<B: TextureBinder>(&self, binder: &mut B, stage: B::Stage) {
        self.material.end_rendering(binder, stage);
        self.height.end_rendering(binder, stage);
    }

    /// Forget all residency, e.g. after the world changed.
    pub fn reset(&mut self) {
        self.height.reset();
        self.material.reset();
    }
}
