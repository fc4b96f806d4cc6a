//! Headless Strata driver.
//!
//! Flies a camera over procedural terrain and runs the full streaming frame
//! each step: LOD selection, tile requests, tile fills, mip redirection and
//! per-node texture binding against a recording binder instead of a GPU.

mod flight;
mod frame_clock;
mod platform;

use std::sync::Arc;

use strata_cdlod::{CdlodQuadtree, LodSelection, QuadtreeError, SelectionDesc};
use strata_config::{CliArgs, Config, ConfigError, JobsConfig};
use strata_jobs::{JobError, JobPool};
use strata_terrain::{
    HeightTileFiller, HeightmapParams, HeightmapSampler, MaterialTileFiller, TerrainHeightRange,
    TerrainTextureCache, default_layers,
};
use strata_vtex::{
    ChunkConstants, IndirectionSink, IndirectionTileKey, MapEntry, TextureBinder,
    VirtualTextureError, WrapperStats, entries_as_bytes,
};
use thiserror::Error;
use tracing::{debug, info, warn};

pub use flight::{FlightCamera, FlightPath};
pub use frame_clock::{FIXED_DT, FrameClock, SLOW_FRAME_TIME};
pub use platform::PlatformDirs;

/// Seed of the procedural heightmap.
const TERRAIN_SEED: u32 = 0x5742_4154;

/// Frames between progress lines at info level.
const PROGRESS_INTERVAL: u64 = 60;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("could not determine OS configuration directory")]
    NoConfigDir,

    #[error("platform I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Jobs(#[from] JobError),

    #[error(transparent)]
    Quadtree(#[from] QuadtreeError),

    #[error(transparent)]
    Texture(#[from] VirtualTextureError),
}

/// Counts resolved indirection data handed over for upload.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct UploadCounter {
    /// Mip levels uploaded.
    pub mips: u64,
    pub bytes: u64,
}

impl IndirectionSink for UploadCounter {
    fn upload(&mut self, _key: IndirectionTileKey, _mip: u32, _side: u32, entries: &[MapEntry]) {
        self.mips += 1;
        self.bytes += entries_as_bytes(entries).len() as u64;
    }
}

/// Stands in for the GPU: records what a node draw would bind.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DrawRecorder {
    pub indirection_binds: u64,
    pub physical_binds: u64,
    pub constant_bytes: u64,
    pub unbinds: u64,
}

impl TextureBinder for DrawRecorder {
    type Stage = u32;
    type Sampler = ();

    fn bind_indirection(&mut self, _: &str, _: u32, _: (), _: IndirectionTileKey) {
        self.indirection_binds += 1;
    }

    fn bind_physical(&mut self, _: &str, _: u32, _: ()) {
        self.physical_binds += 1;
    }

    fn set_constants(&mut self, _: &str, _: u32, constants: &ChunkConstants) {
        self.constant_bytes += bytemuck::bytes_of(constants).len() as u64;
    }

    fn unbind(&mut self, _: &str, _: u32) {
        self.unbinds += 1;
    }
}

/// What happened in one frame.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FrameReport {
    pub frame: u64,
    pub selected: usize,
    /// Nodes whose tiles were all resident when requested.
    pub resident: usize,
    pub streaming_nodes: usize,
    pub rendered: usize,
    /// Nodes skipped because their textures could not be sampled yet.
    pub skipped: usize,
    pub height_filled: usize,
    pub material_filled: usize,
    pub ready: bool,
    pub frame_ms: f64,
}

/// Totals over a run.
#[derive(Debug, Clone, PartialEq)]
pub struct RunSummary {
    pub frames: u64,
    /// First frame at which the texture cache reported ready.
    pub first_ready_frame: Option<u64>,
    pub peak_selected: usize,
    pub rendered_nodes: u64,
    pub skipped_nodes: u64,
    pub overflow_frames: u64,
    pub height: WrapperStats,
    pub material: WrapperStats,
    pub height_uploads: UploadCounter,
    pub material_uploads: UploadCounter,
    pub average_frame_ms: f64,
    pub max_frame_ms: f64,
}

impl RunSummary {
    pub fn log(&self) {
        info!(
            frames = self.frames,
            first_ready_frame = ?self.first_ready_frame,
            peak_selected = self.peak_selected,
            rendered = self.rendered_nodes,
            skipped = self.skipped_nodes,
            overflow_frames = self.overflow_frames,
            "Run finished"
        );
        info!(
            height_fills = self.height.fills,
            height_evictions = self.height.evictions,
            material_fills = self.material.fills,
            material_evictions = self.material.evictions,
            indirection_bytes = self.height_uploads.bytes + self.material_uploads.bytes,
            "Texture streaming totals"
        );
        info!(
            "Frame time: {:.2}ms average, {:.2}ms worst",
            self.average_frame_ms, self.max_frame_ms
        );
    }
}

/// Owns every streaming component and runs frames.
pub struct TerrainDriver {
    config: Config,
    pool: Arc<JobPool>,
    sampler: Arc<HeightmapSampler>,
    tree: CdlodQuadtree,
    cache: TerrainTextureCache,
    height_filler: HeightTileFiller,
    material_filler: MaterialTileFiller,
    render_selection: LodSelection,
    streaming_selection: LodSelection,
    flight: FlightPath,
    clock: FrameClock,
    height_uploads: UploadCounter,
    material_uploads: UploadCounter,
    recorder: DrawRecorder,
    first_ready_frame: Option<u64>,
    peak_selected: usize,
    rendered_nodes: u64,
    skipped_nodes: u64,
    overflow_frames: u64,
}

impl TerrainDriver {
    pub fn new(config: Config, pool: Arc<JobPool>) -> Result<Self, AppError> {
        config.validate()?;

        let sampler = Arc::new(HeightmapSampler::new(HeightmapParams::for_world(
            &config.world,
            TERRAIN_SEED,
        )));
        let provider = Arc::new(TerrainHeightRange::from_config(&config, Arc::clone(&sampler)));
        let tree = CdlodQuadtree::from_config(&config, provider, Some(Arc::clone(&pool)))?;
        let cache = TerrainTextureCache::new(&config)?;

        let height_filler = HeightTileFiller::new(
            Arc::clone(&sampler),
            Arc::clone(&pool),
            cache.height().desc().physical_size(),
        );
        let material_filler = MaterialTileFiller::new(
            Arc::clone(&sampler),
            default_layers(config.world.min_height, config.world.max_height),
            cache.material().desc().physical_size(),
        );

        let capacity = config.lod.max_selected_nodes;
        let (top_x, top_y) = tree.top_node_count();
        info!(
            top_nodes = top_x * top_y,
            lod_levels = tree.lod_level_count(),
            selection_capacity = capacity,
            "Terrain driver ready"
        );

        Ok(Self {
            flight: FlightPath::from_config(&config),
            render_selection: LodSelection::with_capacity(capacity),
            streaming_selection: LodSelection::with_capacity(capacity),
            config,
            pool,
            sampler,
            tree,
            cache,
            height_filler,
            material_filler,
            clock: FrameClock::new(),
            height_uploads: UploadCounter::default(),
            material_uploads: UploadCounter::default(),
            recorder: DrawRecorder::default(),
            first_ready_frame: None,
            peak_selected: 0,
            rendered_nodes: 0,
            skipped_nodes: 0,
            overflow_frames: 0,
        })
    }

    pub fn cache(&self) -> &TerrainTextureCache {
        &self.cache
    }

    pub fn render_selection(&self) -> &LodSelection {
        &self.render_selection
    }

    pub fn recorder(&self) -> &DrawRecorder {
        &self.recorder
    }

    /// Run one frame of the streaming pipeline.
    pub fn frame(&mut self) -> FrameReport {
        let frame = self.clock.frame_count();
        let time = self.clock.begin_frame();
        self.cache
            .begin_frame(&mut self.height_uploads, &mut self.material_uploads);

        let camera = self.flight.camera(time, &self.sampler);
        let frustum = self.flight.frustum(&camera);

        let desc = SelectionDesc::from_config(&self.config, camera.position, frustum);
        self.tree.lod_select(&desc, &mut self.render_selection);
        let resident = self.cache.request_for_selection(&self.render_selection);

        let streaming = SelectionDesc::texture_streaming(
            &self.config,
            &self.config.material_texture,
            camera.position,
            frustum,
        );
        self.tree.lod_select(&streaming, &mut self.streaming_selection);
        self.prefetch_material();

        let update = self
            .cache
            .update(&mut self.height_filler, &mut self.material_filler);
        self.height_filler.end_frame();
        self.cache.end_frame(&self.pool);

        let (mut rendered, mut skipped) = (0, 0);
        for node in self.render_selection.nodes() {
            if self.cache.begin_rendering(&mut self.recorder, 0, (), node) {
                self.cache.end_rendering(&mut self.recorder, 0);
                rendered += 1;
            } else {
                skipped += 1;
            }
        }

        if self.config.debug.freeze_selection && frame == 0 {
            self.render_selection.set_frozen(true);
            self.streaming_selection.set_frozen(true);
            info!("Selection frozen after the first frame");
        }

        let ready = self.cache.is_ready();
        let frame_ms = self.clock.end_frame() * 1000.0;
        let report = FrameReport {
            frame,
            selected: self.render_selection.len(),
            resident,
            streaming_nodes: self.streaming_selection.len(),
            rendered,
            skipped,
            height_filled: update.height.filled,
            material_filled: update.material.filled,
            ready,
            frame_ms,
        };
        self.record(&report);
        report
    }

    /// Request material tiles at the mips the streaming selection asks for,
    /// while the material queue still has room this frame.
    fn prefetch_material(&mut self) {
        let budget = self.config.material_texture.requests_per_frame as usize;
        let max_mip = self.config.material_texture.mip_levels.saturating_sub(1) as i64;
        let bias = self.config.streaming.lod_mip_bias as i64;
        for node in self.streaming_selection.nodes() {
            if self.cache.material().pending_count() >= budget {
                break;
            }
            let Some(interval) = node.mip_interval else {
                continue;
            };
            let mip = (node.lod_level as i64 + bias).clamp(0, max_mip) as u32;
            if !interval.contains_level(mip) {
                continue;
            }
            let (min, max) = node.footprint();
            self.cache.request_material_tiles(min, max - min, mip);
        }
    }

    fn record(&mut self, report: &FrameReport) {
        if report.ready && self.first_ready_frame.is_none() {
            self.first_ready_frame = Some(report.frame);
            info!(frame = report.frame, "Texture cache ready");
        }
        self.peak_selected = self.peak_selected.max(report.selected);
        self.rendered_nodes += report.rendered as u64;
        self.skipped_nodes += report.skipped as u64;
        if self.render_selection.overflowed() {
            self.overflow_frames += 1;
        }
        if self.render_selection.visibility_distance_too_small() && report.frame == 0 {
            warn!("max_visibility_distance does not reach the coarsest LOD range");
        }

        debug!(
            frame = report.frame,
            selected = report.selected,
            resident = report.resident,
            streaming = report.streaming_nodes,
            rendered = report.rendered,
            skipped = report.skipped,
            height_filled = report.height_filled,
            material_filled = report.material_filled,
            ready = report.ready,
            "frame"
        );
        if report.frame % PROGRESS_INTERVAL == 0 {
            info!(
                frame = report.frame,
                selected = report.selected,
                rendered = report.rendered,
                height_outstanding = self.cache.outstanding_height_requests(),
                material_outstanding = self.cache.outstanding_material_requests(),
                "Frame {:.2}ms",
                report.frame_ms
            );
        }
    }

    /// Run `frames` frames and return the totals.
    pub fn run(&mut self, frames: u32) -> RunSummary {
        for _ in 0..frames {
            self.frame();
        }
        self.summary()
    }

    pub fn summary(&self) -> RunSummary {
        let stats = self.cache.stats();
        RunSummary {
            frames: self.clock.frame_count(),
            first_ready_frame: self.first_ready_frame,
            peak_selected: self.peak_selected,
            rendered_nodes: self.rendered_nodes,
            skipped_nodes: self.skipped_nodes,
            overflow_frames: self.overflow_frames,
            height: stats.height,
            material: stats.material,
            height_uploads: self.height_uploads,
            material_uploads: self.material_uploads,
            average_frame_ms: self.clock.average_frame_ms(),
            max_frame_ms: self.clock.max_frame_ms(),
        }
    }
}

/// Build the job pool described by the configuration.
pub fn build_pool(jobs: &JobsConfig) -> Result<JobPool, JobError> {
    if jobs.worker_threads == 0 {
        JobPool::with_defaults()
    } else {
        JobPool::new(jobs.worker_threads, jobs.queue_capacity)
    }
}

/// Entry point of the `strata` binary.
pub fn run(args: &CliArgs) -> Result<RunSummary, AppError> {
    let dirs = PlatformDirs::resolve(args.config.as_deref())?;
    run_in(args, &dirs)
}

/// Like [`run`], with explicit directories.
pub fn run_in(args: &CliArgs, dirs: &PlatformDirs) -> Result<RunSummary, AppError> {
    dirs.create_dirs()?;
    let mut config = Config::load_or_create(&dirs.config_dir)?;
    config.apply_cli_overrides(args);
    strata_log::init_logging(Some(&dirs.log_dir), cfg!(debug_assertions), Some(&config));
    config.validate()?;

    info!(
        config_dir = %dirs.config_dir.display(),
        frames = args.frames,
        "Starting Strata"
    );

    let pool = Arc::new(build_pool(&config.jobs)?);
    info!(workers = pool.thread_count(), "Job pool started");

    let mut driver = TerrainDriver::new(config, pool)?;
    Ok(driver.run(args.frames))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_config() -> Config {
        let mut config = Config::default();
        config.world.size = [512.0, 512.0];
        config.quadtree.leaf_node_size = 16.0;
        config.quadtree.lod_level_count = 4;
        config.lod.initial_lod_distance = 40.0;
        config.lod.max_visibility_distance = 1000.0;
        for texture in [&mut config.height_texture, &mut config.material_texture] {
            texture.tile_size = 8;
            texture.tile_padding = 1;
            texture.mip_levels = 5;
            texture.texels_per_meter = 0.25;
            texture.requests_per_frame = 16;
        }
        config
    }

    fn small_driver() -> TerrainDriver {
        let pool = Arc::new(JobPool::new(2, 32).unwrap());
        TerrainDriver::new(small_config(), pool).unwrap()
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let mut config = small_config();
        config.lod.lod_ratio = 0.5;
        let result = TerrainDriver::new(config, Arc::new(JobPool::inline()));
        assert!(matches!(result, Err(AppError::Config(ConfigError::Invalid(_)))));
    }

    /// Every selected node is either drawn or skipped, and draws bind both textures.
    #[test]
    fn test_frames_account_for_every_node() {
        let mut driver = small_driver();
        let mut selected = 0u64;
        for _ in 0..60 {
            let report = driver.frame();
            assert_eq!(report.rendered + report.skipped, report.selected);
            selected += report.selected as u64;
        }
        let summary = driver.summary();
        assert_eq!(summary.frames, 60);
        assert_eq!(summary.rendered_nodes + summary.skipped_nodes, selected);
        assert!(summary.peak_selected > 0);

        let recorder = driver.recorder();
        // A node whose material fails after height bound still unbinds height.
        assert!(recorder.indirection_binds >= 2 * summary.rendered_nodes);
        assert_eq!(recorder.unbinds, recorder.indirection_binds);
        assert_eq!(
            recorder.constant_bytes,
            recorder.indirection_binds * std::mem::size_of::<ChunkConstants>() as u64
        );
    }

    /// Streaming makes progress: tiles get filled and redirection uploaded.
    #[test]
    fn test_run_streams_tiles() {
        let mut driver = small_driver();
        let summary = driver.run(120);
        assert!(summary.height.fills > 0);
        assert!(summary.material.fills > 0);
        assert!(summary.height_uploads.bytes > 0);
        assert_eq!(summary.height_uploads.bytes % 4, 0);
        assert!(summary.rendered_nodes > 0);
        assert_eq!(summary.overflow_frames, 0);
    }

    #[test]
    fn test_freeze_selection_keeps_first_frame() {
        let mut config = small_config();
        config.debug.freeze_selection = true;
        let mut driver = TerrainDriver::new(config, Arc::new(JobPool::new(1, 8).unwrap())).unwrap();
        driver.frame();
        let first = driver.render_selection().nodes().to_vec();
        for _ in 0..10 {
            driver.frame();
        }
        assert_eq!(driver.render_selection().nodes(), first.as_slice());
    }

    /// A run from an empty config directory writes the default config.
    #[test]
    fn test_run_in_creates_config() {
        let tmp = tempfile::tempdir().unwrap();
        let dirs = PlatformDirs::resolve_with_root(tmp.path());
        let args = CliArgs {
            frames: 2,
            log_level: None,
            config: None,
            lod_ratio: None,
            initial_lod_distance: None,
            worker_threads: Some(1),
        };
        let summary = run_in(&args, &dirs).unwrap();
        assert_eq!(summary.frames, 2);
        assert!(dirs.config_dir.join("config.ron").exists());
    }

    #[test]
    fn test_upload_counter_counts_bytes() {
        let mut counter = UploadCounter::default();
        counter.upload(IndirectionTileKey { x: 0, y: 0 }, 0, 2, &[MapEntry::INVALID; 4]);
        assert_eq!(counter, UploadCounter { mips: 1, bytes: 16 });
    }
}
