//! Tile fill callbacks that render height and material data into CPU-side
//! physical caches.
//!
//! The height filler fetches tile samples on the job pool: the first fill
//! attempt for a tile queues the fetch and reports "not ready", and a later
//! attempt copies the finished samples into whatever slot it is handed then.
//! Samples are only ever written inside a fill call, so a fetch that lands
//! after the camera moved on can never overwrite a reused slot.

use std::sync::Arc;

use bytemuck::Pod;
use glam::Vec2;
use rustc_hash::FxHashMap;
use strata_jobs::{JobHandle, JobPool};
use strata_vtex::{TileFillRequest, TileFiller, TileViewport, VirtualTile, WorldRect};
use tracing::trace;

use crate::heightmap::HeightmapSampler;

/// Frames an unclaimed height fetch is kept before it is discarded.
const FETCH_LIFETIME_FRAMES: u64 = 8;

/// CPU copy of a physical cache texture.
#[derive(Debug, Clone)]
pub struct PhysicalCache<T> {
    width: u32,
    height: u32,
    texels: Vec<T>,
}

impl<T: Pod + Default> PhysicalCache<T> {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            texels: vec![T::default(); (width as usize) * (height as usize)],
        }
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn get(&self, x: u32, y: u32) -> Option<T> {
        if x >= self.width || y >= self.height {
            return None;
        }
        self.texels.get((y * self.width + x) as usize).copied()
    }

    /// Write `viewport` from row-major `data`. Returns `false` when the
    /// viewport does not fit or `data` has the wrong length.
    pub fn write_region(&mut self, viewport: TileViewport, data: &[T]) -> bool {
        if viewport.x + viewport.width > self.width
            || viewport.y + viewport.height > self.height
            || data.len() != (viewport.width * viewport.height) as usize
        {
            return false;
        }
        for row in 0..viewport.height {
            let dst = ((viewport.y + row) * self.width + viewport.x) as usize;
            let src = (row * viewport.width) as usize;
            self.texels[dst..dst + viewport.width as usize]
                .copy_from_slice(&data[src..src + viewport.width as usize]);
        }
        true
    }

    /// Raw texel bytes, ready for a texture upload.
    pub fn as_bytes(&self) -> &[u8] {
        bytemuck::cast_slice(&self.texels)
    }
}

/// World position of every texel centre of a padded tile, row-major.
fn texel_centers(world: WorldRect, texels: u32) -> impl Iterator<Item = Vec2> {
    let step = world.size() / texels.max(1) as f32;
    (0..texels).flat_map(move |y| {
        (0..texels).map(move |x| world.min + (Vec2::new(x as f32, y as f32) + 0.5) * step)
    })
}

/// Height samples of one padded tile.
fn sample_tile(sampler: &HeightmapSampler, world: WorldRect, texels: u32) -> Vec<f32> {
    texel_centers(world, texels)
        .map(|p| sampler.height_at(p))
        .collect()
}

struct HeightFetch {
    job: JobHandle<Vec<f32>>,
    samples: Option<Vec<f32>>,
    last_wanted: u64,
}

/// Fills height tiles from a [`HeightmapSampler`], fetching on the job pool.
pub struct HeightTileFiller {
    sampler: Arc<HeightmapSampler>,
    pool: Arc<JobPool>,
    cache: PhysicalCache<f32>,
    fetches: FxHashMap<VirtualTile, HeightFetch>,
    frame: u64,
    fills: u64,
}

impl HeightTileFiller {
    pub fn new(
        sampler: Arc<HeightmapSampler>,
        pool: Arc<JobPool>,
        physical_size: (u32, u32),
    ) -> Self {
        Self {
            sampler,
            pool,
            cache: PhysicalCache::new(physical_size.0, physical_size.1),
            fetches: FxHashMap::default(),
            frame: 0,
            fills: 0,
        }
    }

    pub fn cache(&self) -> &PhysicalCache<f32> {
        &self.cache
    }

    /// Fetches queued or finished but not yet written.
    pub fn fetches_in_flight(&self) -> usize {
        self.fetches.len()
    }

    /// Tiles written into the cache.
    pub fn fill_count(&self) -> u64 {
        self.fills
    }

    /// Advance the frame counter and forget fetches nobody asked for lately.
    pub fn end_frame(&mut self) {
        self.frame += 1;
        let frame = self.frame;
        self.fetches.retain(|tile, fetch| {
            let keep = frame - fetch.last_wanted <= FETCH_LIFETIME_FRAMES;
            if !keep {
                trace!(?tile, "discarding unclaimed height fetch");
            }
            keep
        });
    }
}

impl TileFiller for HeightTileFiller {
    fn fill(&mut self, request: &TileFillRequest) -> bool {
        let frame = self.frame;
        let fetch = self.fetches.entry(request.tile).or_insert_with(|| {
            let sampler = Arc::clone(&self.sampler);
            let world = request.padded_world();
            let texels = request.viewport.width;
            trace!(tile = ?request.tile, "queued height fetch");
            HeightFetch {
                job: self.pool.spawn(move || sample_tile(&sampler, world, texels)),
                samples: None,
                last_wanted: frame,
            }
        });
        fetch.last_wanted = frame;
        if fetch.samples.is_none() {
            fetch.samples = fetch.job.try_take();
        }
        let Some(samples) = fetch.samples.as_deref() else {
            return false;
        };

        if !self.cache.write_region(request.viewport, samples) {
            trace!(
                tile = ?request.tile,
                viewport = ?request.viewport,
                "height tile does not fit its slot"
            );
            return false;
        }
        self.fetches.remove(&request.tile);
        self.fills += 1;
        true
    }
}

impl std::fmt::Debug for HeightTileFiller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HeightTileFiller")
            .field("fetches", &self.fetches.len())
            .field("frame", &self.frame)
            .field("fills", &self.fills)
            .finish()
    }
}

/// One composited surface layer.
#[derive(Clone, Debug, PartialEq)]
pub struct MaterialLayer {
    pub name: &'static str,
    /// RGBA albedo.
    pub color: [u8; 4],
    /// Layer applies at or above this height.
    pub min_height: f32,
    /// Layer applies when the slope (rise over run) is at most this.
    pub max_slope: f32,
}

/// Default layer stack, highest priority first. Rock is the fallback.
pub fn default_layers(min_height: f32, max_height: f32) -> Vec<MaterialLayer> {
    let span = max_height - min_height;
    vec![
        MaterialLayer {
            name: "snow",
            color: [240, 244, 250, 255],
            min_height: min_height + span * 0.8,
            max_slope: 0.8,
        },
        MaterialLayer {
            name: "grass",
            color: [82, 128, 54, 255],
            min_height: min_height + span * 0.25,
            max_slope: 0.6,
        },
        MaterialLayer {
            name: "sand",
            color: [210, 190, 140, 255],
            min_height: f32::NEG_INFINITY,
            max_slope: 0.3,
        },
        MaterialLayer {
            name: "rock",
            color: [110, 104, 98, 255],
            min_height: f32::NEG_INFINITY,
            max_slope: f32::INFINITY,
        },
    ]
}

/// Composites material colors from height and slope.
pub struct MaterialTileFiller {
    sampler: Arc<HeightmapSampler>,
    layers: Vec<MaterialLayer>,
    cache: PhysicalCache<[u8; 4]>,
    fills: u64,
}

impl MaterialTileFiller {
    pub fn new(
        sampler: Arc<HeightmapSampler>,
        layers: Vec<MaterialLayer>,
        physical_size: (u32, u32),
    ) -> Self {
        Self {
            sampler,
            layers,
            cache: PhysicalCache::new(physical_size.0, physical_size.1),
            fills: 0,
        }
    }

    pub fn cache(&self) -> &PhysicalCache<[u8; 4]> {
        &self.cache
    }

    pub fn fill_count(&self) -> u64 {
        self.fills
    }

    /// Layer chosen at `position`; the last layer is the fallback.
    pub fn layer_at(&self, position: Vec2, texel_size: f32) -> Option<&MaterialLayer> {
        let height = self.sampler.height_at(position);
        let slope = self.sampler.gradient(position, texel_size).length();
        self.layers
            .iter()
            .find(|layer| height >= layer.min_height && slope <= layer.max_slope)
            .or_else(|| self.layers.last())
    }
}

impl TileFiller for MaterialTileFiller {
    fn fill(&mut self, request: &TileFillRequest) -> bool {
        let texel_size = request.texel_world_size();
        let texels: Vec<[u8; 4]> = texel_centers(request.padded_world(), request.viewport.width)
            .map(|p| self.layer_at(p, texel_size).map_or([0; 4], |layer| layer.color))
            .collect();
        let written = self.cache.write_region(request.viewport, &texels);
        if written {
            self.fills += 1;
        }
        written
    }
}

impl std::fmt::Debug for MaterialTileFiller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MaterialTileFiller")
            .field("layers", &self.layers.len())
            .field("fills", &self.fills)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::heightmap::HeightmapParams;
    use strata_vtex::SlotTicket;

    fn flat_sampler(height: f64) -> Arc<HeightmapSampler> {
        Arc::new(HeightmapSampler::new(HeightmapParams {
            amplitude: 0.0,
            base_height: height,
            ..HeightmapParams::default()
        }))
    }

    fn request(tile: VirtualTile, slot_x: u32) -> TileFillRequest {
        TileFillRequest {
            tile,
            viewport: TileViewport {
                x: slot_x * 6,
                y: 0,
                width: 6,
                height: 6,
            },
            ticket: SlotTicket {
                slot: slot_x as usize,
                generation: 1,
                tile,
            },
            world: WorldRect::new(Vec2::ZERO, Vec2::splat(4.0)),
            tile_size: 4,
            padding: 1,
        }
    }

    #[test]
    fn test_write_region_bounds() {
        let mut cache = PhysicalCache::<f32>::new(4, 4);
        let viewport = TileViewport {
            x: 2,
            y: 1,
            width: 2,
            height: 2,
        };
        assert!(cache.write_region(viewport, &[1.0, 2.0, 3.0, 4.0]));
        assert_eq!(cache.get(3, 1), Some(2.0));
        assert_eq!(cache.get(2, 2), Some(3.0));
        assert_eq!(cache.get(0, 0), Some(0.0));
        assert!(!cache.write_region(TileViewport { x: 3, ..viewport }, &[0.0; 4]));
        assert!(!cache.write_region(viewport, &[0.0; 3]));
        assert_eq!(cache.as_bytes().len(), 64);
    }

    #[test]
    fn test_texel_centers_cover_padded_tile() {
        let centers: Vec<_> =
            texel_centers(WorldRect::new(Vec2::ZERO, Vec2::splat(2.0)), 2).collect();
        assert_eq!(
            centers,
            vec![
                Vec2::new(0.5, 0.5),
                Vec2::new(1.5, 0.5),
                Vec2::new(0.5, 1.5),
                Vec2::new(1.5, 1.5),
            ]
        );
    }

    #[test]
    fn test_inline_height_fill_is_immediate() {
        let pool = Arc::new(JobPool::inline());
        let mut filler = HeightTileFiller::new(flat_sampler(42.0), pool, (12, 6));
        assert!(filler.fill(&request(VirtualTile::new(0, 0, 0), 1)));
        assert_eq!(filler.cache().get(6, 0), Some(42.0));
        assert_eq!(filler.cache().get(11, 5), Some(42.0));
        assert_eq!(filler.cache().get(0, 0), Some(0.0));
        assert_eq!(filler.fetches_in_flight(), 0);
        assert_eq!(filler.fill_count(), 1);
    }

    /// A background fetch reports "not ready" until its samples land, then
    /// writes into the slot of the request that claims it.
    #[test]
    fn test_background_height_fill_retries() {
        let pool = Arc::new(JobPool::new(1, 8).unwrap());
        let mut filler = HeightTileFiller::new(flat_sampler(7.0), pool, (12, 6));
        let tile = VirtualTile::new(3, 2, 1);

        let mut filled = filler.fill(&request(tile, 0));
        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(5);
        while !filled && std::time::Instant::now() < deadline {
            std::thread::sleep(std::time::Duration::from_millis(1));
            filled = filler.fill(&request(tile, 1));
        }
        assert!(filled);
        assert_eq!(filler.fetches_in_flight(), 0);
        assert_eq!(filler.fill_count(), 1);
    }

    /// Samples that could not be written stay around for the next request.
    #[test]
    fn test_failed_write_keeps_fetched_samples() {
        let pool = Arc::new(JobPool::new(1, 8).unwrap());
        let mut filler = HeightTileFiller::new(flat_sampler(3.0), Arc::clone(&pool), (12, 6));
        let tile = VirtualTile::new(1, 1, 0);

        // Slot 2 lies outside the 12x6 cache, so the write can never land.
        assert!(!filler.fill(&request(tile, 2)));
        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(5);
        while pool.in_flight_count() > 0 && std::time::Instant::now() < deadline {
            std::thread::sleep(std::time::Duration::from_millis(1));
        }
        assert!(!filler.fill(&request(tile, 2)));
        assert_eq!(filler.fetches_in_flight(), 1);
        assert_eq!(filler.fill_count(), 0);

        // With the worker held, a refetch could not finish; the kept samples can.
        let (release, gate) = std::sync::mpsc::channel::<()>();
        let blocker = pool.spawn(move || {
            let _ = gate.recv();
        });
        assert!(filler.fill(&request(tile, 1)));
        assert_eq!(filler.cache().get(6, 0), Some(3.0));
        assert_eq!(filler.fetches_in_flight(), 0);
        assert_eq!(filler.fill_count(), 1);

        release.send(()).unwrap();
        assert_eq!(blocker.wait(), Some(()));
    }

    #[test]
    fn test_unclaimed_fetches_expire() {
        let pool = Arc::new(JobPool::new(1, 8).unwrap());
        // Hold the only worker so the fetch stays queued.
        let (release, gate) = std::sync::mpsc::channel::<()>();
        let blocker = pool.spawn(move || {
            let _ = gate.recv();
        });
        let mut filler = HeightTileFiller::new(flat_sampler(1.0), Arc::clone(&pool), (12, 6));
        assert!(!filler.fill(&request(VirtualTile::new(0, 0, 0), 0)));
        assert_eq!(filler.fetches_in_flight(), 1);

        for _ in 0..FETCH_LIFETIME_FRAMES {
            filler.end_frame();
        }
        assert_eq!(filler.fetches_in_flight(), 1);
        filler.end_frame();
        assert_eq!(filler.fetches_in_flight(), 0);

        release.send(()).unwrap();
        assert_eq!(blocker.wait(), Some(()));
    }

    #[test]
    fn test_material_layers_by_height_and_slope() {
        let layers = default_layers(0.0, 100.0);
        assert_eq!(layers.last().map(|l| l.name), Some("rock"));

        let high = MaterialTileFiller::new(flat_sampler(90.0), layers.clone(), (6, 6));
        assert_eq!(high.layer_at(Vec2::ZERO, 1.0).map(|l| l.name), Some("snow"));
        let mid = MaterialTileFiller::new(flat_sampler(50.0), layers.clone(), (6, 6));
        assert_eq!(mid.layer_at(Vec2::ZERO, 1.0).map(|l| l.name), Some("grass"));
        let low = MaterialTileFiller::new(flat_sampler(5.0), layers, (6, 6));
        assert_eq!(low.layer_at(Vec2::ZERO, 1.0).map(|l| l.name), Some("sand"));
    }

    #[test]
    fn test_material_fill_writes_colors() {
        let mut filler =
            MaterialTileFiller::new(flat_sampler(50.0), default_layers(0.0, 100.0), (6, 6));
        assert!(filler.fill(&request(VirtualTile::new(0, 0, 0), 0)));
        assert_eq!(filler.cache().get(5, 5), Some([82, 128, 54, 255]));
        // Slot 1 does not fit a 6x6 cache.
        assert!(!filler.fill(&request(VirtualTile::new(1, 0, 0), 1)));
        assert_eq!(filler.fill_count(), 1);
    }
}
