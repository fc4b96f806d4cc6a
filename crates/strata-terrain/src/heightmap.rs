//! Procedural terrain heights: fBm over simplex noise, and the height-range
//! provider the quadtree uses to size node bounds.

use std::sync::Arc;

use glam::{DVec2, Vec2};
use noise::{NoiseFn, Simplex};
use strata_cdlod::HeightRangeProvider;
use strata_config::{Config, WorldConfig};

/// Multi-octave fBm parameters.
#[derive(Clone, Debug, PartialEq)]
pub struct HeightmapParams {
    /// Noise seed.
    pub seed: u32,
    /// Number of octaves summed per sample.
    pub octaves: u32,
    /// Frequency multiplier between octaves.
    pub lacunarity: f64,
    /// Amplitude multiplier between octaves.
    pub persistence: f64,
    /// Frequency of the first octave in cycles per meter.
    pub base_frequency: f64,
    /// Amplitude of the first octave in meters.
    pub amplitude: f64,
    /// Height the noise oscillates around.
    pub base_height: f64,
}

impl Default for HeightmapParams {
    fn default() -> Self {
        Self {
            seed: 0,
            octaves: 6,
            lacunarity: 2.0,
            persistence: 0.5,
            base_frequency: 0.002,
            amplitude: 128.0,
            base_height: 256.0,
        }
    }
}

impl HeightmapParams {
    /// Parameters whose output stays inside the world's height range.
    pub fn for_world(world: &WorldConfig, seed: u32) -> Self {
        let mut params = Self {
            seed,
            ..Self::default()
        };
        let half_range = (world.max_height as f64 - world.min_height as f64).max(0.0) * 0.5;
        params.base_height = (world.max_height as f64 + world.min_height as f64) * 0.5;
        params.amplitude = half_range / params.amplitude_sum_factor();
        params
    }

    /// `sum(persistence^i)` over all octaves.
    fn amplitude_sum_factor(&self) -> f64 {
        let mut sum = 0.0;
        let mut amp = 1.0;
        for _ in 0..self.octaves {
            sum += amp;
            amp *= self.persistence;
        }
        sum.max(f64::EPSILON)
    }
}

/// Deterministic terrain height field.
pub struct HeightmapSampler {
    noise: Simplex,
    params: HeightmapParams,
}

impl HeightmapSampler {
    pub fn new(params: HeightmapParams) -> Self {
        Self {
            noise: Simplex::new(params.seed),
            params,
        }
    }

    /// Height in meters at world position `(x, y)`.
    pub fn sample(&self, x: f64, y: f64) -> f64 {
        let mut total = 0.0;
        let mut frequency = self.params.base_frequency;
        let mut amplitude = self.params.amplitude;

        for _ in 0..self.params.octaves {
            total += self.noise.get([x * frequency, y * frequency]) * amplitude;
            frequency *= self.params.lacunarity;
            amplitude *= self.params.persistence;
        }

        self.params.base_height + total
    }

    /// Height at a world position given as `Vec2`.
    pub fn height_at(&self, position: Vec2) -> f32 {
        let p = position.as_dvec2();
        self.sample(p.x, p.y) as f32
    }

    /// Central-difference gradient at `position` with step `h` meters.
    pub fn gradient(&self, position: Vec2, h: f32) -> Vec2 {
        let p = position.as_dvec2();
        let h = h.max(1e-3) as f64;
        let dx = self.sample(p.x + h, p.y) - self.sample(p.x - h, p.y);
        let dy = self.sample(p.x, p.y + h) - self.sample(p.x, p.y - h);
        (DVec2::new(dx, dy) / (2.0 * h)).as_vec2()
    }

    /// Largest possible deviation from `base_height`.
    pub fn max_amplitude(&self) -> f64 {
        self.params.amplitude * self.params.amplitude_sum_factor()
    }

    pub fn params(&self) -> &HeightmapParams {
        &self.params
    }
}

impl std::fmt::Debug for HeightmapSampler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HeightmapSampler")
            .field("params", &self.params)
            .finish()
    }
}

/// Height bounds of quadtree nodes, estimated by sampling a grid over each
/// node and widening the result by the largest step seen between neighbours.
#[derive(Debug, Clone)]
pub struct TerrainHeightRange {
    sampler: Arc<HeightmapSampler>,
    world_min: Vec2,
    leaf_node_size: f32,
    samples_per_node: u32,
}

impl TerrainHeightRange {
    pub fn new(
        sampler: Arc<HeightmapSampler>,
        world_min: Vec2,
        leaf_node_size: f32,
        samples_per_node: u32,
    ) -> Self {
        Self {
            sampler,
            world_min,
            leaf_node_size,
            samples_per_node: samples_per_node.max(1),
        }
    }

    pub fn from_config(config: &Config, sampler: Arc<HeightmapSampler>) -> Self {
        Self::new(
            sampler,
            Vec2::from(config.world.origin),
            config.quadtree.leaf_node_size,
            8,
        )
    }
}

impl HeightRangeProvider for TerrainHeightRange {
    fn min_max_height(&self, local_x: u32, local_y: u32, lod_level: u32) -> (f32, f32) {
        let size = self.leaf_node_size * (1u32 << lod_level.min(31)) as f32;
        let origin = self.world_min + Vec2::new(local_x as f32, local_y as f32) * self.leaf_node_size;
        let n = self.samples_per_node;
        let step = size / n as f32;

        let mut min = f32::INFINITY;
        let mut max = f32::NEG_INFINITY;
        let mut max_step = 0.0f32;
        let mut previous_row: Vec<f32> = Vec::with_capacity(n as usize + 1);
        let mut row: Vec<f32> = Vec::with_capacity(n as usize + 1);
        for j in 0..=n {
            row.clear();
            for i in 0..=n {
                let h = self
                    .sampler
                    .height_at(origin + Vec2::new(i as f32, j as f32) * step);
                if let Some(&left) = row.last() {
                    max_step = max_step.max((h - left).abs());
                }
                if let Some(&up) = previous_row.get(i as usize) {
                    max_step = max_step.max((h - up).abs());
                }
                min = min.min(h);
                max = max.max(h);
                row.push(h);
            }
            std::mem::swap(&mut row, &mut previous_row);
        }

        let margin = max_step * 0.5;
        (min - margin, max + margin)
    }
}
