//! Configuration structs with sensible defaults and RON persistence.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Upper bound on the number of quadtree LOD levels.
pub const MAX_LOD_LEVELS: u32 = 15;

/// Page-table records store physical tile coordinates as `u8`.
pub const MAX_PHYSICAL_TILES_PER_AXIS: u32 = 256;

/// Top-level terrain streaming configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    /// World geometry.
    pub world: WorldConfig,
    /// Quadtree geometry.
    pub quadtree: QuadtreeConfig,
    /// LOD distance distribution.
    pub lod: LodConfig,
    /// Camera parameters used by texture-streaming selection.
    pub camera: CameraConfig,
    /// Heightmap/normal virtual texture.
    pub height_texture: VirtualTextureConfig,
    /// Composited material virtual texture.
    pub material_texture: VirtualTextureConfig,
    /// Selection-to-request orchestration.
    pub streaming: StreamingConfig,
    /// Background worker pool.
    pub jobs: JobsConfig,
    /// Debug/development settings.
    pub debug: DebugConfig,
}

/// World rectangle covered by the terrain.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct WorldConfig {
    /// World-space minimum corner (x, y) in meters.
    pub origin: [f32; 2],
    /// World extent (width, height) in meters.
    pub size: [f32; 2],
    /// Lowest possible terrain height in meters.
    pub min_height: f32,
    /// Highest possible terrain height in meters.
    pub max_height: f32,
}

/// Quadtree geometry.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct QuadtreeConfig {
    /// World size of the finest (LOD 0) node in meters.
    pub leaf_node_size: f32,
    /// Number of LOD levels; the top-level node is `leaf * 2^(count-1)`.
    pub lod_level_count: u32,
}

/// LOD distance distribution and selection options.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LodConfig {
    /// Visibility range of LOD 0 in meters.
    pub initial_lod_distance: f32,
    /// Ratio between consecutive LOD visibility ranges.
    pub lod_ratio: f32,
    /// Nothing is selected beyond this distance.
    pub max_visibility_distance: f32,
    /// Fraction of a LOD band at which morphing towards the next level starts.
    pub morph_start_ratio: f32,
    /// Sort selections front to back.
    pub sort_by_distance: bool,
    /// Capacity of the per-frame selection buffer.
    pub max_selected_nodes: usize,
}

/// Camera parameters.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CameraConfig {
    /// Vertical field of view in degrees.
    pub fov_y_degrees: f32,
    /// Render target height in pixels.
    pub screen_height: u32,
}

/// One virtual texture (physical cache + page table).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct VirtualTextureConfig {
    /// Tile edge length in texels, excluding padding.
    pub tile_size: u32,
    /// Border texels on each side of a tile.
    pub tile_padding: u32,
    /// Physical cache width in tiles.
    pub physical_tiles_x: u32,
    /// Physical cache height in tiles.
    pub physical_tiles_y: u32,
    /// Number of virtual mip levels.
    pub mip_levels: u32,
    /// Texel density at mip 0.
    pub texels_per_meter: f32,
    /// Pending requests processed per `update`.
    pub requests_per_frame: usize,
}

/// Selection-to-request orchestration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct StreamingConfig {
    /// Padding in meters added around node footprints for height requests
    /// (neighbouring nodes sample across the border).
    pub height_padding: f32,
    /// Meters removed from node footprints for material requests.
    pub material_shrink: f32,
    /// The cache is ready once outstanding height requests fall below this.
    pub height_ready_threshold: usize,
    /// The cache is ready once outstanding material requests fall below this.
    pub material_ready_threshold: usize,
    /// Added to a node's LOD to get the requested mip.
    pub lod_mip_bias: i32,
}

/// Background worker pool.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct JobsConfig {
    /// Worker threads; 0 picks a count from the available cores.
    pub worker_threads: usize,
    /// Bounded job queue length.
    pub queue_capacity: usize,
}

/// Debug/development configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DebugConfig {
    /// Log level override (e.g., "debug", "info", "warn").
    pub log_level: String,
    /// Keep the last selection instead of re-selecting every frame.
    pub freeze_selection: bool,
}

// --- Default implementations ---

impl Default for WorldConfig {
    fn default() -> Self {
        Self {
            origin: [0.0, 0.0],
            size: [2048.0, 2048.0],
            min_height: 0.0,
            max_height: 512.0,
        }
    }
}

impl Default for QuadtreeConfig {
    fn default() -> Self {
        Self {
            leaf_node_size: 32.0,
            lod_level_count: 6,
        }
    }
}

impl Default for LodConfig {
    fn default() -> Self {
        Self {
            initial_lod_distance: 96.0,
            lod_ratio: 2.0,
            max_visibility_distance: 4096.0,
            morph_start_ratio: 0.66,
            sort_by_distance: true,
            max_selected_nodes: 4096,
        }
    }
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            fov_y_degrees: 60.0,
            screen_height: 1080,
        }
    }
}

impl Default for VirtualTextureConfig {
    fn default() -> Self {
        Self {
            tile_size: 128,
            tile_padding: 2,
            physical_tiles_x: 16,
            physical_tiles_y: 16,
            mip_levels: 6,
            texels_per_meter: 1.0,
            requests_per_frame: 8,
        }
    }
}

impl VirtualTextureConfig {
    /// Defaults for the composited material texture.
    pub fn material_defaults() -> Self {
        Self {
            tile_size: 256,
            tile_padding: 4,
            physical_tiles_x: 16,
            physical_tiles_y: 16,
            mip_levels: 8,
            texels_per_meter: 4.0,
            requests_per_frame: 4,
        }
    }

    /// World meters covered by one mip-0 tile.
    pub fn tile_world_size(&self) -> f32 {
        self.tile_size as f32 / self.texels_per_meter
    }

    fn validate(&self, name: &str) -> Result<(), ConfigError> {
        if self.tile_size == 0 {
            return Err(ConfigError::Invalid(format!("{name}.tile_size must be > 0")));
        }
        if self.physical_tiles_x == 0
            || self.physical_tiles_y == 0
            || self.physical_tiles_x > MAX_PHYSICAL_TILES_PER_AXIS
            || self.physical_tiles_y > MAX_PHYSICAL_TILES_PER_AXIS
        {
            return Err(ConfigError::Invalid(format!(
                "{name}: physical tile grid must be within 1..={MAX_PHYSICAL_TILES_PER_AXIS} per axis"
            )));
        }
        if self.mip_levels == 0 || self.mip_levels > 12 {
            return Err(ConfigError::Invalid(format!(
                "{name}.mip_levels must be within 1..=12"
            )));
        }
        if self.texels_per_meter <= 0.0 {
            return Err(ConfigError::Invalid(format!(
                "{name}.texels_per_meter must be positive"
            )));
        }
        Ok(())
    }
}

impl Default for StreamingConfig {
    fn default() -> Self {
        Self {
            height_padding: 2.0,
            material_shrink: 0.05,
            height_ready_threshold: 4,
            material_ready_threshold: 8,
            lod_mip_bias: 0,
        }
    }
}

impl Default for JobsConfig {
    fn default() -> Self {
        Self {
            worker_threads: 0,
            queue_capacity: 64,
        }
    }
}

impl Default for DebugConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            freeze_selection: false,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            world: WorldConfig::default(),
            quadtree: QuadtreeConfig::default(),
            lod: LodConfig::default(),
            camera: CameraConfig::default(),
            height_texture: VirtualTextureConfig::default(),
            material_texture: VirtualTextureConfig::material_defaults(),
            streaming: StreamingConfig::default(),
            jobs: JobsConfig::default(),
            debug: DebugConfig::default(),
        }
    }
}

/// Platform configuration directory for Strata (`<config_dir>/strata`).
pub fn default_config_dir() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("strata"))
}

// --- Validation ---

impl Config {
    /// Check cross-field invariants that serde cannot express.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.world.size[0] <= 0.0 || self.world.size[1] <= 0.0 {
            return Err(ConfigError::Invalid("world.size must be positive".into()));
        }
        if self.world.max_height < self.world.min_height {
            return Err(ConfigError::Invalid(
                "world.max_height must not be below world.min_height".into(),
            ));
        }
        if self.quadtree.leaf_node_size <= 0.0 {
            return Err(ConfigError::Invalid(
                "quadtree.leaf_node_size must be positive".into(),
            ));
        }
        if self.quadtree.lod_level_count == 0 || self.quadtree.lod_level_count > MAX_LOD_LEVELS {
            return Err(ConfigError::Invalid(format!(
                "quadtree.lod_level_count must be within 1..={MAX_LOD_LEVELS}"
            )));
        }
        if self.lod.initial_lod_distance <= 0.0 || self.lod.lod_ratio < 1.0 {
            return Err(ConfigError::Invalid(
                "lod.initial_lod_distance must be positive and lod.lod_ratio >= 1".into(),
            ));
        }
        if !(self.lod.morph_start_ratio > 0.0 && self.lod.morph_start_ratio < 1.0) {
            return Err(ConfigError::Invalid(
                "lod.morph_start_ratio must be within (0, 1)".into(),
            ));
        }
        if self.lod.max_selected_nodes == 0 {
            return Err(ConfigError::Invalid(
                "lod.max_selected_nodes must be > 0".into(),
            ));
        }
        self.height_texture.validate("height_texture")?;
        self.material_texture.validate("material_texture")?;
        Ok(())
    }

    /// Top-level node edge length in meters.
    pub fn top_node_size(&self) -> f32 {
        self.quadtree.leaf_node_size * (1u32 << (self.quadtree.lod_level_count.max(1) - 1)) as f32
    }
}

// --- Load / Save / Reload ---

const CONFIG_FILE: &str = "config.ron";

impl Config {
    /// Load `config.ron` from `config_dir`, writing the defaults there first
    /// if the file does not exist yet.
    pub fn load_or_create(config_dir: &Path) -> Result<Self, ConfigError> {
        let config_path = config_dir.join(CONFIG_FILE);

        if config_path.exists() {
            let config = Self::read_file(&config_path)?;
            log::info!("Loaded config from {}", config_path.display());
            Ok(config)
        } else {
            let config = Config::default();
            config.save(config_dir)?;
            log::info!("Created default config at {}", config_path.display());
            Ok(config)
        }
    }

    /// Write `config.ron` into `config_dir`, creating the directory.
    pub fn save(&self, config_dir: &Path) -> Result<(), ConfigError> {
        std::fs::create_dir_all(config_dir).map_err(ConfigError::write(config_dir))?;

        let config_path = config_dir.join(CONFIG_FILE);
        let pretty = ron::ser::PrettyConfig::new()
            .depth_limit(3)
            .separate_tuple_members(true)
            .enumerate_arrays(false);
        let serialized = ron::ser::to_string_pretty(self, pretty).map_err(ConfigError::Serialize)?;

        std::fs::write(&config_path, serialized).map_err(ConfigError::write(&config_path))
    }

    /// Re-read `config.ron`. Returns `Some` only when it differs from `self`.
    pub fn reload(&self, config_dir: &Path) -> Result<Option<Self>, ConfigError> {
        let new_config = Self::read_file(&config_dir.join(CONFIG_FILE))?;
        if &new_config == self {
            return Ok(None);
        }
        log::info!("Config reloaded with changes");
        Ok(Some(new_config))
    }

    fn read_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(ConfigError::read(path))?;
        ron::from_str(&contents).map_err(ConfigError::parse(path))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_serializes() {
        let config = Config::default();
        let ron_str =
            ron::ser::to_string_pretty(&config, ron::ser::PrettyConfig::new().depth_limit(3))
                .unwrap();
        assert!(ron_str.contains("leaf_node_size: 32.0"));
        assert!(ron_str.contains("lod_level_count: 6"));
    }

    #[test]
    fn test_config_roundtrip() {
        let config = Config::default();
        let ron_str = ron::to_string(&config).unwrap();
        let deserialized: Config = ron::from_str(&ron_str).unwrap();
        assert_eq!(config, deserialized);
    }

    /// A missing section falls back to the section default, including the
    /// material texture's distinct defaults.
    #[test]
    fn test_missing_field_uses_default() {
        let ron_str = "(world: (), quadtree: (lod_level_count: 4))";
        let config: Config = ron::from_str(ron_str).unwrap();
        assert_eq!(config.quadtree.lod_level_count, 4);
        assert_eq!(config.quadtree.leaf_node_size, 32.0);
        assert_eq!(config.material_texture, VirtualTextureConfig::material_defaults());
    }

    #[test]
    fn test_extra_field_ignored() {
        let result: Result<Config, _> = ron::from_str("(future_setting: true)");
        assert!(result.is_ok());
    }

    #[test]
    fn test_default_config_is_valid() {
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn test_too_many_lod_levels_rejected() {
        let mut config = Config::default();
        config.quadtree.lod_level_count = MAX_LOD_LEVELS + 1;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_physical_grid_limited_by_page_table_record() {
        let mut config = Config::default();
        config.material_texture.physical_tiles_x = 300;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("material_texture"));
    }

    #[test]
    fn test_morph_start_ratio_bounds() {
        let mut config = Config::default();
        config.lod.morph_start_ratio = 1.0;
        assert!(config.validate().is_err());
        config.lod.morph_start_ratio = 0.5;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_top_node_size() {
        let config = Config::default();
        assert_eq!(config.top_node_size(), 1024.0);
    }

    #[test]
    fn test_tile_world_size() {
        let vt = VirtualTextureConfig::material_defaults();
        assert_eq!(vt.tile_world_size(), 64.0);
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.lod.lod_ratio = 2.5;
        config.world.size = [4096.0, 1024.0];

        config.save(dir.path()).unwrap();
        let loaded = Config::load_or_create(dir.path()).unwrap();
        assert_eq!(config, loaded);
    }

    #[test]
    fn test_load_creates_default_file() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::load_or_create(dir.path()).unwrap();
        assert_eq!(config, Config::default());
        assert!(dir.path().join("config.ron").exists());
    }

    #[test]
    fn test_reload_detects_changes() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::default();
        config.save(dir.path()).unwrap();

        let mut modified = config.clone();
        modified.lod.initial_lod_distance = 128.0;
        modified.save(dir.path()).unwrap();

        let result = config.reload(dir.path()).unwrap();
        assert_eq!(result.unwrap().lod.initial_lod_distance, 128.0);
    }

    #[test]
    fn test_reload_no_changes() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::default();
        config.save(dir.path()).unwrap();
        assert!(config.reload(dir.path()).unwrap().is_none());
    }

    #[test]
    fn test_invalid_ron_produces_error() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join(CONFIG_FILE), "{{not valid}}").unwrap();
        match Config::load_or_create(tmp.path()) {
            Err(ConfigError::Parse { path, .. }) => assert!(path.ends_with(CONFIG_FILE)),
            other => panic!("expected a parse error, got {other:?}"),
        }
    }

    /// Reloading a directory without a config file names the missing file.
    #[test]
    fn test_reload_missing_file_is_read_error() {
        let tmp = tempfile::tempdir().unwrap();
        let err = Config::default().reload(tmp.path()).unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
        assert!(err.to_string().contains(CONFIG_FILE));
    }
}
