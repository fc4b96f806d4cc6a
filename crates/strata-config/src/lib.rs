//! Configuration system for the Strata terrain streamer.
//!
//! Provides one explicit configuration struct that is constructed once and
//! handed to the quadtree, the virtual textures and the texture cache. Settings
//! persist to disk as RON, support CLI overrides via clap, hot-reload
//! detection, and cross-field validation.

mod cli;
mod config;
mod error;

pub use cli::CliArgs;
pub use config::{
    CameraConfig, Config, DebugConfig, JobsConfig, LodConfig, MAX_LOD_LEVELS,
    MAX_PHYSICAL_TILES_PER_AXIS, QuadtreeConfig, StreamingConfig, VirtualTextureConfig,
    WorldConfig, default_config_dir,
};
pub use error::ConfigError;
