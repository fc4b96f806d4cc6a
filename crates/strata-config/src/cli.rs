//! Command-line argument parsing for the Strata driver.

use std::path::PathBuf;

use clap::Parser;

use crate::Config;

/// Strata command-line arguments.
///
/// CLI values override settings loaded from `config.ron`.
#[derive(Parser, Debug)]
#[command(name = "strata", about = "Headless CDLOD terrain streaming driver")]
pub struct CliArgs {
    /// Number of frames to simulate.
    #[arg(long, default_value_t = 240)]
    pub frames: u32,

    /// Log level (error, warn, info, debug, trace).
    #[arg(long)]
    pub log_level: Option<String>,

    /// Path to config directory (overrides default location).
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Ratio between consecutive LOD visibility ranges.
    #[arg(long)]
    pub lod_ratio: Option<f32>,

    /// Visibility range of LOD 0 in meters.
    #[arg(long)]
    pub initial_lod_distance: Option<f32>,

    /// Background worker threads (0 = auto).
    #[arg(long)]
    pub worker_threads: Option<usize>,
}

impl Config {
    /// Apply CLI overrides to a loaded config.
    pub fn apply_cli_overrides(&mut self, args: &CliArgs) {
        if let Some(ref level) = args.log_level {
            self.debug.log_level = level.clone();
        }
        if let Some(ratio) = args.lod_ratio {
            self.lod.lod_ratio = ratio;
        }
        if let Some(distance) = args.initial_lod_distance {
            self.lod.initial_lod_distance = distance;
        }
        if let Some(threads) = args.worker_threads {
            self.jobs.worker_threads = threads;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn no_overrides() -> CliArgs {
        CliArgs {
            frames: 1,
            log_level: None,
            config: None,
            lod_ratio: None,
            initial_lod_distance: None,
            worker_threads: None,
        }
    }

    #[test]
    fn test_cli_override() {
        let mut config = Config::default();
        let args = CliArgs {
            lod_ratio: Some(3.0),
            log_level: Some("debug".to_string()),
            ..no_overrides()
        };
        config.apply_cli_overrides(&args);
        assert_eq!(config.lod.lod_ratio, 3.0);
        assert_eq!(config.debug.log_level, "debug");
        // Non-overridden fields retain defaults
        assert_eq!(config.lod.initial_lod_distance, 96.0);
        assert_eq!(config.jobs.worker_threads, 0);
    }

    #[test]
    fn test_cli_no_override() {
        let original = Config::default();
        let mut config = Config::default();
        config.apply_cli_overrides(&no_overrides());
        assert_eq!(config, original);
    }

    #[test]
    fn test_cli_parses_flags() {
        let args = CliArgs::try_parse_from([
            "strata",
            "--frames",
            "10",
            "--initial-lod-distance",
            "96",
            "--worker-threads",
            "2",
        ])
        .unwrap();
        assert_eq!(args.frames, 10);
        assert_eq!(args.initial_lod_distance, Some(96.0));
        assert_eq!(args.worker_threads, Some(2));
    }
}
