//! Platform directories for the driver: where `config.ron` lives and where
//! debug builds write their JSON log.

use std::path::{Path, PathBuf};

use crate::AppError;

const APP_NAME: &str = "strata";

/// OS-specific directory paths used by the driver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlatformDirs {
    /// Holds `config.ron`.
    pub config_dir: PathBuf,
    /// Log files.
    pub log_dir: PathBuf,
}

impl PlatformDirs {
    /// Resolve directories without creating them on disk.
    ///
    /// `config_override` replaces the platform config directory (the
    /// `--config` flag). Logs go to the platform cache directory, or next to
    /// the config when the OS has none.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::NoConfigDir`] if there is no override and the OS
    /// does not expose a configuration directory.
    pub fn resolve(config_override: Option<&Path>) -> Result<Self, AppError> {
        let config_dir = match config_override {
            Some(dir) => dir.to_path_buf(),
            None => strata_config::default_config_dir().ok_or(AppError::NoConfigDir)?,
        };
        let log_dir = dirs::cache_dir()
            .map(|dir| dir.join(APP_NAME))
            .unwrap_or_else(|| config_dir.clone())
            .join("logs");
        Ok(Self {
            config_dir,
            log_dir,
        })
    }

    /// Resolve directories rooted under a custom base path.
    pub fn resolve_with_root(root: &Path) -> Self {
        let app_dir = root.join(APP_NAME);
        Self {
            config_dir: app_dir.join("config"),
            log_dir: app_dir.join("logs"),
        }
    }

    /// Create all directories on disk.
    pub fn create_dirs(&self) -> Result<(), AppError> {
        std::fs::create_dir_all(&self.config_dir)?;
        std::fs::create_dir_all(&self.log_dir)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_override_replaces_config_dir() {
        let tmp = tempfile::tempdir().unwrap();
        let dirs = PlatformDirs::resolve(Some(tmp.path())).unwrap();
        assert_eq!(dirs.config_dir, tmp.path());
        assert!(dirs.log_dir.ends_with("logs"));
    }

    #[test]
    fn test_directory_creation() {
        let tmp = tempfile::tempdir().unwrap();
        let dirs = PlatformDirs::resolve_with_root(tmp.path());
        dirs.create_dirs().unwrap();
        assert!(dirs.config_dir.exists());
        assert!(dirs.log_dir.exists());
        assert!(dirs.config_dir.starts_with(tmp.path().join(APP_NAME)));
    }
}
