//! Directory layout for qemu-fleet.
//!
//! Provides a single `FleetPaths` struct that resolves the standard per-user
//! directories, following XDG conventions:
//!
//! - Config:  `~/.config/qemu-fleet/`       (holds `fleet.toml`)
//! - Cache:   `~/.cache/qemu-fleet/`        (default scratch root)
//! - Logs:    `~/.local/share/qemu-fleet/logs/`

use std::path::{Path, PathBuf};

use tracing::info;

const APP_NAME: &str = "qemu-fleet";

/// File name of the default configuration inside the config directory.
pub const CONFIG_FILE_NAME: &str = "fleet.toml";

/// All resolved directory paths.
#[derive(Debug, Clone)]
pub struct FleetPaths {
    /// Human-editable config: `~/.config/qemu-fleet/`
    pub config: PathBuf,
    /// Regenerable data; per-VM scratch directories are created here
    pub cache: PathBuf,
    /// Application logs
    pub logs: PathBuf,
}

impl FleetPaths {
    /// Resolve all paths from the user's home directory.
    /// Does not create any directories; call `ensure()` for that.
    pub fn resolve() -> Option<Self> {
        let home = std::env::var("HOME").ok().map(PathBuf::from)?;

        Some(Self {
            config: resolve_config_dir(&home),
            cache: resolve_cache_dir(&home),
            logs: resolve_log_dir(&home),
        })
    }

    /// Path of the default configuration file.
    pub fn config_file(&self) -> PathBuf {
        self.config.join(CONFIG_FILE_NAME)
    }

    /// Create all directories that don't already exist.
    pub fn ensure(&self) -> std::io::Result<()> {
        for dir in [&self.config, &self.cache, &self.logs] {
            std::fs::create_dir_all(dir)?;
            info!("ensured directory: {}", dir.display());
        }
        Ok(())
    }
}

fn resolve_config_dir(home: &Path) -> PathBuf {
    if let Ok(xdg) = std::env::var("XDG_CONFIG_HOME") {
        PathBuf::from(xdg).join(APP_NAME)
    } else {
        home.join(".config").join(APP_NAME)
    }
}

fn resolve_cache_dir(home: &Path) -> PathBuf {
    if let Ok(xdg) = std::env::var("XDG_CACHE_HOME") {
        PathBuf::from(xdg).join(APP_NAME)
    } else {
        home.join(".cache").join(APP_NAME)
    }
}

fn resolve_log_dir(home: &Path) -> PathBuf {
    if let Ok(xdg) = std::env::var("XDG_DATA_HOME") {
        PathBuf::from(xdg).join(APP_NAME).join("logs")
    } else {
        home.join(".local").join("share").join(APP_NAME).join("logs")
    }
}
