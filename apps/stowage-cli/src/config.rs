//! CLI configuration.
//!
//! Configuration is stored as TOML:
//! - Linux: `~/.config/stowage/stowage.toml`
//! - Windows: `%APPDATA%/stowage/stowage.toml`
//!
//! Engine settings live under `[transfer]`:
//!
//! ```toml
//! root = "/srv/objects"
//!
//! [transfer]
//! default_bucket = "backups"
//! part_size = 8388608
//! ```

use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::{Deserialize, Serialize};
use stowage_transfer::TransferConfig;

/// CLI configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Directory served as the object store.
    #[serde(default)]
    pub root: Option<PathBuf>,

    #[serde(default)]
    pub transfer: TransferConfig,
}

impl Config {
    /// Loads `path`, which must exist, or the default file when it does.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let (path, required) = match path {
            Some(path) => (path.to_path_buf(), true),
            None => (config_path(), false),
        };
        if !required && !path.exists() {
            tracing::debug!(path = %path.display(), "no configuration file, using defaults");
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("cannot read {}", path.display()))?;
        let config: Config = toml::from_str(&content)
            .with_context(|| format!("invalid configuration in {}", path.display()))?;
        config.transfer.validate()?;
        tracing::debug!(path = %path.display(), "configuration loaded");
        Ok(config)
    }

    /// Object store directory, defaulting to `<data dir>/objects`.
    pub fn object_root(&self) -> PathBuf {
        self.root
            .clone()
            .unwrap_or_else(|| data_dir().join("objects"))
    }

    /// Engine settings with the record store defaulting to
    /// `<data dir>/transfers.json`, so transfers outlive the process.
    pub fn transfer_config(&self) -> TransferConfig {
        let mut transfer = self.transfer.clone();
        if transfer.store_path.is_none() {
            transfer.store_path = Some(data_dir().join("transfers.json"));
        }
        transfer
    }
}

/// Returns the platform-specific configuration file path.
pub fn config_path() -> PathBuf {
    #[cfg(target_os = "windows")]
    {
        let appdata =
            std::env::var("APPDATA").unwrap_or_else(|_| "C:\\Users\\Default\\AppData".into());
        PathBuf::from(appdata).join("stowage").join("stowage.toml")
    }

    #[cfg(not(target_os = "windows"))]
    {
        home().join(".config").join("stowage").join("stowage.toml")
    }
}

/// Returns the directory holding the record store and default object root.
pub fn data_dir() -> PathBuf {
    #[cfg(target_os = "windows")]
    {
        let appdata =
            std::env::var("APPDATA").unwrap_or_else(|_| "C:\\Users\\Default\\AppData".into());
        PathBuf::from(appdata).join("stowage").join("data")
    }

    #[cfg(not(target_os = "windows"))]
    {
        home().join(".local").join("share").join("stowage")
    }
}

#[cfg(not(target_os = "windows"))]
fn home() -> PathBuf {
    PathBuf::from(std::env::var("HOME").unwrap_or_else(|_| "/tmp".into()))
}
