//! Configuration file loading

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::sandbox::SandboxConfig;

/// Top-level `config.toml`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReplboxConfig {
    #[serde(default)]
    pub sandbox: SandboxConfig,
}

/// `~/.replbox`
pub fn replbox_dir() -> Option<PathBuf> {
    dirs::home_dir().map(|home| home.join(".replbox"))
}

/// `~/.replbox/config.toml`
pub fn default_config_path() -> Option<PathBuf> {
    replbox_dir().map(|dir| dir.join("config.toml"))
}

impl ReplboxConfig {
    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse config")
    }

    /// Load from `path`, or from the default location. A missing default
    /// file yields defaults; a missing explicit file is an error.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let (path, explicit) = match path {
            Some(p) => (p.to_path_buf(), true),
            None => match default_config_path() {
                Some(p) => (p, false),
                None => return Ok(Self::default()),
            },
        };

        if !explicit && !path.exists() {
            debug!("No config at {}, using defaults", path.display());
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let config = Self::from_toml(&content)
            .with_context(|| format!("Invalid config file {}", path.display()))?;
        debug!("Loaded config from {}", path.display());
        Ok(config)
    }
}
