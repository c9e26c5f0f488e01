//! Execution policy — resource limits and network access for sandbox containers

use serde::{Deserialize, Serialize};

/// Packages installed into fresh containers unless disabled
pub const DEFAULT_PRE_INSTALL: &[&str] = &["requests", "pandas", "numpy", "beautifulsoup4", "lxml"];

/// Network access for the container
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NetworkMode {
    /// Full network access through the default bridge
    #[default]
    Bridge,
    /// No network interfaces besides loopback
    None,
}

impl NetworkMode {
    /// Value passed to the engine's `NetworkMode` host setting
    pub fn as_docker(self) -> &'static str {
        match self {
            NetworkMode::Bridge => "bridge",
            NetworkMode::None => "none",
        }
    }

    pub fn has_network(self) -> bool {
        self == NetworkMode::Bridge
    }
}

impl std::str::FromStr for NetworkMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "bridge" => Ok(NetworkMode::Bridge),
            "none" => Ok(NetworkMode::None),
            other => Err(format!(
                "unknown network mode '{}' (expected 'bridge' or 'none')",
                other
            )),
        }
    }
}

impl std::fmt::Display for NetworkMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_docker())
    }
}

/// Resource limits for a sandbox container
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceLimits {
    pub memory_mb: u64,
    /// Default per-cell timeout; 0 disables it
    pub timeout_secs: u64,
    pub install_timeout_secs: u64,
    pub network: NetworkMode,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            memory_mb: 1024,
            timeout_secs: 30,
            install_timeout_secs: 600,
            network: NetworkMode::Bridge,
        }
    }
}

impl ResourceLimits {
    pub fn memory_bytes(&self) -> i64 {
        (self.memory_mb as i64).saturating_mul(1024 * 1024)
    }
}

/// Package manager invocation used for installs
pub fn install_command(packages: &[String]) -> Vec<String> {
    let mut cmd = vec![
        "uv".to_string(),
        "pip".to_string(),
        "install".to_string(),
        "--system".to_string(),
    ];
    cmd.extend(packages.iter().cloned());
    cmd
}

/// Check that a package spec is safe to pass as a single argv entry
pub fn is_valid_package_spec(spec: &str) -> bool {
    let spec = spec.trim();
    !spec.is_empty()
        && !spec.starts_with('-')
        && spec.len() <= 256
        && !spec.chars().any(|c| c.is_whitespace() || c.is_control())
}
