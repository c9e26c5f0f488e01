//! Doctor — environment checks before running a sandbox

use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::{info, warn};

use crate::sandbox::engine::resolve_socket_path;
use crate::sandbox::{ContainerRuntime, SandboxConfig};

/// Result of a single health check
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckResult {
    pub name: String,
    pub status: CheckStatus,
    pub message: String,
    pub fix_hint: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckStatus {
    Pass,
    Warn,
    Fail,
    Skip,
}

impl std::fmt::Display for CheckStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CheckStatus::Pass => write!(f, "PASS"),
            CheckStatus::Warn => write!(f, "WARN"),
            CheckStatus::Fail => write!(f, "FAIL"),
            CheckStatus::Skip => write!(f, "SKIP"),
        }
    }
}

impl CheckResult {
    fn new(name: &str, status: CheckStatus, message: String) -> Self {
        Self {
            name: name.to_string(),
            status,
            message,
            fix_hint: None,
        }
    }

    fn with_hint(mut self, hint: impl Into<String>) -> Self {
        self.fix_hint = Some(hint.into());
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DoctorReport {
    pub checks: Vec<CheckResult>,
}

impl DoctorReport {
    pub fn count(&self, status: CheckStatus) -> usize {
        self.checks.iter().filter(|c| c.status == status).count()
    }

    pub fn is_healthy(&self) -> bool {
        self.count(CheckStatus::Fail) == 0
    }

    pub fn summary(&self) -> String {
        format!(
            "{} passed, {} warnings, {} failed, {} skipped",
            self.count(CheckStatus::Pass),
            self.count(CheckStatus::Warn),
            self.count(CheckStatus::Fail),
            self.count(CheckStatus::Skip)
        )
    }
}

/// Run every check against `config` and the given runtime
pub async fn run_doctor(
    config_path: Option<&Path>,
    config: &SandboxConfig,
    runtime: &dyn ContainerRuntime,
) -> DoctorReport {
    info!("Running doctor checks...");
    let checks = vec![
        check_config_file(config_path),
        check_docker_socket(&config.docker_socket),
        check_docker_daemon(runtime).await,
        check_shared_dir(&config.shared_dir),
        check_pre_install(config),
    ];
    let report = DoctorReport { checks };

    if report.is_healthy() {
        info!("Doctor: all checks passed ({})", report.summary());
    } else {
        warn!("Doctor: issues found ({})", report.summary());
    }
    report
}

fn check_config_file(path: Option<&Path>) -> CheckResult {
    match path {
        Some(p) if p.exists() => CheckResult::new(
            "config_file",
            CheckStatus::Pass,
            format!("Config file found: {}", p.display()),
        ),
        Some(p) => CheckResult::new(
            "config_file",
            CheckStatus::Skip,
            format!("No config file at {}, using defaults", p.display()),
        ),
        None => CheckResult::new(
            "config_file",
            CheckStatus::Skip,
            "No config path available".to_string(),
        ),
    }
}

fn check_docker_socket(configured: &str) -> CheckResult {
    let path = resolve_socket_path(configured);
    if path.exists() {
        CheckResult::new(
            "docker_socket",
            CheckStatus::Pass,
            format!("Docker socket: {}", path.display()),
        )
    } else {
        CheckResult::new(
            "docker_socket",
            CheckStatus::Fail,
            format!("Docker socket not found: {}", path.display()),
        )
        .with_hint("Start Docker, or set DOCKER_HOST=unix:///path/to/docker.sock")
    }
}

async fn check_docker_daemon(runtime: &dyn ContainerRuntime) -> CheckResult {
    match runtime.ping().await {
        Ok(()) => CheckResult::new(
            "docker_daemon",
            CheckStatus::Pass,
            "Docker daemon is responding".to_string(),
        ),
        Err(e) => CheckResult::new(
            "docker_daemon",
            CheckStatus::Fail,
            format!("Docker daemon is not reachable: {}", e),
        )
        .with_hint("Start Docker Desktop or run `sudo systemctl start docker`"),
    }
}

fn check_shared_dir(dir: &Path) -> CheckResult {
    let marker = dir.join(".replbox_doctor_test");
    let result = std::fs::create_dir_all(dir).and_then(|_| std::fs::write(&marker, "test"));
    match result {
        Ok(()) => {
            let _ = std::fs::remove_file(&marker);
            CheckResult::new(
                "shared_dir",
                CheckStatus::Pass,
                format!("Shared directory writable: {}", dir.display()),
            )
        }
        Err(e) => CheckResult::new(
            "shared_dir",
            CheckStatus::Fail,
            format!("Shared directory not writable ({}): {}", dir.display(), e),
        )
        .with_hint("Pick another directory with --shared-dir or fix its permissions"),
    }
}

fn check_pre_install(config: &SandboxConfig) -> CheckResult {
    if config.pre_install.is_empty() {
        return CheckResult::new(
            "pre_install",
            CheckStatus::Skip,
            "No packages configured for pre-install".to_string(),
        );
    }
    if !config.network.has_network() {
        return CheckResult::new(
            "pre_install",
            CheckStatus::Warn,
            format!(
                "network = \"{}\", so {} pre-install package(s) will be skipped",
                config.network,
                config.pre_install.len()
            ),
        )
        .with_hint("Set network = \"bridge\" or clear pre_install");
    }
    CheckResult::new(
        "pre_install",
        CheckStatus::Pass,
        format!("Pre-installing: {}", config.pre_install.join(", ")),
    )
}
