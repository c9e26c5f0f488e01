//! Docker sandbox — one persistent Python REPL per session
//!
//! [`DockerSandbox`] owns the session container, its workspace volume and the
//! single [`ReplSession`] talking to the execution server inside it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use super::engine::{DEFAULT_DOCKER_SOCKET, DockerEngine, resolve_socket_path};
use super::error::SandboxError;
use super::policy::{
    DEFAULT_PRE_INSTALL, NetworkMode, ResourceLimits, install_command, is_valid_package_spec,
};
use super::protocol::{
    ExecuteCodeResult, InstallPackageResult, SERVER_FILE_NAME, SERVER_SCRIPT, SHARED_DIR,
    WORKSPACE_DIR, truncate_output,
};
use super::runtime::{ContainerRuntime, ContainerSpec};
use super::session::ReplSession;

pub const DEFAULT_IMAGE: &str = "ghcr.io/astral-sh/uv:python3.12-bookworm-slim";

/// Grace period given to `sleep infinity` before the engine kills it
const STOP_TIMEOUT_SECS: u64 = 5;

const SESSION_LABEL: &str = "replbox.session";
const MANAGED_LABEL: &str = "replbox.managed";

/// Configuration for the Docker sandbox
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxConfig {
    #[serde(default = "default_image")]
    pub image: String,
    #[serde(default = "default_docker_socket")]
    pub docker_socket: String,
    /// Prefix for container and volume names
    #[serde(default = "default_name_prefix")]
    pub name_prefix: String,
    #[serde(default)]
    pub network: NetworkMode,
    /// Default per-cell timeout in seconds; 0 disables it
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_memory_mb")]
    pub memory_mb: u64,
    /// Installed right after the container starts. Empty disables.
    #[serde(default = "default_pre_install")]
    pub pre_install: Vec<String>,
    #[serde(default = "default_install_timeout_secs")]
    pub install_timeout_secs: u64,
    /// Host directory mounted at `/shared`
    #[serde(default = "default_shared_dir")]
    pub shared_dir: PathBuf,
}

fn default_image() -> String {
    DEFAULT_IMAGE.to_string()
}

fn default_docker_socket() -> String {
    DEFAULT_DOCKER_SOCKET.to_string()
}

fn default_name_prefix() -> String {
    "replbox".to_string()
}

fn default_timeout_secs() -> u64 {
    ResourceLimits::default().timeout_secs
}

fn default_memory_mb() -> u64 {
    ResourceLimits::default().memory_mb
}

fn default_pre_install() -> Vec<String> {
    DEFAULT_PRE_INSTALL.iter().map(|s| s.to_string()).collect()
}

fn default_install_timeout_secs() -> u64 {
    ResourceLimits::default().install_timeout_secs
}

fn default_shared_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join(".replbox")
        .join("shared")
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            image: default_image(),
            docker_socket: default_docker_socket(),
            name_prefix: default_name_prefix(),
            network: NetworkMode::default(),
            timeout_secs: default_timeout_secs(),
            memory_mb: default_memory_mb(),
            pre_install: default_pre_install(),
            install_timeout_secs: default_install_timeout_secs(),
            shared_dir: default_shared_dir(),
        }
    }
}

impl SandboxConfig {
    pub fn limits(&self) -> ResourceLimits {
        ResourceLimits {
            memory_mb: self.memory_mb,
            timeout_secs: self.timeout_secs,
            install_timeout_secs: self.install_timeout_secs,
            network: self.network,
        }
    }
}

/// Lifecycle of a [`DockerSandbox`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SandboxState {
    Uninitialized,
    Starting,
    Active,
    /// The REPL crashed and could not be restarted
    Failed,
    /// Torn down; build a new instance to run more code
    Stopped,
}

/// Snapshot of a sandbox for status output
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxInfo {
    pub session_id: String,
    pub container: String,
    pub volume: String,
    pub image: String,
    pub network: NetworkMode,
    pub state: SandboxState,
    pub started_at: Option<DateTime<Utc>>,
    pub restarts: u32,
}

/// Check that a session id only uses `[A-Za-z0-9_.-]`, so each id maps to
/// its own container and volume names
pub fn validate_session_id(session_id: &str) -> Result<String, SandboxError> {
    let trimmed = session_id.trim();
    if trimmed.is_empty() {
        return Err(SandboxError::InvalidInput(
            "session id must not be empty".to_string(),
        ));
    }
    if let Some(bad) = trimmed
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-')))
    {
        return Err(SandboxError::InvalidInput(format!(
            "session id {:?} contains {:?}; use letters, digits, '_', '.' or '-'",
            trimmed, bad
        )));
    }
    Ok(trimmed.to_string())
}

pub fn container_name(prefix: &str, session_id: &str) -> String {
    format!("{}-sandbox-{}", prefix, session_id)
}

pub fn volume_name(prefix: &str, session_id: &str) -> String {
    format!("{}-sandbox-ws-{}", prefix, session_id)
}

/// Tar archive holding the execution server, extracted into the workspace
fn server_archive() -> std::io::Result<Vec<u8>> {
    let mut builder = tar::Builder::new(Vec::new());
    let mut header = tar::Header::new_gnu();
    header.set_size(SERVER_SCRIPT.len() as u64);
    header.set_mode(0o644);
    header.set_mtime(Utc::now().timestamp().max(0) as u64);
    header.set_cksum();
    builder.append_data(&mut header, SERVER_FILE_NAME, SERVER_SCRIPT.as_bytes())?;
    builder.into_inner()
}

/// Per-session isolated Python environment
pub struct DockerSandbox {
    session_id: String,
    config: SandboxConfig,
    runtime: Arc<dyn ContainerRuntime>,
    container_name: String,
    volume_name: String,
    repl: Option<ReplSession>,
    state: SandboxState,
    started_at: Option<DateTime<Utc>>,
    restarts: u32,
}

impl DockerSandbox {
    /// Sandbox backed by the local Docker Engine
    pub fn new(session_id: &str, config: SandboxConfig) -> Result<Self, SandboxError> {
        let engine = DockerEngine::new(resolve_socket_path(&config.docker_socket))?;
        Self::with_runtime(session_id, config, Arc::new(engine))
    }

    pub fn with_runtime(
        session_id: &str,
        config: SandboxConfig,
        runtime: Arc<dyn ContainerRuntime>,
    ) -> Result<Self, SandboxError> {
        let session_id = validate_session_id(session_id)?;
        Ok(Self {
            container_name: container_name(&config.name_prefix, &session_id),
            volume_name: volume_name(&config.name_prefix, &session_id),
            session_id,
            config,
            runtime,
            repl: None,
            state: SandboxState::Uninitialized,
            started_at: None,
            restarts: 0,
        })
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn container_name(&self) -> &str {
        &self.container_name
    }

    pub fn volume_name(&self) -> &str {
        &self.volume_name
    }

    pub fn config(&self) -> &SandboxConfig {
        &self.config
    }

    pub fn state(&self) -> SandboxState {
        self.state
    }

    pub fn is_active(&self) -> bool {
        self.state == SandboxState::Active
    }

    pub fn info(&self) -> SandboxInfo {
        SandboxInfo {
            session_id: self.session_id.clone(),
            container: self.container_name.clone(),
            volume: self.volume_name.clone(),
            image: self.config.image.clone(),
            network: self.config.network,
            state: self.state,
            started_at: self.started_at,
            restarts: self.restarts,
        }
    }

    /// Create the container and volume and start the REPL. On failure
    /// everything created so far is torn down before the error is returned.
    pub async fn start(&mut self) -> Result<(), SandboxError> {
        match self.state {
            SandboxState::Uninitialized => {}
            SandboxState::Active => return Ok(()),
            other => {
                return Err(SandboxError::NotInitialized(format!(
                    "sandbox {} cannot be started from state {:?}",
                    self.session_id, other
                )));
            }
        }

        self.state = SandboxState::Starting;
        match self.provision().await {
            Ok(()) => {
                self.state = SandboxState::Active;
                self.started_at = Some(Utc::now());
                info!(
                    "Sandbox {} ready (container={}, network={})",
                    self.session_id, self.container_name, self.config.network
                );
                Ok(())
            }
            Err(e) => {
                warn!("Sandbox {} failed to start: {}", self.session_id, e);
                self.stop().await;
                Err(e)
            }
        }
    }

    async fn provision(&mut self) -> Result<(), SandboxError> {
        self.runtime.ping().await?;

        if self.runtime.remove_container(&self.container_name).await? {
            warn!("Removed stale container: {}", self.container_name);
        }
        if self.runtime.remove_volume(&self.volume_name).await? {
            warn!("Removed stale volume: {}", self.volume_name);
        }

        tokio::fs::create_dir_all(&self.config.shared_dir).await?;
        let shared_dir = tokio::fs::canonicalize(&self.config.shared_dir).await?;

        self.runtime.ensure_image(&self.config.image).await?;
        self.runtime.create_volume(&self.volume_name).await?;

        info!(
            "Creating sandbox container: {} (network={})",
            self.container_name, self.config.network
        );
        info!(
            "Mounting shared directory: {} -> {}",
            shared_dir.display(),
            SHARED_DIR
        );
        let spec = ContainerSpec {
            name: self.container_name.clone(),
            image: self.config.image.clone(),
            command: vec!["sleep".to_string(), "infinity".to_string()],
            working_dir: WORKSPACE_DIR.to_string(),
            volume: self.volume_name.clone(),
            shared_dir,
            shared_mount: SHARED_DIR.to_string(),
            memory_bytes: self.config.limits().memory_bytes(),
            network: self.config.network,
            labels: vec![
                (SESSION_LABEL.to_string(), self.session_id.clone()),
                (MANAGED_LABEL.to_string(), "true".to_string()),
            ],
        };
        let id = self.runtime.run_container(&spec).await?;
        debug!("Container {} has id {}", self.container_name, id);

        if self.config.network.has_network() && !self.config.pre_install.is_empty() {
            self.pre_install().await;
        }

        self.runtime
            .put_archive(&self.container_name, WORKSPACE_DIR, server_archive()?)
            .await?;

        let mut repl = ReplSession::new(self.runtime.clone(), self.container_name.clone());
        repl.start().await?;
        self.repl = Some(repl);
        Ok(())
    }

    /// Failures are logged; a missing package surfaces later as an import error
    async fn pre_install(&self) {
        info!("Pre-installing packages: {:?}", self.config.pre_install);
        let cmd = install_command(&self.config.pre_install);
        match self.runtime.exec_once(&self.container_name, &cmd).await {
            Ok(out) if out.exit_code == 0 => info!("Pre-installed packages successfully"),
            Ok(out) => {
                let text = String::from_utf8_lossy(&out.output);
                let snippet: String = text.chars().take(500).collect();
                warn!(
                    "Package pre-install failed (exit {}): {}",
                    out.exit_code, snippet
                );
            }
            Err(e) => warn!("Package pre-install failed: {}", e),
        }
    }

    /// Run a cell in the persistent REPL. `timeout_secs` defaults to the
    /// configured timeout; 0 means unbounded.
    ///
    /// If the REPL crashes it is restarted once with a fresh namespace and
    /// the call returns a failing result instead of re-running the code.
    pub async fn run_code(
        &mut self,
        code: &str,
        timeout_secs: Option<u64>,
    ) -> Result<ExecuteCodeResult, SandboxError> {
        let timeout_secs = timeout_secs.unwrap_or(self.config.timeout_secs);
        let repl = self.active_repl()?;

        match repl.execute(code, timeout_secs).await {
            Err(SandboxError::ReplCrashed(reason)) => {
                warn!("REPL crashed ({}), restarting", reason);
                self.restart_repl().await
            }
            other => other,
        }
    }

    async fn restart_repl(&mut self) -> Result<ExecuteCodeResult, SandboxError> {
        if let Some(mut dead) = self.repl.take() {
            dead.stop().await;
        }

        let mut repl = ReplSession::new(self.runtime.clone(), self.container_name.clone());
        if let Err(e) = repl.start().await {
            error!("REPL restart failed: {}", e);
            self.state = SandboxState::Failed;
            return Err(SandboxError::NotInitialized(
                "REPL restart failed".to_string(),
            ));
        }
        self.repl = Some(repl);
        self.restarts += 1;

        Ok(ExecuteCodeResult {
            exit_code: 1,
            stdout: String::new(),
            stderr: "REPL process crashed and was restarted. \
                     Variables from previous cells have been lost. \
                     Please re-run any setup code."
                .to_string(),
            duration_ms: 0,
        })
    }

    /// Install packages with a one-shot exec. The REPL namespace is untouched.
    pub async fn run_install(
        &mut self,
        packages: &[String],
    ) -> Result<InstallPackageResult, SandboxError> {
        if packages.is_empty() {
            return Err(SandboxError::InvalidInput(
                "at least one package is required".to_string(),
            ));
        }
        if let Some(bad) = packages.iter().find(|p| !is_valid_package_spec(p)) {
            return Err(SandboxError::InvalidInput(format!(
                "invalid package spec: {:?}",
                bad
            )));
        }
        self.active_repl()?;

        let packages: Vec<String> = packages.iter().map(|p| p.trim().to_string()).collect();
        info!("Installing packages in {}: {:?}", self.container_name, packages);
        let cmd = install_command(&packages);
        let exec = self.runtime.exec_once(&self.container_name, &cmd);

        let limit = self.config.install_timeout_secs;
        let output = if limit > 0 {
            match tokio::time::timeout(Duration::from_secs(limit), exec).await {
                Ok(output) => output?,
                Err(_) => {
                    warn!("Package install timed out after {}s", limit);
                    return Err(SandboxError::Timeout {
                        seconds: limit,
                        result: ExecuteCodeResult {
                            exit_code: 124,
                            stdout: String::new(),
                            stderr: format!("Package install timed out after {} seconds", limit),
                            duration_ms: limit.saturating_mul(1000),
                        },
                    });
                }
            }
        } else {
            exec.await?
        };

        if output.exit_code != 0 {
            warn!("Package install exited with {}", output.exit_code);
        }
        Ok(InstallPackageResult {
            exit_code: output.exit_code,
            output: truncate_output(String::from_utf8_lossy(&output.output).into_owned()),
            packages,
        })
    }

    /// Tear everything down. Never fails; problems are logged.
    pub async fn stop(&mut self) {
        if let Some(mut repl) = self.repl.take() {
            repl.stop().await;
        }
        if matches!(self.state, SandboxState::Uninitialized | SandboxState::Stopped) {
            self.state = SandboxState::Stopped;
            return;
        }

        info!("Destroying sandbox container {}", self.container_name);
        if let Err(e) = self
            .runtime
            .stop_container(&self.container_name, STOP_TIMEOUT_SECS)
            .await
        {
            debug!("Stopping container {} failed: {}", self.container_name, e);
        }
        remove_resources(self.runtime.as_ref(), &self.container_name, &self.volume_name).await;
        self.state = SandboxState::Stopped;
    }

    fn active_repl(&mut self) -> Result<&mut ReplSession, SandboxError> {
        match self.state {
            SandboxState::Active => self
                .repl
                .as_mut()
                .ok_or_else(|| SandboxError::NotInitialized("REPL not initialized".to_string())),
            SandboxState::Failed => Err(SandboxError::NotInitialized(
                "REPL restart failed".to_string(),
            )),
            _ => Err(SandboxError::NotInitialized(
                "sandbox not started".to_string(),
            )),
        }
    }
}

async fn remove_resources(runtime: &dyn ContainerRuntime, container: &str, volume: &str) {
    if let Err(e) = runtime.remove_container(container).await {
        warn!("Failed to remove container {}: {}", container, e);
    }
    if let Err(e) = runtime.remove_volume(volume).await {
        warn!("Failed to remove volume {}: {}", volume, e);
    }
}

impl Drop for DockerSandbox {
    fn drop(&mut self) {
        if matches!(self.state, SandboxState::Uninitialized | SandboxState::Stopped) {
            return;
        }
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            warn!(
                "Sandbox {} dropped without a runtime; container {} left behind",
                self.session_id, self.container_name
            );
            return;
        };
        debug!("Sandbox {} dropped while active, cleaning up", self.session_id);
        let runtime = self.runtime.clone();
        let container = self.container_name.clone();
        let volume = self.volume_name.clone();
        handle.spawn(async move {
            remove_resources(runtime.as_ref(), &container, &volume).await;
        });
    }
}
