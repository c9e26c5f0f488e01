//! Container runtime seam
//!
//! Lifecycle and session code only talks to [`ContainerRuntime`]. The
//! production implementation is [`super::engine::DockerEngine`].

use async_trait::async_trait;
use std::path::PathBuf;
use tokio::io::AsyncWrite;

use super::error::SandboxError;
use super::frame::FrameStream;
use super::policy::NetworkMode;

/// Everything needed to create the session container
#[derive(Debug, Clone)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    pub command: Vec<String>,
    pub working_dir: String,
    /// Named volume mounted read-write at `working_dir`
    pub volume: String,
    /// Host directory bind-mounted read-write
    pub shared_dir: PathBuf,
    pub shared_mount: String,
    pub memory_bytes: i64,
    pub network: NetworkMode,
    pub labels: Vec<(String, String)>,
}

/// Output of a one-shot exec
#[derive(Debug, Clone)]
pub struct ExecOutput {
    pub exit_code: i64,
    /// stdout and stderr interleaved in arrival order
    pub output: Vec<u8>,
}

/// A live exec with stdin attached
pub struct ExecChannel {
    pub exec_id: String,
    /// Demultiplexed stdout and stderr
    pub output: FrameStream,
    /// The process's stdin
    pub writer: Box<dyn AsyncWrite + Send + Unpin>,
}

impl std::fmt::Debug for ExecChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecChannel")
            .field("exec_id", &self.exec_id)
            .finish_non_exhaustive()
    }
}

/// Control-plane operations against a local container runtime
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Confirm the daemon is reachable
    async fn ping(&self) -> Result<(), SandboxError>;

    /// Make sure the image is present locally, pulling it if needed
    async fn ensure_image(&self, image: &str) -> Result<(), SandboxError>;

    async fn create_volume(&self, name: &str) -> Result<(), SandboxError>;

    /// Remove a volume. Returns `false` if it did not exist.
    async fn remove_volume(&self, name: &str) -> Result<bool, SandboxError>;

    /// Create and start a detached container, returning its id
    async fn run_container(&self, spec: &ContainerSpec) -> Result<String, SandboxError>;

    async fn stop_container(&self, name: &str, timeout_secs: u64) -> Result<(), SandboxError>;

    /// Force-remove a container. Returns `false` if it did not exist.
    async fn remove_container(&self, name: &str) -> Result<bool, SandboxError>;

    /// Extract a tar archive into `path` inside the container
    async fn put_archive(
        &self,
        container: &str,
        path: &str,
        archive: Vec<u8>,
    ) -> Result<(), SandboxError>;

    /// Run a command to completion without stdin
    async fn exec_once(&self, container: &str, cmd: &[String]) -> Result<ExecOutput, SandboxError>;

    /// Start a long-lived command with stdin attached
    async fn open_channel(
        &self,
        container: &str,
        cmd: &[String],
        working_dir: &str,
    ) -> Result<ExecChannel, SandboxError>;
}
