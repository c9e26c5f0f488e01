//! Docker Engine client
//!
//! Talks to the local daemon with `bollard`. Exec output arrives already
//! demultiplexed and is handed to sessions as [`super::frame::Frame`]s.

use async_trait::async_trait;
use bollard::{
    API_DEFAULT_VERSION, Docker,
    errors::Error as BollardError,
    exec::{StartExecOptions, StartExecResults},
    models::{ContainerCreateBody, ExecConfig, HostConfig, VolumeCreateOptions},
    query_parameters::{
        CreateContainerOptionsBuilder, CreateImageOptionsBuilder, RemoveContainerOptionsBuilder,
        RemoveVolumeOptionsBuilder, StopContainerOptionsBuilder, UploadToContainerOptionsBuilder,
    },
};
use bytes::Bytes;
use futures_util::{StreamExt, TryStreamExt};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

use super::error::SandboxError;
use super::frame::{self, Frame};
use super::runtime::{ContainerRuntime, ContainerSpec, ExecChannel, ExecOutput};

/// Default engine socket on Linux and Docker Desktop
pub const DEFAULT_DOCKER_SOCKET: &str = "/var/run/docker.sock";

/// Timeout for individual engine requests. Attached exec streams are not
/// bounded by it.
const DEFAULT_DOCKER_TIMEOUT_SECS: u64 = 120;

/// How many times to poll a finished exec for its exit code
const EXEC_INSPECT_ATTEMPTS: usize = 40;
const EXEC_INSPECT_INTERVAL: Duration = Duration::from_millis(50);

/// Resolve the engine socket, preferring a `unix://` `DOCKER_HOST`
pub fn resolve_socket_path(configured: &str) -> PathBuf {
    if let Ok(host) = std::env::var("DOCKER_HOST")
        && let Some(path) = host.strip_prefix("unix://")
        && !path.is_empty()
    {
        return PathBuf::from(path);
    }
    PathBuf::from(configured)
}

/// [`ContainerRuntime`] backed by the Docker Engine
pub struct DockerEngine {
    socket_path: PathBuf,
    docker: Docker,
}

impl DockerEngine {
    /// Client for the daemon listening on `socket_path`. Nothing is sent
    /// until the first call.
    pub fn new(socket_path: impl Into<PathBuf>) -> Result<Self, SandboxError> {
        let socket_path = socket_path.into();
        let docker = Docker::connect_with_socket(
            &socket_path.to_string_lossy(),
            DEFAULT_DOCKER_TIMEOUT_SECS,
            API_DEFAULT_VERSION,
        )
        .map_err(|e| SandboxError::Transport {
            operation: "connect",
            message: format!("{} ({})", e, socket_path.display()),
        })?;
        Ok(Self {
            socket_path,
            docker,
        })
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    async fn create_exec(
        &self,
        container: &str,
        cmd: &[String],
        working_dir: Option<&str>,
        attach_stdin: bool,
    ) -> Result<String, SandboxError> {
        let config = ExecConfig {
            attach_stdin: Some(attach_stdin),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            tty: Some(false),
            cmd: Some(cmd.to_vec()),
            working_dir: working_dir.map(str::to_string),
            ..ExecConfig::default()
        };
        let created = self
            .docker
            .create_exec(container, config)
            .await
            .map_err(|e| engine_error("create exec", e))?;
        Ok(created.id)
    }

    async fn start_exec(&self, exec_id: &str) -> Result<ExecChannel, SandboxError> {
        let started = self
            .docker
            .start_exec(
                exec_id,
                Some(StartExecOptions {
                    detach: false,
                    tty: false,
                    ..StartExecOptions::default()
                }),
            )
            .await
            .map_err(|e| engine_error("start exec", e))?;
        match started {
            StartExecResults::Attached { output, input } => Ok(ExecChannel {
                exec_id: exec_id.to_string(),
                output: output
                    .map(|item| {
                        item.map(Frame::from)
                            .map_err(|e| engine_error("exec stream", e))
                    })
                    .boxed(),
                writer: Box::new(input),
            }),
            StartExecResults::Detached => Err(SandboxError::Transport {
                operation: "start exec",
                message: format!("exec {} started detached", exec_id),
            }),
        }
    }

    async fn exec_exit_code(&self, exec_id: &str) -> Result<i64, SandboxError> {
        for _ in 0..EXEC_INSPECT_ATTEMPTS {
            let inspect = self
                .docker
                .inspect_exec(exec_id)
                .await
                .map_err(|e| engine_error("inspect exec", e))?;
            if !inspect.running.unwrap_or(false)
                && let Some(code) = inspect.exit_code
            {
                return Ok(code);
            }
            tokio::time::sleep(EXEC_INSPECT_INTERVAL).await;
        }
        Err(SandboxError::Transport {
            operation: "inspect exec",
            message: format!("exec {} did not report an exit code", exec_id),
        })
    }

    async fn pull_image(&self, image: &str) -> Result<(), SandboxError> {
        let (from_image, tag) = split_image_ref(image);
        let mut options = CreateImageOptionsBuilder::new().from_image(from_image);
        if let Some(tag) = tag {
            options = options.tag(tag);
        }
        info!("Pulling image {}", image);
        self.docker
            .create_image(Some(options.build()), None, None)
            .try_collect::<Vec<_>>()
            .await
            .map_err(|e| engine_error("pull image", e))?;
        Ok(())
    }
}

#[async_trait]
impl ContainerRuntime for DockerEngine {
    async fn ping(&self) -> Result<(), SandboxError> {
        self.docker
            .ping()
            .await
            .map(|_| ())
            .map_err(|e| engine_error("ping", e))
    }

    async fn ensure_image(&self, image: &str) -> Result<(), SandboxError> {
        match self.docker.inspect_image(image).await {
            Ok(_) => Ok(()),
            Err(e) if is_not_found(&e) => self.pull_image(image).await,
            Err(e) => Err(engine_error("inspect image", e)),
        }
    }

    async fn create_volume(&self, name: &str) -> Result<(), SandboxError> {
        let options = VolumeCreateOptions {
            name: Some(name.to_string()),
            labels: Some(HashMap::from([(
                "replbox.managed".to_string(),
                "true".to_string(),
            )])),
            ..VolumeCreateOptions::default()
        };
        self.docker
            .create_volume(options)
            .await
            .map(|_| ())
            .map_err(|e| engine_error("create volume", e))
    }

    async fn remove_volume(&self, name: &str) -> Result<bool, SandboxError> {
        let options = RemoveVolumeOptionsBuilder::new().force(true).build();
        match self.docker.remove_volume(name, Some(options)).await {
            Ok(()) => Ok(true),
            Err(e) if is_not_found(&e) => Ok(false),
            Err(e) => Err(engine_error("remove volume", e)),
        }
    }

    async fn run_container(&self, spec: &ContainerSpec) -> Result<String, SandboxError> {
        let created = self
            .docker
            .create_container(
                Some(CreateContainerOptionsBuilder::new().name(&spec.name).build()),
                container_body(spec),
            )
            .await
            .map_err(|e| engine_error("create container", e))?;

        match self
            .docker
            .start_container(
                &created.id,
                None::<bollard::query_parameters::StartContainerOptions>,
            )
            .await
        {
            Ok(()) => Ok(created.id),
            Err(e) if status_of(&e) == Some(304) => Ok(created.id),
            Err(e) => Err(engine_error("start container", e)),
        }
    }

    async fn stop_container(&self, name: &str, timeout_secs: u64) -> Result<(), SandboxError> {
        let t = i32::try_from(timeout_secs).unwrap_or(i32::MAX);
        let options = StopContainerOptionsBuilder::new().t(t).build();
        match self.docker.stop_container(name, Some(options)).await {
            Ok(()) => Ok(()),
            Err(e) if matches!(status_of(&e), Some(304) | Some(404)) => Ok(()),
            Err(e) => Err(engine_error("stop container", e)),
        }
    }

    async fn remove_container(&self, name: &str) -> Result<bool, SandboxError> {
        let options = RemoveContainerOptionsBuilder::new()
            .force(true)
            .v(true)
            .build();
        match self.docker.remove_container(name, Some(options)).await {
            Ok(()) => Ok(true),
            Err(e) if is_not_found(&e) => Ok(false),
            Err(e) => Err(engine_error("remove container", e)),
        }
    }

    async fn put_archive(
        &self,
        container: &str,
        path: &str,
        archive: Vec<u8>,
    ) -> Result<(), SandboxError> {
        let options = UploadToContainerOptionsBuilder::new().path(path).build();
        self.docker
            .upload_to_container(container, Some(options), bollard::body_full(Bytes::from(archive)))
            .await
            .map_err(|e| engine_error("put archive", e))
    }

    async fn exec_once(&self, container: &str, cmd: &[String]) -> Result<ExecOutput, SandboxError> {
        let exec_id = self.create_exec(container, cmd, None, false).await?;
        let channel = self.start_exec(&exec_id).await?;
        debug!("Running one-shot exec {} in {}", exec_id, container);
        let output = frame::collect_output(channel.output).await?;
        let exit_code = self.exec_exit_code(&exec_id).await?;
        Ok(ExecOutput { exit_code, output })
    }

    async fn open_channel(
        &self,
        container: &str,
        cmd: &[String],
        working_dir: &str,
    ) -> Result<ExecChannel, SandboxError> {
        let exec_id = self
            .create_exec(container, cmd, Some(working_dir), true)
            .await?;
        self.start_exec(&exec_id).await
    }
}

/// Engine payload for creating the session container
fn container_body(spec: &ContainerSpec) -> ContainerCreateBody {
    ContainerCreateBody {
        image: Some(spec.image.clone()),
        cmd: Some(spec.command.clone()),
        working_dir: Some(spec.working_dir.clone()),
        labels: Some(spec.labels.iter().cloned().collect()),
        host_config: Some(HostConfig {
            binds: Some(vec![
                format!("{}:{}:rw", spec.volume, spec.working_dir),
                format!("{}:{}:rw", spec.shared_dir.display(), spec.shared_mount),
            ]),
            memory: Some(spec.memory_bytes),
            network_mode: Some(spec.network.as_docker().to_string()),
            ..HostConfig::default()
        }),
        ..ContainerCreateBody::default()
    }
}

/// Split `repo[:tag]` into the parts the pull endpoint expects. Digests
/// and registry ports are left intact.
fn split_image_ref(image: &str) -> (&str, Option<&str>) {
    if image.contains('@') {
        return (image, None);
    }
    let last_slash = image.rfind('/').map(|i| i + 1).unwrap_or(0);
    match image[last_slash..].rfind(':') {
        Some(i) => {
            let split = last_slash + i;
            (&image[..split], Some(&image[split + 1..]))
        }
        None => (image, None),
    }
}

fn status_of(error: &BollardError) -> Option<u16> {
    match error {
        BollardError::DockerResponseServerError { status_code, .. } => Some(*status_code),
        _ => None,
    }
}

fn is_not_found(error: &BollardError) -> bool {
    status_of(error) == Some(404)
}

/// Daemon answers become [`SandboxError::Api`]; anything else means the
/// daemon could not be reached or the connection broke
fn engine_error(operation: &'static str, error: BollardError) -> SandboxError {
    match error {
        BollardError::DockerResponseServerError {
            status_code,
            message,
        } => SandboxError::Api {
            operation,
            status: status_code,
            message,
        },
        other => SandboxError::Transport {
            operation,
            message: other.to_string(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::policy::NetworkMode;

    fn spec() -> ContainerSpec {
        ContainerSpec {
            name: "replbox-abc".to_string(),
            image: "python:3.12-slim".to_string(),
            command: vec!["sleep".to_string(), "infinity".to_string()],
            working_dir: "/workspace".to_string(),
            volume: "replbox-ws-abc".to_string(),
            shared_dir: PathBuf::from("/tmp/shared"),
            shared_mount: "/shared".to_string(),
            memory_bytes: 1 << 30,
            network: NetworkMode::None,
            labels: vec![("replbox.session".to_string(), "abc".to_string())],
        }
    }

    #[test]
    fn test_container_body() {
        let body = container_body(&spec());
        assert_eq!(body.image.as_deref(), Some("python:3.12-slim"));
        assert_eq!(body.cmd.as_ref().unwrap()[1], "infinity");
        assert_eq!(body.working_dir.as_deref(), Some("/workspace"));
        assert_eq!(
            body.labels.as_ref().unwrap().get("replbox.session").map(String::as_str),
            Some("abc")
        );
        let host = body.host_config.unwrap();
        let binds = host.binds.unwrap();
        assert_eq!(binds[0], "replbox-ws-abc:/workspace:rw");
        assert_eq!(binds[1], "/tmp/shared:/shared:rw");
        assert_eq!(host.memory, Some(1_i64 << 30));
        assert_eq!(host.network_mode.as_deref(), Some("none"));
    }

    #[test]
    fn test_split_image_ref() {
        assert_eq!(
            split_image_ref("python:3.12-slim"),
            ("python", Some("3.12-slim"))
        );
        assert_eq!(
            split_image_ref("ghcr.io/astral-sh/uv:python3.12-bookworm-slim"),
            ("ghcr.io/astral-sh/uv", Some("python3.12-bookworm-slim"))
        );
        assert_eq!(
            split_image_ref("localhost:5000/tools/py"),
            ("localhost:5000/tools/py", None)
        );
        assert_eq!(split_image_ref("alpine"), ("alpine", None));
        assert_eq!(
            split_image_ref("python@sha256:abcd"),
            ("python@sha256:abcd", None)
        );
    }

    #[test]
    fn test_server_errors_become_api_errors() {
        let err = engine_error(
            "create container",
            BollardError::DockerResponseServerError {
                status_code: 409,
                message: "Conflict. The container name is already in use".to_string(),
            },
        );
        match err {
            SandboxError::Api {
                operation,
                status,
                message,
            } => {
                assert_eq!(operation, "create container");
                assert_eq!(status, 409);
                assert!(message.starts_with("Conflict."));
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn test_not_found_detection() {
        let missing = BollardError::DockerResponseServerError {
            status_code: 404,
            message: "No such container".to_string(),
        };
        assert!(is_not_found(&missing));
        let conflict = BollardError::DockerResponseServerError {
            status_code: 409,
            message: "in use".to_string(),
        };
        assert!(!is_not_found(&conflict));
        assert_eq!(status_of(&conflict), Some(409));
    }

    #[tokio::test]
    async fn test_unreachable_socket_is_runtime_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = match DockerEngine::new(dir.path().join("missing.sock")) {
            Ok(engine) => engine.ping().await.unwrap_err(),
            Err(e) => e,
        };
        assert!(err.is_runtime());
    }
}
