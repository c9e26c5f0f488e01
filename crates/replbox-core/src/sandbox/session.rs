//! Host-side client for the persistent execution server
//!
//! One [`ReplSession`] owns one exec channel into the container. Requests
//! and responses are strictly 1:1: a request is only written after the
//! previous response has been fully read.

use futures_util::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::error::SandboxError;
use super::frame::StreamKind;
use super::protocol::{
    ExecRequest, ExecResponse, ExecuteCodeResult, SERVER_FILE_NAME, TIMEOUT_EXIT_CODE,
    WORKSPACE_DIR,
};
use super::runtime::{ContainerRuntime, ExecChannel};

/// Extra time the host waits beyond the cell timeout before declaring the
/// server dead
pub const RESPONSE_GRACE: Duration = Duration::from_secs(5);

/// Timeout for the liveness check run right after the channel opens
pub const STARTUP_CHECK_TIMEOUT_SECS: u64 = 10;

/// Cap on a buffered response line; anything longer is treated as a crash
pub const MAX_RESPONSE_LINE_BYTES: usize = 32 * 1024 * 1024;

/// Where a session is in its lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Stopped,
    Starting,
    Ready,
}

/// Command that launches the execution server inside the container
pub fn server_command() -> Vec<String> {
    vec![
        "python".to_string(),
        "-u".to_string(),
        format!("{}/{}", WORKSPACE_DIR, SERVER_FILE_NAME),
    ]
}

/// JSON-line client bound to one container's execution server
pub struct ReplSession {
    runtime: Arc<dyn ContainerRuntime>,
    container: String,
    channel: Option<ExecChannel>,
    /// Bytes of stdout received after the last complete line
    pending: Vec<u8>,
    state: SessionState,
}

impl ReplSession {
    pub fn new(runtime: Arc<dyn ContainerRuntime>, container: impl Into<String>) -> Self {
        Self {
            runtime,
            container: container.into(),
            channel: None,
            pending: Vec::new(),
            state: SessionState::Stopped,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Identifier of the current exec stream, if connected
    pub fn exec_id(&self) -> Option<&str> {
        self.channel.as_ref().map(|c| c.exec_id.as_str())
    }

    /// Launch the server and confirm it answers a no-op request
    pub async fn start(&mut self) -> Result<(), SandboxError> {
        self.state = SessionState::Starting;
        self.pending.clear();

        let channel = match self
            .runtime
            .open_channel(&self.container, &server_command(), WORKSPACE_DIR)
            .await
        {
            Ok(channel) => channel,
            Err(e) => {
                self.state = SessionState::Stopped;
                return Err(e);
            }
        };
        debug!("Opened exec channel {}", channel.exec_id);
        self.channel = Some(channel);
        self.state = SessionState::Ready;

        let check = self.execute("pass", STARTUP_CHECK_TIMEOUT_SECS).await;
        match check {
            Ok(result) if result.exit_code == 0 => {
                info!("Persistent REPL started in {}", self.container);
                Ok(())
            }
            Ok(result) => {
                self.stop().await;
                Err(SandboxError::ReplStartup(result.stderr))
            }
            Err(e) => {
                self.stop().await;
                Err(SandboxError::ReplStartup(e.to_string()))
            }
        }
    }

    /// Run one cell. A 124 reply surfaces as [`SandboxError::Timeout`];
    /// any channel failure surfaces as [`SandboxError::ReplCrashed`].
    pub async fn execute(
        &mut self,
        code: &str,
        timeout_secs: u64,
    ) -> Result<ExecuteCodeResult, SandboxError> {
        if self.state != SessionState::Ready || self.channel.is_none() {
            return Err(SandboxError::NotInitialized("REPL not connected".to_string()));
        }

        let request = ExecRequest {
            code: code.to_string(),
            timeout: timeout_secs,
        };
        let line = request
            .to_line()
            .map_err(|e| SandboxError::InvalidInput(format!("cannot encode request: {}", e)))?;
        self.send(line.as_bytes()).await?;

        let deadline = (timeout_secs > 0)
            .then(|| Instant::now() + Duration::from_secs(timeout_secs) + RESPONSE_GRACE);
        let response = self.recv_response(deadline).await?;

        if response.exit_code == TIMEOUT_EXIT_CODE {
            return Err(SandboxError::Timeout {
                seconds: timeout_secs,
                result: response.into(),
            });
        }
        Ok(response.into())
    }

    /// Close the channel. Errors are ignored; the container may already be gone.
    pub async fn stop(&mut self) {
        if let Some(mut channel) = self.channel.take() {
            if let Err(e) = channel.writer.shutdown().await {
                debug!("Ignoring error while closing exec channel: {}", e);
            }
        }
        self.pending.clear();
        self.state = SessionState::Stopped;
    }

    async fn send(&mut self, data: &[u8]) -> Result<(), SandboxError> {
        let channel = self
            .channel
            .as_mut()
            .ok_or_else(|| SandboxError::NotInitialized("REPL not connected".to_string()))?;
        let written = async {
            channel.writer.write_all(data).await?;
            channel.writer.flush().await
        }
        .await;
        written.map_err(|e| SandboxError::ReplCrashed(format!("REPL write failed: {}", e)))
    }

    /// Read frames until a full stdout line is buffered, then decode it
    async fn recv_response(&mut self, deadline: Option<Instant>) -> Result<ExecResponse, SandboxError> {
        loop {
            if let Some(pos) = self.pending.iter().position(|b| *b == b'\n') {
                let line: Vec<u8> = self.pending.drain(..=pos).collect();
                let text = String::from_utf8_lossy(&line[..pos]);
                let text = text.trim();
                if text.is_empty() {
                    continue;
                }
                return serde_json::from_str(text).map_err(|_| {
                    SandboxError::ReplCrashed(format!(
                        "REPL returned non-JSON: {}",
                        &text[..floor_char_boundary(text, 200)]
                    ))
                });
            }
            if self.pending.len() > MAX_RESPONSE_LINE_BYTES {
                return Err(SandboxError::ReplCrashed(format!(
                    "REPL response exceeded {} bytes",
                    MAX_RESPONSE_LINE_BYTES
                )));
            }

            let channel = self
                .channel
                .as_mut()
                .ok_or_else(|| SandboxError::NotInitialized("REPL not connected".to_string()))?;
            let next = channel.output.next();
            let frame = match deadline {
                Some(deadline) => tokio::time::timeout_at(deadline, next).await.map_err(|_| {
                    SandboxError::ReplCrashed("Timed out waiting for REPL response".to_string())
                })?,
                None => next.await,
            };

            let frame = match frame {
                Some(Ok(frame)) => frame,
                Some(Err(e)) => {
                    return Err(SandboxError::ReplCrashed(format!("stream error: {}", e)));
                }
                None => return Err(SandboxError::ReplCrashed("REPL EOF".to_string())),
            };
            match frame.kind {
                StreamKind::Stdout => self.pending.extend_from_slice(&frame.payload),
                StreamKind::Stderr => {
                    debug!(
                        "REPL stderr: {}",
                        String::from_utf8_lossy(&frame.payload).trim_end()
                    );
                }
                StreamKind::Stdin => {
                    warn!("Unexpected stdin frame from exec stream, ignoring");
                }
            }
        }
    }
}

fn floor_char_boundary(text: &str, max: usize) -> usize {
    if text.len() <= max {
        return text.len();
    }
    let mut cut = max;
    while !text.is_char_boundary(cut) {
        cut -= 1;
    }
    cut
}
