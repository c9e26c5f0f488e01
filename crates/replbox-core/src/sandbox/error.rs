//! Sandbox error taxonomy

use super::protocol::ExecuteCodeResult;

/// Errors produced by the sandbox stack
#[derive(Debug, thiserror::Error)]
pub enum SandboxError {
    /// Used before start, after stop, or after an unrecoverable restart
    /// failure. The sandbox must be rebuilt; never retried internally.
    #[error("sandbox not initialized: {0}")]
    NotInitialized(String),

    /// The cell exceeded its time budget. The session is still usable and
    /// the namespace is intact. Carries the server's 124 response.
    #[error("Code execution timed out after {seconds} seconds")]
    Timeout {
        seconds: u64,
        result: ExecuteCodeResult,
    },

    /// The execution channel or server process died unexpectedly
    #[error("REPL crashed: {0}")]
    ReplCrashed(String),

    /// The liveness round trip after opening a channel failed
    #[error("REPL startup failed: {0}")]
    ReplStartup(String),

    /// Another call is already in flight on this sandbox
    #[error("sandbox busy: another call is still running")]
    Busy,

    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// The engine answered with an error status
    #[error("docker {operation} failed ({status}): {message}")]
    Api {
        operation: &'static str,
        status: u16,
        message: String,
    },

    /// The engine could not be reached or the connection broke
    #[error("docker {operation} transport error: {message}")]
    Transport {
        operation: &'static str,
        message: String,
    },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl SandboxError {
    /// True for conditions that require rebuilding the sandbox
    pub fn is_fatal(&self) -> bool {
        matches!(self, SandboxError::NotInitialized(_))
    }

    /// True for failures of the container runtime control plane
    pub fn is_runtime(&self) -> bool {
        matches!(
            self,
            SandboxError::Api { .. } | SandboxError::Transport { .. } | SandboxError::Io(_)
        )
    }
}
