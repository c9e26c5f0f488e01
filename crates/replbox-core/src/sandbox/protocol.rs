//! Wire protocol spoken with the in-container execution server
//!
//! Newline-delimited JSON: one [`ExecRequest`] per line in, one
//! [`ExecResponse`] per line out. The server source ships inside this crate
//! and is written into the container's working directory at startup.

use serde::{Deserialize, Serialize};

/// Source of the in-container execution server
pub const SERVER_SCRIPT: &str = include_str!("repl_server.py");

/// File name of the server inside the working directory
pub const SERVER_FILE_NAME: &str = ".repl_server.py";

/// Persistent working directory inside the container (named volume)
pub const WORKSPACE_DIR: &str = "/workspace";

/// Host/container exchange mount point
pub const SHARED_DIR: &str = "/shared";

/// Maximum bytes kept from each of stdout and stderr
pub const MAX_OUTPUT_BYTES: usize = 1_048_576;

/// Exit code the server reports when a cell exceeds its time budget
pub const TIMEOUT_EXIT_CODE: i64 = 124;

/// Request line sent to the execution server
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecRequest {
    pub code: String,
    /// Seconds; 0 disables the in-container timer
    pub timeout: u64,
}

impl ExecRequest {
    /// Encode as a single protocol line, including the trailing newline
    pub fn to_line(&self) -> Result<String, serde_json::Error> {
        Ok(serde_json::to_string(self)? + "\n")
    }
}

/// Response line produced by the execution server
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecResponse {
    pub exit_code: i64,
    #[serde(default)]
    pub stdout: String,
    #[serde(default)]
    pub stderr: String,
    #[serde(default)]
    pub duration_ms: u64,
}

/// Result of running a code cell
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecuteCodeResult {
    pub exit_code: i64,
    pub stdout: String,
    pub stderr: String,
    pub duration_ms: u64,
}

impl From<ExecResponse> for ExecuteCodeResult {
    fn from(response: ExecResponse) -> Self {
        Self {
            exit_code: response.exit_code,
            stdout: truncate_output(response.stdout),
            stderr: truncate_output(response.stderr),
            duration_ms: response.duration_ms,
        }
    }
}

/// Result of a one-shot package install
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstallPackageResult {
    pub exit_code: i64,
    pub output: String,
    pub packages: Vec<String>,
}

/// Cap a captured stream at [`MAX_OUTPUT_BYTES`] without splitting a UTF-8
/// sequence.
pub fn truncate_output(mut text: String) -> String {
    if text.len() <= MAX_OUTPUT_BYTES {
        return text;
    }
    let mut cut = MAX_OUTPUT_BYTES;
    while !text.is_char_boundary(cut) {
        cut -= 1;
    }
    text.truncate(cut);
    text
}
