//! Sandbox tools — run code and install packages in a session's REPL

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::{Mutex, MutexGuard};
use tracing::{error, warn};

use crate::sandbox::{DockerSandbox, SandboxError};
use crate::tools::{ToolHandler, json_schema};

/// A sandbox shared by the tools of one session. Calls are single-flight.
pub type SharedSandbox = Arc<Mutex<DockerSandbox>>;

pub fn shared_sandbox(sandbox: DockerSandbox) -> SharedSandbox {
    Arc::new(Mutex::new(sandbox))
}

#[derive(Debug, Deserialize)]
struct ExecuteCodeInput {
    code: String,
}

#[derive(Debug, Deserialize)]
struct InstallPackageInput {
    packages: Vec<String>,
}

fn parse_input<T: serde::de::DeserializeOwned>(input: Value) -> Result<T> {
    serde_json::from_value(input).map_err(|e| anyhow!("Invalid input: {}", e))
}

/// Overlapping calls fail instead of queueing
fn acquire(sandbox: &SharedSandbox) -> Result<MutexGuard<'_, DockerSandbox>, SandboxError> {
    sandbox.try_lock().map_err(|_| SandboxError::Busy)
}

/// Map a sandbox failure to the message returned to the caller
fn tool_error(tool: &str, err: SandboxError) -> anyhow::Error {
    match err {
        SandboxError::InvalidInput(msg) => anyhow!("Invalid input: {}", msg),
        SandboxError::Timeout { .. } => {
            warn!("{}: {}", tool, err);
            anyhow!("{}", err)
        }
        SandboxError::NotInitialized(_) | SandboxError::Busy => {
            error!("{}: {}", tool, err);
            anyhow!("Sandbox error: {}", err)
        }
        other => {
            error!("{} failed: {}", tool, other);
            anyhow!("Runtime error: {} failed, see server logs for details", tool)
        }
    }
}

/// Run Python in the session's persistent REPL
pub struct ExecuteCodeTool {
    sandbox: SharedSandbox,
    description: String,
}

impl ExecuteCodeTool {
    /// `timeout_secs` is the sandbox's default cell timeout, advertised in
    /// the tool description
    pub fn new(sandbox: SharedSandbox, timeout_secs: u64) -> Self {
        Self {
            sandbox,
            description: execute_description(timeout_secs),
        }
    }
}

fn execute_description(timeout_secs: u64) -> String {
    let timeout = if timeout_secs == 0 {
        "none".to_string()
    } else {
        format!("{}s", timeout_secs)
    };
    format!(
        "Execute Python code in an isolated Docker container with persistent state. \
         Variables, imports, and data persist between calls, so there is no need to \
         re-define them. The container has a persistent /workspace directory and a \
         /shared directory for file exchange with the host. Timeout: {}.\n\n\
         Examples:\n  \
         execute_code(code='import numpy as np; data = [1,2,3]; print(np.mean(data))')\n\
         State persists: define variables in one call, use them in the next.",
        timeout
    )
}

#[async_trait]
impl ToolHandler for ExecuteCodeTool {
    fn name(&self) -> &str {
        "execute_code"
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn input_schema(&self) -> Value {
        json_schema(
            serde_json::json!({
                "code": {
                    "type": "string",
                    "description": "Python code to execute"
                }
            }),
            vec!["code"],
        )
    }

    async fn execute(&self, input: Value) -> Result<String> {
        let input: ExecuteCodeInput = parse_input(input)?;
        if input.code.is_empty() {
            return Err(anyhow!("Invalid input: code must not be empty"));
        }

        let mut sandbox = acquire(&self.sandbox).map_err(|e| tool_error(self.name(), e))?;
        let result = sandbox
            .run_code(&input.code, None)
            .await
            .map_err(|e| tool_error(self.name(), e))?;
        Ok(serde_json::to_string(&result)?)
    }
}

/// Install packages into the session's container
pub struct InstallPackageTool {
    sandbox: SharedSandbox,
}

impl InstallPackageTool {
    pub fn new(sandbox: SharedSandbox) -> Self {
        Self { sandbox }
    }
}

#[async_trait]
impl ToolHandler for InstallPackageTool {
    fn name(&self) -> &str {
        "install_package"
    }

    fn description(&self) -> &str {
        "Install Python packages into the sandbox with uv. Installed packages become \
         importable in later execute_code calls; existing variables are kept."
    }

    fn input_schema(&self) -> Value {
        json_schema(
            serde_json::json!({
                "packages": {
                    "type": "array",
                    "items": {"type": "string"},
                    "minItems": 1,
                    "description": "Package names or requirement specs, e.g. ['tabulate', 'scipy>=1.11']"
                }
            }),
            vec!["packages"],
        )
    }

    async fn execute(&self, input: Value) -> Result<String> {
        let input: InstallPackageInput = parse_input(input)?;
        if input.packages.is_empty() {
            return Err(anyhow!("Invalid input: packages must not be empty"));
        }

        let mut sandbox = acquire(&self.sandbox).map_err(|e| tool_error(self.name(), e))?;
        let result = sandbox
            .run_install(&input.packages)
            .await
            .map_err(|e| tool_error(self.name(), e))?;
        Ok(serde_json::to_string(&result)?)
    }
}
