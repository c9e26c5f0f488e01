//! Docker sandbox — persistent Python REPL sessions in isolated containers
//!
//! Each session gets its own container and workspace volume. Code runs in a
//! long-lived execution server inside the container, so variables and imports
//! survive between calls.

pub mod docker;
pub mod engine;
pub mod error;
pub mod frame;
pub mod policy;
pub mod protocol;
pub mod runtime;
pub mod session;

#[cfg(test)]
pub(crate) mod testing;

pub use docker::{DockerSandbox, SandboxConfig, SandboxInfo, SandboxState};
pub use engine::DockerEngine;
pub use error::SandboxError;
pub use policy::{NetworkMode, ResourceLimits};
pub use protocol::{ExecuteCodeResult, InstallPackageResult};
pub use runtime::ContainerRuntime;
