//! replbox core — persistent Python REPL sandboxes in Docker
//!
//! The [`sandbox`] module manages one container per session and talks to a
//! long-running execution server inside it. [`tools`] wraps a sandbox as
//! agent-callable tools.

pub mod config;
pub mod doctor;
pub mod sandbox;
pub mod tools;

pub use config::ReplboxConfig;
pub use sandbox::{DockerSandbox, SandboxConfig, SandboxError};
