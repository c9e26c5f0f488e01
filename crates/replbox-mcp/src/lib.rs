//! MCP (Model Context Protocol) server for replbox
//!
//! Exposes a session's sandbox tools to MCP clients over newline-delimited
//! JSON-RPC on stdio.

pub mod adapter;
pub mod protocol;
pub mod server;

pub use adapter::McpToolAdapter;
pub use server::McpServer;
