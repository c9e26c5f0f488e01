//! Adapter between the tool registry and MCP tool calls

use serde_json::Value;
use std::sync::Arc;
use tracing::debug;

use replbox_core::tools::ToolExecutor;

use crate::protocol::{McpTool, ToolCallResult};

/// Exposes a [`ToolExecutor`] as MCP tools
pub struct McpToolAdapter {
    executor: Arc<dyn ToolExecutor>,
}

impl McpToolAdapter {
    pub fn new(executor: Arc<dyn ToolExecutor>) -> Self {
        Self { executor }
    }

    pub fn list_tools(&self) -> Vec<McpTool> {
        self.executor
            .list_tools()
            .into_iter()
            .map(|t| McpTool {
                name: t.name,
                description: t.description,
                input_schema: t.input_schema,
            })
            .collect()
    }

    /// Tool failures become `isError` results rather than JSON-RPC errors
    pub async fn call_tool(&self, name: &str, arguments: Value) -> ToolCallResult {
        debug!("MCP calling tool: {}", name);
        match self.executor.execute(name, arguments).await {
            Ok(text) => ToolCallResult::text(text),
            Err(e) => ToolCallResult::error(e.to_string()),
        }
    }
}
