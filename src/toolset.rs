//! Tool registry for the bundled MCP server.
//!
//! Applications register named tools with a JSON Schema and an async
//! handler; the session's caller properties travel into every invocation.

use std::{collections::HashMap, future::Future, pin::Pin, sync::Arc};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::service::{Peer, Properties};

/// A tool as advertised by `tools/list`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Tool {
    pub name: String,
    pub description: String,
    pub input_schema: Value,
}

/// Content block of a tool result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Content {
    Text { text: String },
    Image { data: String, mime_type: String },
}

impl Content {
    pub fn text(text: impl Into<String>) -> Self {
        Content::Text { text: text.into() }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ToolError {
    #[error("tool not found: {0}")]
    NotFound(String),
    #[error("invalid parameters: {0}")]
    InvalidParameters(String),
    #[error("execution failed: {0}")]
    Execution(String),
}

/// What a tool invocation can see: the session's caller-supplied
/// properties and a peer handle for progress notifications.
pub struct ToolContext {
    pub properties: Arc<Properties>,
    pub peer: Peer,
}

pub type ToolHandlerFn = Box<
    dyn Fn(Value, ToolContext) -> Pin<Box<dyn Future<Output = Result<Vec<Content>, ToolError>> + Send>>
        + Send
        + Sync,
>;

pub struct ToolSet {
    tool_list: HashMap<String, Tool>,
    tool_handlers: HashMap<String, ToolHandlerFn>,
}

pub struct ToolSetBuilder {
    tool_list: HashMap<String, Tool>,
    tool_handlers: HashMap<String, ToolHandlerFn>,
}

impl ToolSetBuilder {
    pub fn new() -> Self {
        Self {
            tool_list: HashMap::new(),
            tool_handlers: HashMap::new(),
        }
    }

    pub fn add_tool<F, Fut>(mut self, tool: Tool, handler: F) -> Self
    where
        F: Fn(Value, ToolContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Vec<Content>, ToolError>> + Send + 'static,
    {
        let name = tool.name.clone();
        self.tool_list.insert(name.clone(), tool);
        self.tool_handlers.insert(
            name,
            Box::new(move |params, context| Box::pin(handler(params, context))),
        );
        self
    }

    pub fn build(self) -> ToolSet {
        ToolSet {
            tool_list: self.tool_list,
            tool_handlers: self.tool_handlers,
        }
    }
}

impl Default for ToolSetBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ToolSet {
    pub fn builder() -> ToolSetBuilder {
        ToolSetBuilder::new()
    }

    pub fn get_tool(&self, name: &str) -> Option<&Tool> {
        self.tool_list.get(name)
    }

    pub fn list_tools(&self) -> Vec<&Tool> {
        let mut tools: Vec<&Tool> = self.tool_list.values().collect();
        tools.sort_by(|a, b| a.name.cmp(&b.name));
        tools
    }

    pub async fn call_tool(
        &self,
        name: &str,
        arguments: Value,
        context: ToolContext,
    ) -> Result<Vec<Content>, ToolError> {
        let handler = self
            .tool_handlers
            .get(name)
            .ok_or_else(|| ToolError::NotFound(name.to_string()))?;
        (handler)(arguments, context).await
    }
}
