//! A batteries-included [`McpService`]: lifecycle, ping and tool methods
//! backed by a [`ToolSet`]. Applications with richer surfaces implement
//! [`McpService`] themselves.

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::{
    error::ErrorData,
    model::{INITIALIZED_NOTIFICATION_METHOD, JsonRpcNotification, JsonRpcRequest},
    service::{McpService, NotificationContext, RequestContext},
    toolset::{Content, ToolContext, ToolError, ToolSet},
};

/// The protocol revision this server speaks by default.
pub const PROTOCOL_VERSION: &str = "2025-03-26";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerInfo {
    pub name: String,
    pub version: String,
}

impl Default for ServerInfo {
    fn default() -> Self {
        Self {
            name: env!("CARGO_PKG_NAME").to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerCapabilities {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tools: Option<ToolsCapability>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolsCapability {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub list_changed: Option<bool>,
}

pub struct McpServer {
    info: ServerInfo,
    instructions: Option<String>,
    toolset: ToolSet,
}

impl McpServer {
    pub fn new(info: ServerInfo, toolset: ToolSet) -> Self {
        Self {
            info,
            instructions: None,
            toolset,
        }
    }

    pub fn with_instructions(mut self, instructions: impl Into<String>) -> Self {
        self.instructions = Some(instructions.into());
        self
    }

    fn capabilities(&self) -> ServerCapabilities {
        ServerCapabilities {
            tools: Some(ToolsCapability {
                list_changed: None,
            }),
        }
    }

    fn initialize_result(&self, params: Option<&Value>) -> Value {
        // Protocol revisions are dated, so lexicographic order is
        // chronological; meet the client at the older of the two.
        let client_version = params
            .and_then(|params| params.get("protocolVersion"))
            .and_then(Value::as_str);
        let protocol_version = match client_version {
            Some(theirs) if theirs < PROTOCOL_VERSION => theirs,
            _ => PROTOCOL_VERSION,
        };
        let mut result = json!({
            "protocolVersion": protocol_version,
            "capabilities": self.capabilities(),
            "serverInfo": self.info,
        });
        if let Some(instructions) = &self.instructions {
            result["instructions"] = json!(instructions);
        }
        result
    }

    async fn call_tool(&self, params: Option<Value>, context: RequestContext) -> Result<Value, ErrorData> {
        let params = params.unwrap_or(Value::Null);
        let name = params
            .get("name")
            .and_then(Value::as_str)
            .ok_or_else(|| ErrorData::invalid_params("tool name required"))?;
        let arguments = params
            .get("arguments")
            .cloned()
            .unwrap_or_else(|| json!({}));

        let tool_context = ToolContext {
            properties: context.properties.clone(),
            peer: context.peer.clone(),
        };
        match self.toolset.call_tool(name, arguments, tool_context).await {
            Ok(content) => Ok(json!({"content": content, "isError": false})),
            Err(ToolError::NotFound(name)) => {
                Err(ErrorData::invalid_params(format!("unknown tool: {name}")))
            }
            Err(error) => {
                // Tool failures are results, not protocol errors.
                Ok(json!({
                    "content": [Content::text(error.to_string())],
                    "isError": true,
                }))
            }
        }
    }
}

impl McpService for McpServer {
    async fn handle_request(
        &self,
        request: JsonRpcRequest,
        context: RequestContext,
    ) -> Result<Value, ErrorData> {
        match request.method.as_str() {
            "initialize" => Ok(self.initialize_result(request.params.as_ref())),
            "ping" => Ok(json!({})),
            "tools/list" => Ok(json!({"tools": self.toolset.list_tools()})),
            "tools/call" => self.call_tool(request.params, context).await,
            other => Err(ErrorData::method_not_found(other)),
        }
    }

    async fn handle_notification(
        &self,
        notification: JsonRpcNotification,
        _context: NotificationContext,
    ) {
        if notification.method == INITIALIZED_NOTIFICATION_METHOD {
            tracing::debug!("client completed initialization");
        } else {
            tracing::debug!(method = %notification.method, "ignoring notification");
        }
    }
}
