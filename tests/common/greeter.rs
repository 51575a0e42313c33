use serde_json::{Value, json};

use mcp_gateway::{Content, McpAgent, McpServer, ServerInfo, Tool, ToolSet};
use mcp_gateway::toolset::ToolError;

/// Test agent with a handful of tools: `greet` echoes a greeting, `whoami`
/// reads the session's caller properties, `announce` fires an unrelated
/// server notification.
pub struct GreeterAgent {
    server: McpServer,
}

impl McpAgent for GreeterAgent {
    type Service = McpServer;

    fn server(&self) -> &McpServer {
        &self.server
    }
}

pub fn greeter() -> GreeterAgent {
    let toolset = ToolSet::builder()
        .add_tool(
            Tool {
                name: "greet".into(),
                description: "Greets a person by name".into(),
                input_schema: json!({
                    "type": "object",
                    "properties": {"name": {"type": "string"}},
                    "required": ["name"],
                }),
            },
            |params, _context| async move {
                let name = params
                    .get("name")
                    .and_then(Value::as_str)
                    .ok_or_else(|| ToolError::InvalidParameters("name required".into()))?;
                Ok(vec![Content::text(format!("Hello, {name}!"))])
            },
        )
        .add_tool(
            Tool {
                name: "whoami".into(),
                description: "Reports the authenticated user".into(),
                input_schema: json!({"type": "object"}),
            },
            |_params, context| async move {
                let user = context
                    .properties
                    .get("user")
                    .and_then(Value::as_str)
                    .unwrap_or("anonymous")
                    .to_string();
                Ok(vec![Content::text(user)])
            },
        )
        .add_tool(
            Tool {
                name: "announce".into(),
                description: "Broadcasts a server notification".into(),
                input_schema: json!({"type": "object"}),
            },
            |_params, context| async move {
                context
                    .peer
                    .notify(
                        "notifications/message",
                        Some(json!({"level": "info", "data": "announcement"})),
                    )
                    .await
                    .map_err(|e| ToolError::Execution(e.to_string()))?;
                Ok(vec![Content::text("announced")])
            },
        )
        .build();
    GreeterAgent {
        server: McpServer::new(
            ServerInfo {
                name: "greeter".into(),
                version: "0.1.0".into(),
            },
            toolset,
        ),
    }
}
