#![doc = include_str!("../README.md")]

mod error;
pub use error::{ErrorCode, ErrorData, GatewayError};

/// JSON-RPC 2.0 data types
pub mod model;

pub mod dispatcher;
pub mod server;
pub mod service;
pub mod toolset;
pub mod transport;

pub use dispatcher::{CorsConfig, McpGateway, RunningGateway};
pub use server::{McpServer, ServerInfo};
pub use service::{
    McpAgent, McpService, NotificationContext, Peer, Properties, RequestContext, ServeContext,
    serve_session,
};
pub use toolset::{Content, Tool, ToolSet};
pub use transport::{
    SendOptions, Transport,
    streamable_http_server::{
        InMemorySessionStore, SessionManager, SessionStore, StreamableHttpServerConfig,
    },
};
