//! Streamable HTTP server transport.
//!
//! One endpoint, three methods: POST carries client→server JSON-RPC (single
//! or batch) and answers over a per-request SSE stream, GET opens a
//! standalone listener stream with `Last-Event-ID` replay, DELETE tears the
//! session down. A stateless flavor keeps no cross-request state and
//! refuses session ids.

pub mod service;
pub mod session;

use std::time::Duration;

pub use service::StreamableHttpService;
pub use session::{
    InMemorySessionStore, SessionError, SessionHandle, SessionManager, SessionRecord,
    SessionStore, SseMessage, StreamId,
};

/// Configuration for the streamable HTTP server.
#[derive(Debug, Clone)]
pub struct StreamableHttpServerConfig {
    /// The ping message duration for SSE connections.
    pub sse_keep_alive: Option<Duration>,
    /// If true, the server keeps a session per client across requests.
    /// If false, every POST is served by a fresh, throwaway server
    /// instance and session ids are rejected.
    pub stateful_mode: bool,
    /// Outbound events retained per session for `Last-Event-ID` replay.
    pub history_capacity: usize,
}

impl Default for StreamableHttpServerConfig {
    fn default() -> Self {
        Self {
            sse_keep_alive: Some(Duration::from_secs(15)),
            stateful_mode: true,
            history_capacity: 1000,
        }
    }
}
