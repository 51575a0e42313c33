//! WebSocket transport.
//!
//! One upgrade carries bidirectional JSON-RPC, one message per text frame.
//! Without a session header the connection is its own session, served by a
//! fresh agent. With `mcp-session-id` the socket attaches to an existing
//! streamable session as a duplex stream: inbound frames feed the session,
//! responses to requests that arrived here come back on this socket.
//!
//! Frames that do not parse as JSON-RPC are dropped; runtimes may emit
//! internal state-change broadcasts on the same channel and those must not
//! leak to MCP clients.

use std::sync::Arc;

use axum::{
    Extension,
    extract::{
        State, WebSocketUpgrade,
        ws::{Message, WebSocket},
    },
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
};
use futures::{SinkExt, StreamExt};
use tokio_util::sync::CancellationToken;

use super::{
    SendOptions, Transport, TransportError,
    common::{envelope, session_id},
    streamable_http_server::session::{SessionHandle, SessionManager, SessionStore},
};
use crate::{
    model::JsonRpcMessage,
    service::{McpAgent, Properties, ServeContext, serve_session},
};

pub struct WsService<A, S>
where
    A: McpAgent,
    S: SessionStore,
{
    session_manager: Arc<SessionManager<A, S>>,
    agent_factory: Arc<dyn Fn() -> A + Send + Sync>,
    ct: CancellationToken,
}

impl<A, S> WsService<A, S>
where
    A: McpAgent,
    S: SessionStore,
{
    pub fn new(
        session_manager: Arc<SessionManager<A, S>>,
        agent_factory: Arc<dyn Fn() -> A + Send + Sync>,
        ct: CancellationToken,
    ) -> Self {
        Self {
            session_manager,
            agent_factory,
            ct,
        }
    }

    pub async fn handle_upgrade(
        State(service): State<Arc<Self>>,
        properties: Option<Extension<Properties>>,
        headers: HeaderMap,
        upgrade: WebSocketUpgrade,
    ) -> Response {
        match envelope::session_id_header(&headers) {
            Some(session_id) => {
                let handle = match service.session_manager.ensure(&session_id).await {
                    Ok(handle) => handle,
                    Err(_) => return StatusCode::NOT_FOUND.into_response(),
                };
                if !handle.is_initialized() {
                    return StatusCode::BAD_REQUEST.into_response();
                }
                tracing::debug!(%session_id, "websocket attaching to session");
                upgrade.on_upgrade(move |socket| proxy_session(socket, handle))
            }
            None => {
                let agent = (service.agent_factory)();
                let ct = service.ct.child_token();
                let properties =
                    Arc::new(properties.map(|Extension(p)| p).unwrap_or_default());
                upgrade.on_upgrade(move |socket| async move {
                    let session = session_id();
                    tracing::info!(session_id = %session, "websocket session");
                    let transport = WebSocketTransport::new(socket);
                    let context = ServeContext::fresh(session, properties, ct);
                    if let Err(error) = serve_session(agent, transport, context).await {
                        tracing::warn!(%error, "websocket session terminated");
                    }
                })
            }
        }
    }
}

/// Relay frames between an established session and one socket. The socket
/// is registered as a duplex stream, so responses to requests read here
/// are routed back here.
async fn proxy_session(mut socket: WebSocket, handle: SessionHandle) {
    let Ok((stream_id, mut events)) = handle.open_duplex().await else {
        let _ = socket.send(Message::Close(None)).await;
        return;
    };
    let (mut ws_tx, mut ws_rx) = socket.split();
    loop {
        tokio::select! {
            frame = ws_rx.next() => match frame {
                Some(Ok(Message::Text(text))) => {
                    match serde_json::from_str::<JsonRpcMessage>(text.as_str()) {
                        Ok(message) => {
                            if handle.accept_inbound(stream_id, message).await.is_err() {
                                break;
                            }
                        }
                        Err(_) => {
                            tracing::warn!(session_id = %handle.id(), "dropping non JSON-RPC frame");
                        }
                    }
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(error)) => {
                    tracing::debug!(%error, "websocket read error");
                    break;
                }
            },
            event = events.recv() => match event {
                Some(event) => {
                    let Ok(text) = serde_json::to_string(&event.message) else {
                        continue;
                    };
                    if ws_tx.send(Message::Text(text.into())).await.is_err() {
                        break;
                    }
                }
                None => break,
            }
        }
    }
    tracing::debug!(session_id = %handle.id(), "websocket proxy closed");
}

/// Transport over one upgraded socket, for connections that are their own
/// session.
pub struct WebSocketTransport {
    socket: WebSocket,
    started: bool,
}

impl WebSocketTransport {
    pub fn new(socket: WebSocket) -> Self {
        Self {
            socket,
            started: false,
        }
    }
}

impl Transport for WebSocketTransport {
    type Error = TransportError;

    async fn start(&mut self) -> Result<(), Self::Error> {
        if self.started {
            return Err(TransportError::AlreadyStarted);
        }
        self.started = true;
        Ok(())
    }

    async fn send(
        &mut self,
        message: JsonRpcMessage,
        _options: SendOptions,
    ) -> Result<(), Self::Error> {
        let text = serde_json::to_string(&message)?;
        self.socket
            .send(Message::Text(text.into()))
            .await
            .map_err(TransportError::WebSocket)
    }

    async fn receive(&mut self) -> Option<JsonRpcMessage> {
        loop {
            match self.socket.recv().await {
                Some(Ok(Message::Text(text))) => {
                    match serde_json::from_str::<JsonRpcMessage>(text.as_str()) {
                        Ok(message) => return Some(message),
                        Err(_) => {
                            tracing::warn!("dropping non JSON-RPC frame");
                        }
                    }
                }
                Some(Ok(Message::Close(_))) | None => return None,
                Some(Ok(_)) => {}
                Some(Err(error)) => {
                    tracing::debug!(%error, "websocket read error");
                    return None;
                }
            }
        }
    }

    async fn close(&mut self) -> Result<(), Self::Error> {
        let _ = self.socket.send(Message::Close(None)).await;
        Ok(())
    }
}
