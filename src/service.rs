//! The contract between the gateway and application code, plus the serve
//! loop that pumps a [`Transport`] into an agent.
//!
//! An [`McpAgent`] owns one MCP server instance per session. The gateway
//! creates an agent per session (or per connection on the duplex
//! transports), runs [`serve_session`] against it, and enforces the MCP
//! lifecycle: the first message on a fresh session must be `initialize`,
//! and `init` runs exactly once per session lifetime.

use std::{future::Future, sync::Arc};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::{
    error::ErrorData,
    model::{INITIALIZE_METHOD, JsonRpcMessage, JsonRpcNotification, JsonRpcRequest, RequestId},
    transport::{OutboundMessage, SendOptions, Transport, common::SessionId},
};

/// Opaque caller-supplied data attached to a session at initialization,
/// typically authenticated-user claims. Propagated to every invocation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Properties(pub serde_json::Map<String, Value>);

impl Properties {
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn insert(&mut self, key: impl Into<String>, value: Value) -> Option<Value> {
        self.0.insert(key.into(), value)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

#[derive(Debug, thiserror::Error)]
#[error("session channel closed")]
pub struct PeerClosed;

/// Handle for server-initiated traffic back to the client.
///
/// Cloned into every request context; messages flow through the session's
/// outbound routing, so a `related_request_id` pins delivery to the stream
/// carrying that request.
#[derive(Clone)]
pub struct Peer {
    tx: mpsc::Sender<OutboundMessage>,
}

impl Peer {
    pub(crate) fn new(tx: mpsc::Sender<OutboundMessage>) -> Self {
        Self { tx }
    }

    pub async fn send_message(
        &self,
        message: JsonRpcMessage,
        options: SendOptions,
    ) -> Result<(), PeerClosed> {
        self.tx
            .send(OutboundMessage {
                message,
                related_request_id: options.related_request_id,
            })
            .await
            .map_err(|_| PeerClosed)
    }

    pub async fn notify(
        &self,
        method: impl Into<String>,
        params: Option<Value>,
    ) -> Result<(), PeerClosed> {
        self.send_message(
            JsonRpcMessage::notification(method, params),
            SendOptions::default(),
        )
        .await
    }

    /// Notification constrained to the stream carrying `related` (progress
    /// updates during a long-running request).
    pub async fn notify_related(
        &self,
        method: impl Into<String>,
        params: Option<Value>,
        related: RequestId,
    ) -> Result<(), PeerClosed> {
        self.send_message(
            JsonRpcMessage::notification(method, params),
            SendOptions::related_to(related),
        )
        .await
    }
}

pub struct RequestContext {
    pub id: RequestId,
    pub session_id: Option<SessionId>,
    pub properties: Arc<Properties>,
    pub peer: Peer,
    pub ct: CancellationToken,
}

pub struct NotificationContext {
    pub session_id: Option<SessionId>,
    pub properties: Arc<Properties>,
    pub peer: Peer,
}

/// The MCP server instance: answers requests, observes notifications.
pub trait McpService: Send + Sync + 'static {
    fn handle_request(
        &self,
        request: JsonRpcRequest,
        context: RequestContext,
    ) -> impl Future<Output = Result<Value, ErrorData>> + Send;

    fn handle_notification(
        &self,
        _notification: JsonRpcNotification,
        _context: NotificationContext,
    ) -> impl Future<Output = ()> + Send {
        async {}
    }
}

/// One application agent per session.
///
/// `init` is the application hook run exactly once per session lifetime,
/// before the `initialize` request is answered; it does not run again when
/// a hibernated session is restored. `server` exposes the MCP server
/// instance the serve loop dispatches into.
pub trait McpAgent: Send + 'static {
    type Service: McpService;

    fn init(
        &mut self,
        _properties: &Properties,
    ) -> impl Future<Output = Result<(), ErrorData>> + Send {
        async { Ok(()) }
    }

    /// Runs every time a serve loop starts for this agent, including after
    /// a hibernated session is restored.
    fn on_start(&mut self, _session_id: Option<&SessionId>) {}

    fn server(&self) -> &Self::Service;
}

/// Everything the serve loop needs to know about the session it serves.
pub struct ServeContext {
    pub session_id: Option<SessionId>,
    pub properties: Arc<Properties>,
    /// True when restoring a session whose `init` already ran.
    pub already_initialized: bool,
    /// When false, `initialize` is an ordinary request: no init-first gate,
    /// no double-init rejection, no `init` hook. Stateless serving.
    pub track_lifecycle: bool,
    pub ct: CancellationToken,
}

impl ServeContext {
    pub fn fresh(session_id: SessionId, properties: Arc<Properties>, ct: CancellationToken) -> Self {
        Self {
            session_id: Some(session_id),
            properties,
            already_initialized: false,
            track_lifecycle: true,
            ct,
        }
    }

    /// Context for serving without lifecycle tracking.
    pub fn detached(ct: CancellationToken) -> Self {
        Self {
            session_id: None,
            properties: Arc::new(Properties::default()),
            already_initialized: false,
            track_lifecycle: false,
            ct,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ServeError {
    #[error("transport error: {0}")]
    Transport(#[source] Box<dyn std::error::Error + Send + Sync>),
}

fn transport_err<E: std::error::Error + Send + Sync + 'static>(error: E) -> ServeError {
    ServeError::Transport(Box::new(error))
}

/// Pump a transport into an agent until the peer goes away or the session
/// is cancelled.
///
/// Inbound messages are dispatched in arrival order. While a request
/// handler runs, server-initiated messages (progress notifications and the
/// like) are forwarded as they are produced, so a slow tool call does not
/// dam up its own progress stream.
pub async fn serve_session<A, T>(
    mut agent: A,
    mut transport: T,
    context: ServeContext,
) -> Result<(), ServeError>
where
    A: McpAgent,
    T: Transport,
{
    transport.start().await.map_err(transport_err)?;
    let (peer_tx, mut peer_rx) = mpsc::channel::<OutboundMessage>(64);
    let peer = Peer::new(peer_tx);
    agent.on_start(context.session_id.as_ref());

    let mut initialized = context.already_initialized;
    loop {
        let message = tokio::select! {
            biased;
            _ = context.ct.cancelled() => break,
            Some(out) = peer_rx.recv() => {
                forward(&mut transport, out).await?;
                continue;
            }
            message = transport.receive() => message,
        };
        let Some(message) = message else { break };

        match message {
            JsonRpcMessage::Request(request) => {
                let id = request.id.clone();
                let is_initialize =
                    context.track_lifecycle && request.method == INITIALIZE_METHOD;

                if context.track_lifecycle && !initialized && !is_initialize {
                    tracing::warn!(request_id = %id, method = %request.method, "request before initialize");
                    transport
                        .send(
                            JsonRpcMessage::error(
                                Some(id),
                                ErrorData::session_not_found("Session not initialized"),
                            ),
                            SendOptions::default(),
                        )
                        .await
                        .map_err(transport_err)?;
                    continue;
                }
                if initialized && is_initialize {
                    transport
                        .send(
                            JsonRpcMessage::error(
                                Some(id),
                                ErrorData::invalid_request("Server already initialized"),
                            ),
                            SendOptions::default(),
                        )
                        .await
                        .map_err(transport_err)?;
                    continue;
                }
                if is_initialize {
                    if let Err(error) = agent.init(&context.properties).await {
                        tracing::error!(%error, "agent init failed");
                        transport
                            .send(JsonRpcMessage::error(Some(id), error), SendOptions::default())
                            .await
                            .map_err(transport_err)?;
                        continue;
                    }
                    tracing::info!(session_id = ?context.session_id, "session initializing");
                }

                tracing::debug!(request_id = %id, method = %request.method, "handling request");
                let request_context = RequestContext {
                    id: id.clone(),
                    session_id: context.session_id.clone(),
                    properties: context.properties.clone(),
                    peer: peer.clone(),
                    ct: context.ct.child_token(),
                };
                let result = {
                    let fut = agent.server().handle_request(request, request_context);
                    tokio::pin!(fut);
                    // server-initiated messages flush ahead of the response
                    loop {
                        tokio::select! {
                            biased;
                            Some(out) = peer_rx.recv() => {
                                forward(&mut transport, out).await?;
                            }
                            result = &mut fut => break result,
                        }
                    }
                };
                let reply = match result {
                    Ok(value) => {
                        if is_initialize {
                            initialized = true;
                        }
                        JsonRpcMessage::response(id, value)
                    }
                    Err(error) => {
                        tracing::debug!(%error, "request failed");
                        JsonRpcMessage::error(Some(id), error)
                    }
                };
                transport
                    .send(reply, SendOptions::default())
                    .await
                    .map_err(transport_err)?;
            }
            JsonRpcMessage::Notification(notification) => {
                tracing::debug!(method = %notification.method, "handling notification");
                let notification_context = NotificationContext {
                    session_id: context.session_id.clone(),
                    properties: context.properties.clone(),
                    peer: peer.clone(),
                };
                agent
                    .server()
                    .handle_notification(notification, notification_context)
                    .await;
            }
            other => {
                // Client replies to server-initiated requests; nothing is
                // pending for them here.
                tracing::debug!(?other, "dropping unmatched client reply");
            }
        }
    }

    let _ = transport.close().await;
    Ok(())
}

async fn forward<T: Transport>(transport: &mut T, out: OutboundMessage) -> Result<(), ServeError> {
    transport
        .send(
            out.message,
            SendOptions {
                related_request_id: out.related_request_id,
            },
        )
        .await
        .map_err(transport_err)
}
