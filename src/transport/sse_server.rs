//! Legacy SSE server transport.
//!
//! A GET on the SSE path opens the long-lived event stream; the first event
//! is `endpoint` and carries the POST URL for this session. Client→server
//! messages arrive one per POST on that URL, keyed by the `sessionId`
//! query parameter, and are acknowledged with 202 while responses flow
//! back over the event stream.

use std::{collections::HashMap, io, net::SocketAddr, sync::Arc, time::Duration};

use axum::{
    Extension, Router,
    body::Bytes,
    extract::{NestedPath, Query, State},
    http::StatusCode,
    response::{
        IntoResponse, Response,
        sse::{Event, KeepAlive, Sse},
    },
    routing::{get, post},
};
use futures::StreamExt;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use super::{
    SendOptions, Transport, TransportError,
    common::{DEFAULT_AUTO_PING_INTERVAL, SessionId, envelope, session_id},
};
use crate::{
    model::JsonRpcMessage,
    service::{McpAgent, Properties, ServeContext, serve_session},
};

type TxStore =
    Arc<tokio::sync::RwLock<HashMap<SessionId, tokio::sync::mpsc::Sender<JsonRpcMessage>>>>;

#[derive(Debug, Clone)]
pub struct SseServerConfig {
    pub bind: SocketAddr,
    pub sse_path: String,
    pub post_path: String,
    pub ct: CancellationToken,
    pub sse_keep_alive: Option<Duration>,
}

#[derive(Clone)]
struct App {
    txs: TxStore,
    transport_tx: tokio::sync::mpsc::UnboundedSender<SseServerTransport>,
    post_path: Arc<str>,
    sse_ping_interval: Duration,
}

impl App {
    fn new(
        post_path: String,
        sse_ping_interval: Duration,
    ) -> (
        Self,
        tokio::sync::mpsc::UnboundedReceiver<SseServerTransport>,
    ) {
        let (transport_tx, transport_rx) = tokio::sync::mpsc::unbounded_channel();
        (
            Self {
                txs: Default::default(),
                transport_tx,
                post_path: post_path.into(),
                sse_ping_interval,
            },
            transport_rx,
        )
    }
}

#[derive(Debug, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
struct PostEventQuery {
    session_id: String,
}

async fn post_event_handler(
    State(app): State<App>,
    Query(PostEventQuery { session_id }): Query<PostEventQuery>,
    body: Bytes,
) -> Response {
    let message = match envelope::parse_single_message(&body) {
        Ok(message) => message,
        Err(error) => return error.into_response(),
    };
    tracing::debug!(session_id, ?message, "new client message");
    let tx = {
        let rg = app.txs.read().await;
        let Some(tx) = rg.get(session_id.as_str()) else {
            return StatusCode::NOT_FOUND.into_response();
        };
        tx.clone()
    };
    if tx.send(message).await.is_err() {
        tracing::error!(session_id, "send message error");
        return StatusCode::GONE.into_response();
    }
    StatusCode::ACCEPTED.into_response()
}

async fn sse_handler(
    State(app): State<App>,
    nested_path: Option<Extension<NestedPath>>,
    properties: Option<Extension<Properties>>,
) -> Result<Sse<impl futures::Stream<Item = Result<Event, io::Error>>>, Response> {
    let session = session_id();
    tracing::info!(%session, "sse connection");
    let (from_client_tx, from_client_rx) = tokio::sync::mpsc::channel(64);
    let (to_client_tx, to_client_rx) = tokio::sync::mpsc::channel(64);
    let to_client_tx_clone = to_client_tx.clone();

    app.txs
        .write()
        .await
        .insert(session.clone(), from_client_tx);
    let transport = SseServerTransport {
        rx: from_client_rx,
        tx: to_client_tx,
        session_id: session.clone(),
        tx_store: app.txs.clone(),
        properties: Arc::new(properties.map(|Extension(p)| p).unwrap_or_default()),
        started: false,
    };
    if app.transport_tx.send(transport).is_err() {
        tracing::warn!("send transport out error");
        app.txs.write().await.remove(&session);
        return Err((
            StatusCode::INTERNAL_SERVER_ERROR,
            "fail to send out transport, it seems server is closed",
        )
            .into_response());
    }

    let nested_path = nested_path.as_deref().map(NestedPath::as_str).unwrap_or("");
    let post_path = app.post_path.as_ref();
    let endpoint = format!("{nested_path}{post_path}?sessionId={session}");
    let stream = futures::stream::once(futures::future::ok(
        Event::default().event("endpoint").data(endpoint),
    ))
    .chain(ReceiverStream::new(to_client_rx).map(|message| {
        match serde_json::to_string(&message) {
            Ok(bytes) => Ok(Event::default().event("message").data(&bytes)),
            Err(e) => Err(io::Error::new(io::ErrorKind::InvalidData, e)),
        }
    }));

    tokio::spawn(async move {
        to_client_tx_clone.closed().await;
        let mut txs = app.txs.write().await;
        txs.remove(&session);
        tracing::debug!(session_id = %session, "closed session and cleaned up resources");
    });

    Ok(Sse::new(stream).keep_alive(KeepAlive::new().interval(app.sse_ping_interval)))
}

/// The per-connection transport: one SSE stream out, one POST channel in.
pub struct SseServerTransport {
    rx: tokio::sync::mpsc::Receiver<JsonRpcMessage>,
    tx: tokio::sync::mpsc::Sender<JsonRpcMessage>,
    session_id: SessionId,
    tx_store: TxStore,
    properties: Arc<Properties>,
    started: bool,
}

impl SseServerTransport {
    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    /// Caller-supplied claims captured when the event stream was opened.
    pub fn properties(&self) -> &Arc<Properties> {
        &self.properties
    }
}

impl Transport for SseServerTransport {
    type Error = TransportError;

    async fn start(&mut self) -> Result<(), Self::Error> {
        if self.started {
            return Err(TransportError::AlreadyStarted);
        }
        self.started = true;
        Ok(())
    }

    /// All traffic shares the single event stream, so routing options are
    /// irrelevant here.
    async fn send(
        &mut self,
        message: JsonRpcMessage,
        _options: SendOptions,
    ) -> Result<(), Self::Error> {
        self.tx
            .send(message)
            .await
            .map_err(|_| TransportError::Closed)
    }

    async fn receive(&mut self) -> Option<JsonRpcMessage> {
        self.rx.recv().await
    }

    async fn close(&mut self) -> Result<(), Self::Error> {
        self.rx.close();
        self.tx_store.write().await.remove(&self.session_id);
        Ok(())
    }
}

pub struct SseServer {
    transport_rx: tokio::sync::mpsc::UnboundedReceiver<SseServerTransport>,
    pub config: SseServerConfig,
}

impl SseServer {
    pub async fn serve(bind: SocketAddr) -> io::Result<Self> {
        Self::serve_with_config(SseServerConfig {
            bind,
            sse_path: "/sse".to_string(),
            post_path: "/message".to_string(),
            ct: CancellationToken::new(),
            sse_keep_alive: None,
        })
        .await
    }

    pub async fn serve_with_config(mut config: SseServerConfig) -> io::Result<Self> {
        let listener = tokio::net::TcpListener::bind(config.bind).await?;
        // surface the actual bound address when port 0 was requested
        config.bind = listener.local_addr()?;
        let (sse_server, service) = Self::new(config);
        let ct = sse_server.config.ct.child_token();
        let server = axum::serve(listener, service).with_graceful_shutdown(async move {
            ct.cancelled().await;
            tracing::info!("sse server cancelled");
        });
        tokio::spawn(
            async move {
                if let Err(e) = server.await {
                    tracing::error!(error = %e, "sse server shutdown with error");
                }
            }
            .instrument(tracing::info_span!("sse-server", bind_address = %sse_server.config.bind)),
        );
        Ok(sse_server)
    }

    pub fn new(config: SseServerConfig) -> (SseServer, Router) {
        let (app, transport_rx) = App::new(
            config.post_path.clone(),
            config.sse_keep_alive.unwrap_or(DEFAULT_AUTO_PING_INTERVAL),
        );
        let router = Router::new()
            .route(&config.sse_path, get(sse_handler))
            .route(&config.post_path, post(post_event_handler))
            .with_state(app);

        let server = SseServer {
            transport_rx,
            config,
        };

        (server, router)
    }

    /// Serve one agent per inbound connection until cancelled.
    pub fn with_service<A, F>(mut self, agent_provider: F) -> CancellationToken
    where
        A: McpAgent,
        F: Fn() -> A + Send + 'static,
    {
        let ct = self.config.ct.clone();
        tokio::spawn({
            let ct = ct.clone();
            async move {
                while let Some(transport) = self.next_transport().await {
                    let agent = agent_provider();
                    let context = ServeContext::fresh(
                        transport.session_id().clone(),
                        transport.properties().clone(),
                        ct.child_token(),
                    );
                    tokio::spawn(async move {
                        if let Err(error) = serve_session(agent, transport, context).await {
                            tracing::error!(%error, "sse session terminated");
                        }
                    });
                }
            }
        });
        ct
    }

    pub fn cancel(&self) {
        self.config.ct.cancel();
    }

    pub async fn next_transport(&mut self) -> Option<SseServerTransport> {
        tokio::select! {
            transport = self.transport_rx.recv() => transport,
            _ = self.config.ct.cancelled() => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use tokio::time::timeout;

    use super::*;

    fn test_transport() -> (
        SseServerTransport,
        tokio::sync::mpsc::Sender<JsonRpcMessage>,
        tokio::sync::mpsc::Receiver<JsonRpcMessage>,
    ) {
        let (from_client_tx, from_client_rx) = tokio::sync::mpsc::channel(4);
        let (to_client_tx, to_client_rx) = tokio::sync::mpsc::channel(4);
        let transport = SseServerTransport {
            rx: from_client_rx,
            tx: to_client_tx,
            session_id: session_id(),
            tx_store: Default::default(),
            properties: Default::default(),
            started: false,
        };
        (transport, from_client_tx, to_client_rx)
    }

    #[tokio::test]
    async fn test_transport_arms_only_once() {
        let (mut transport, _from_client_tx, _to_client_rx) = test_transport();
        transport.start().await.unwrap();
        assert!(matches!(
            transport.start().await,
            Err(TransportError::AlreadyStarted)
        ));
    }

    #[tokio::test]
    async fn test_close_unregisters_session() {
        let (mut transport, _from_client_tx, _to_client_rx) = test_transport();
        let session = transport.session_id().clone();
        let store = transport.tx_store.clone();
        let (post_tx, _post_rx) = tokio::sync::mpsc::channel(4);
        store.write().await.insert(session.clone(), post_tx);

        transport.start().await.unwrap();
        transport.close().await.unwrap();

        // the POST endpoint must stop resolving this session id
        assert!(!store.read().await.contains_key(&session));
    }

    #[tokio::test]
    async fn test_transport_round_trip() {
        let (mut transport, from_client_tx, mut to_client_rx) = test_transport();
        transport.start().await.unwrap();

        transport
            .send(
                JsonRpcMessage::response(1.into(), serde_json::json!({})),
                SendOptions::default(),
            )
            .await
            .unwrap();
        let sent = timeout(Duration::from_millis(100), to_client_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(sent, JsonRpcMessage::Response(_)));

        from_client_tx
            .send(JsonRpcMessage::notification("notifications/initialized", None))
            .await
            .unwrap();
        drop(from_client_tx);
        let received = timeout(Duration::from_millis(100), transport.receive())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(received, JsonRpcMessage::Notification(_)));
    }

    #[tokio::test]
    async fn test_post_event_handler_session_not_found() {
        let (app, _transport_rx) = App::new("/message".to_string(), Duration::from_secs(15));

        let query = PostEventQuery {
            session_id: "non-existent".to_string(),
        };
        let body = Bytes::from(
            serde_json::to_vec(&JsonRpcMessage::notification(
                "notifications/initialized",
                None,
            ))
            .unwrap(),
        );

        let response = post_event_handler(State(app), Query(query), body).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_post_event_handler_rejects_bad_json() {
        let (app, _transport_rx) = App::new("/message".to_string(), Duration::from_secs(15));
        let query = PostEventQuery {
            session_id: "whatever".to_string(),
        };
        let response =
            post_event_handler(State(app), Query(query), Bytes::from_static(b"{oops")).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_cancellation_stops_accepting_transports() {
        let (mut sse_server, router) = SseServer::new(SseServerConfig {
            bind: "127.0.0.1:0".parse().unwrap(),
            sse_path: "/events".to_string(),
            post_path: "/rpc".to_string(),
            ct: CancellationToken::new(),
            sse_keep_alive: None,
        });

        // the router (and with it the accept channel) stays alive, so only
        // the token can end the accept loop
        sse_server.config.ct.cancel();
        let accepted = timeout(Duration::from_millis(100), sse_server.next_transport())
            .await
            .expect("next_transport must resolve once cancelled");
        assert!(accepted.is_none());
        drop(router);
    }
}
