//! Transport contract and implementations.
//!
//! A transport carries classified JSON-RPC values between one peer and the
//! serve loop. `receive()` yields inbound messages in arrival order and
//! returns `None` once the peer is gone; send-side failures surface as
//! `Err` and never tear the session down by themselves.

use std::future::Future;

use tokio::sync::mpsc;

use crate::model::{JsonRpcMessage, RequestId};

pub mod common;
pub mod sse_server;
pub mod streamable_http_server;
pub mod ws_server;

/// Per-send routing options.
///
/// For server-initiated requests and notifications, `related_request_id`
/// constrains delivery to the stream carrying that inbound request; without
/// it the transport picks any open listener stream, else drops or queues.
#[derive(Debug, Clone, Default)]
pub struct SendOptions {
    pub related_request_id: Option<RequestId>,
}

impl SendOptions {
    pub fn related_to(id: RequestId) -> Self {
        Self {
            related_request_id: Some(id),
        }
    }
}

/// One outbound message together with its routing options.
#[derive(Debug)]
pub struct OutboundMessage {
    pub message: JsonRpcMessage,
    pub related_request_id: Option<RequestId>,
}

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("transport already started")]
    AlreadyStarted,
    #[error("transport closed")]
    Closed,
    #[error("serialize error: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("websocket error: {0}")]
    WebSocket(#[from] axum::Error),
}

pub trait Transport: Send {
    type Error: std::error::Error + Send + Sync + 'static;

    /// Arm the transport. Fails if called twice.
    fn start(&mut self) -> impl Future<Output = Result<(), Self::Error>> + Send;

    /// Serialize and dispatch one message.
    fn send(
        &mut self,
        message: JsonRpcMessage,
        options: SendOptions,
    ) -> impl Future<Output = Result<(), Self::Error>> + Send;

    /// Next inbound message; `None` once the peer side is gone.
    fn receive(&mut self) -> impl Future<Output = Option<JsonRpcMessage>> + Send;

    /// Cease delivery in both directions.
    fn close(&mut self) -> impl Future<Output = Result<(), Self::Error>> + Send;
}

/// The channel-pair transport between a session worker and its serve loop.
///
/// The worker feeds inbound messages into `rx` and routes everything sent
/// through `tx` onto the session's open streams. This is the in-process
/// duplex link the dispatcher uses to reach a session owner. The inbound
/// direction is unbounded so a worker forwarding a batch can never wedge
/// against its own outbound routing.
pub struct SessionTransport {
    rx: mpsc::UnboundedReceiver<JsonRpcMessage>,
    tx: mpsc::Sender<OutboundMessage>,
    started: bool,
}

impl SessionTransport {
    pub fn new(
        rx: mpsc::UnboundedReceiver<JsonRpcMessage>,
        tx: mpsc::Sender<OutboundMessage>,
    ) -> Self {
        Self {
            rx,
            tx,
            started: false,
        }
    }

    /// Build a connected pair: the transport plus the worker-side ends.
    pub fn channel(
        buffer: usize,
    ) -> (
        SessionTransport,
        mpsc::UnboundedSender<JsonRpcMessage>,
        mpsc::Receiver<OutboundMessage>,
    ) {
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let (outbound_tx, outbound_rx) = mpsc::channel(buffer);
        (
            SessionTransport::new(inbound_rx, outbound_tx),
            inbound_tx,
            outbound_rx,
        )
    }
}

impl Transport for SessionTransport {
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
        options: SendOptions,
    ) -> Result<(), Self::Error> {
        self.tx
            .send(OutboundMessage {
                message,
                related_request_id: options.related_request_id,
            })
            .await
            .map_err(|_| TransportError::Closed)
    }

    async fn receive(&mut self) -> Option<JsonRpcMessage> {
        self.rx.recv().await
    }

    async fn close(&mut self) -> Result<(), Self::Error> {
        self.rx.close();
        Ok(())
    }
}
