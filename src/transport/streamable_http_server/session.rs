//! Session management for the Streamable HTTP transport.
//!
//! A *session* groups the logically related interactions between a single
//! MCP client and the server, starting from the `initialize` handshake. All
//! mutable session state — the request-origin table, the event history and
//! the set of open streams — is owned by one worker task per session;
//! HTTP handlers talk to it through a [`SessionHandle`] and never touch the
//! state directly, so no locking is involved within a session.
//!
//! Sessions survive worker eviction: `(properties, initialized)` live in a
//! [`SessionStore`], and a request naming a hibernated session id gets a
//! fresh worker restored from the stored record. Streams and history are
//! not restored; clients reconnect and replay via `Last-Event-ID`.

use std::{
    collections::{HashMap, HashSet, VecDeque},
    future::Future,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use tokio::sync::{RwLock, mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use crate::{
    error::ErrorData,
    model::{JsonRpcMessage, RequestId},
    service::{McpAgent, Properties, ServeContext, serve_session},
    transport::{
        OutboundMessage, SessionTransport,
        common::{SessionId, session_id},
    },
};

/// Identifies one open outbound stream within a session.
pub type StreamId = u64;

/// One outbound server-sent event: the message plus the monotonic id
/// clients use to reconnect.
#[derive(Debug, Clone)]
pub struct SseMessage {
    pub event_id: Option<u64>,
    pub message: JsonRpcMessage,
}

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("session not found")]
    NotFound,
    #[error("session not initialized")]
    NotInitialized,
    #[error("session already initialized")]
    AlreadyInitialized,
    #[error("duplicate request id: {0}")]
    DuplicateRequestId(RequestId),
    #[error("initialize payload must be a request")]
    ExpectedRequest,
    #[error("session closed")]
    Closed,
}

impl SessionError {
    /// The JSON-RPC error this failure surfaces as.
    pub fn to_error_data(&self) -> ErrorData {
        match self {
            SessionError::NotFound => ErrorData::session_not_found("Session not found"),
            SessionError::NotInitialized => {
                ErrorData::session_not_found("Session not initialized")
            }
            SessionError::AlreadyInitialized => {
                ErrorData::invalid_request("Server already initialized")
            }
            SessionError::DuplicateRequestId(id) => {
                ErrorData::invalid_request(format!("duplicate request id: {id}"))
            }
            SessionError::ExpectedRequest => {
                ErrorData::invalid_request("initialize payload must be a request")
            }
            SessionError::Closed => ErrorData::session_not_found("Session closed"),
        }
    }
}

/// Where an event was delivered, for replay filtering.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StreamHint {
    /// The standalone listener stream; replayed to reconnecting listeners.
    Listener,
    /// A request-scoped or duplex stream; never replayed elsewhere.
    Stream(StreamId),
}

struct HistoryEntry {
    event_id: u64,
    message: JsonRpcMessage,
    hint: Option<StreamHint>,
}

/// Bounded, monotonic outbound event log.
struct EventHistory {
    entries: VecDeque<HistoryEntry>,
    capacity: usize,
    next_event_id: u64,
}

impl EventHistory {
    fn new(capacity: usize) -> Self {
        Self {
            entries: VecDeque::new(),
            capacity,
            next_event_id: 1,
        }
    }

    fn record(&mut self, message: &JsonRpcMessage, hint: Option<StreamHint>) -> u64 {
        let event_id = self.next_event_id;
        self.next_event_id += 1;
        if self.capacity > 0 {
            if self.entries.len() == self.capacity {
                self.entries.pop_front();
            }
            self.entries.push_back(HistoryEntry {
                event_id,
                message: message.clone(),
                hint,
            });
        }
        event_id
    }

    /// Events a reconnecting listener missed: id strictly greater than
    /// `after`, destined for a listener stream or never delivered.
    fn replay_for_listener(&self, after: u64) -> Vec<SseMessage> {
        self.entries
            .iter()
            .filter(|entry| {
                entry.event_id > after
                    && !matches!(entry.hint, Some(StreamHint::Stream(_)))
            })
            .map(|entry| SseMessage {
                event_id: Some(entry.event_id),
                message: entry.message.clone(),
            })
            .collect()
    }
}

enum StreamKind {
    /// Opened by a POST; closes once every request it carried is answered.
    Request { outstanding: HashSet<RequestId> },
    /// Standalone GET listener; at most one, replaced on reconnect.
    Listener,
    /// Bidirectional attachment (WebSocket); stays open until the peer goes.
    Duplex,
}

struct StreamEntry {
    tx: mpsc::Sender<SseMessage>,
    kind: StreamKind,
}

pub(crate) enum SessionCommand {
    Initialize {
        message: JsonRpcMessage,
        reply: oneshot::Sender<Result<mpsc::Receiver<SseMessage>, SessionError>>,
    },
    OpenRequestStream {
        messages: Vec<JsonRpcMessage>,
        reply: oneshot::Sender<Result<mpsc::Receiver<SseMessage>, SessionError>>,
    },
    AcceptMessages {
        messages: Vec<JsonRpcMessage>,
        reply: oneshot::Sender<Result<(), SessionError>>,
    },
    OpenListener {
        last_event_id: Option<u64>,
        reply: oneshot::Sender<Result<mpsc::Receiver<SseMessage>, SessionError>>,
    },
    OpenDuplex {
        reply: oneshot::Sender<Result<(StreamId, mpsc::Receiver<SseMessage>), SessionError>>,
    },
    AcceptInbound {
        stream_id: StreamId,
        message: JsonRpcMessage,
        reply: oneshot::Sender<Result<(), SessionError>>,
    },
    Terminate {
        reply: oneshot::Sender<()>,
    },
}

const STREAM_CHANNEL_CAPACITY: usize = 64;

struct SessionWorker<S: SessionStore> {
    id: SessionId,
    properties: Arc<Properties>,
    initialized: bool,
    initialized_flag: Arc<AtomicBool>,
    init_request_id: Option<RequestId>,
    to_service: mpsc::UnboundedSender<JsonRpcMessage>,
    request_origin: HashMap<RequestId, StreamId>,
    streams: HashMap<StreamId, StreamEntry>,
    listener: Option<StreamId>,
    history: EventHistory,
    next_stream_id: StreamId,
    store: Arc<S>,
    ct: CancellationToken,
}

impl<S: SessionStore> SessionWorker<S> {
    async fn run(
        mut self,
        mut commands: mpsc::Receiver<SessionCommand>,
        mut from_service: mpsc::Receiver<OutboundMessage>,
    ) {
        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(SessionCommand::Terminate { reply }) => {
                        let _ = reply.send(());
                        break;
                    }
                    Some(command) => self.handle_command(command).await,
                    None => break,
                },
                outbound = from_service.recv() => match outbound {
                    Some(outbound) => self.route_outbound(outbound).await,
                    None => {
                        tracing::debug!(session_id = %self.id, "session service ended");
                        break;
                    }
                },
                _ = self.ct.cancelled() => break,
            }
        }
        self.streams.clear();
        self.request_origin.clear();
        self.ct.cancel();
        tracing::debug!(session_id = %self.id, "session worker stopped");
    }

    async fn handle_command(&mut self, command: SessionCommand) {
        match command {
            SessionCommand::Initialize { message, reply } => {
                let _ = reply.send(self.handle_initialize(message).await);
            }
            SessionCommand::OpenRequestStream { messages, reply } => {
                let _ = reply.send(self.handle_open_request_stream(messages).await);
            }
            SessionCommand::AcceptMessages { messages, reply } => {
                let _ = reply.send(self.handle_accept_messages(messages).await);
            }
            SessionCommand::OpenListener {
                last_event_id,
                reply,
            } => {
                let _ = reply.send(self.handle_open_listener(last_event_id));
            }
            SessionCommand::OpenDuplex { reply } => {
                let _ = reply.send(self.handle_open_duplex());
            }
            SessionCommand::AcceptInbound {
                stream_id,
                message,
                reply,
            } => {
                let _ = reply.send(self.handle_accept_inbound(stream_id, message).await);
            }
            SessionCommand::Terminate { .. } => unreachable!("handled in run"),
        }
    }

    fn alloc_stream_id(&mut self) -> StreamId {
        let id = self.next_stream_id;
        self.next_stream_id += 1;
        id
    }

    fn open_stream(
        &mut self,
        kind: StreamKind,
        capacity: usize,
    ) -> (StreamId, mpsc::Receiver<SseMessage>) {
        let (tx, rx) = mpsc::channel(capacity);
        let stream_id = self.alloc_stream_id();
        self.streams.insert(stream_id, StreamEntry { tx, kind });
        (stream_id, rx)
    }

    fn remove_stream(&mut self, stream_id: StreamId) {
        if self.streams.remove(&stream_id).is_some() {
            if self.listener == Some(stream_id) {
                self.listener = None;
            }
            // correlations die with their origin stream
            self.request_origin.retain(|_, origin| *origin != stream_id);
        }
    }

    fn stream_alive(&self, stream_id: StreamId) -> bool {
        self.streams
            .get(&stream_id)
            .is_some_and(|entry| !entry.tx.is_closed())
    }

    fn stream_hint(&self, stream_id: StreamId) -> Option<StreamHint> {
        match self.streams.get(&stream_id).map(|entry| &entry.kind) {
            Some(StreamKind::Listener) => Some(StreamHint::Listener),
            Some(_) => Some(StreamHint::Stream(stream_id)),
            None => None,
        }
    }

    /// Target for traffic not pinned to a request stream.
    fn fallback_stream(&self) -> Option<StreamId> {
        if let Some(stream_id) = self.listener
            && self.stream_alive(stream_id)
        {
            return Some(stream_id);
        }
        self.streams
            .iter()
            .find(|(_, entry)| matches!(entry.kind, StreamKind::Duplex) && !entry.tx.is_closed())
            .map(|(stream_id, _)| *stream_id)
    }

    async fn handle_initialize(
        &mut self,
        message: JsonRpcMessage,
    ) -> Result<mpsc::Receiver<SseMessage>, SessionError> {
        if self.initialized || self.init_request_id.is_some() {
            return Err(SessionError::AlreadyInitialized);
        }
        let Some(request_id) = message.request_id().cloned() else {
            return Err(SessionError::ExpectedRequest);
        };
        let (stream_id, rx) = self.open_stream(
            StreamKind::Request {
                outstanding: HashSet::from([request_id.clone()]),
            },
            STREAM_CHANNEL_CAPACITY,
        );
        self.request_origin.insert(request_id.clone(), stream_id);
        if self.to_service.send(message).is_err() {
            self.remove_stream(stream_id);
            return Err(SessionError::Closed);
        }
        self.init_request_id = Some(request_id);
        Ok(rx)
    }

    async fn handle_open_request_stream(
        &mut self,
        messages: Vec<JsonRpcMessage>,
    ) -> Result<mpsc::Receiver<SseMessage>, SessionError> {
        if !self.initialized {
            return Err(SessionError::NotInitialized);
        }
        let mut outstanding = HashSet::new();
        for message in &messages {
            if let Some(id) = message.request_id() {
                if self.request_origin.contains_key(id) || !outstanding.insert(id.clone()) {
                    return Err(SessionError::DuplicateRequestId(id.clone()));
                }
            }
        }
        let (stream_id, rx) = self.open_stream(
            StreamKind::Request { outstanding },
            STREAM_CHANNEL_CAPACITY,
        );
        for message in &messages {
            if let Some(id) = message.request_id() {
                self.request_origin.insert(id.clone(), stream_id);
            }
        }
        for message in messages {
            if self.to_service.send(message).is_err() {
                self.remove_stream(stream_id);
                return Err(SessionError::Closed);
            }
        }
        Ok(rx)
    }

    async fn handle_accept_messages(
        &mut self,
        messages: Vec<JsonRpcMessage>,
    ) -> Result<(), SessionError> {
        if !self.initialized {
            return Err(SessionError::NotInitialized);
        }
        for message in messages {
            if self.to_service.send(message).is_err() {
                return Err(SessionError::Closed);
            }
        }
        Ok(())
    }

    fn handle_open_listener(
        &mut self,
        last_event_id: Option<u64>,
    ) -> Result<mpsc::Receiver<SseMessage>, SessionError> {
        if !self.initialized {
            return Err(SessionError::NotInitialized);
        }
        if let Some(previous) = self.listener.take() {
            self.remove_stream(previous);
        }
        let replay = match last_event_id {
            Some(after) => self.history.replay_for_listener(after),
            None => Vec::new(),
        };
        let (stream_id, rx) = self.open_stream(
            StreamKind::Listener,
            replay.len() + STREAM_CHANNEL_CAPACITY,
        );
        if let Some(entry) = self.streams.get(&stream_id) {
            for event in replay {
                // capacity covers the whole replay set
                let _ = entry.tx.try_send(event);
            }
        }
        self.listener = Some(stream_id);
        Ok(rx)
    }

    fn handle_open_duplex(
        &mut self,
    ) -> Result<(StreamId, mpsc::Receiver<SseMessage>), SessionError> {
        if !self.initialized {
            return Err(SessionError::NotInitialized);
        }
        let (stream_id, rx) = self.open_stream(StreamKind::Duplex, STREAM_CHANNEL_CAPACITY);
        Ok((stream_id, rx))
    }

    async fn handle_accept_inbound(
        &mut self,
        stream_id: StreamId,
        message: JsonRpcMessage,
    ) -> Result<(), SessionError> {
        if !self.initialized {
            return Err(SessionError::NotInitialized);
        }
        if !self.streams.contains_key(&stream_id) {
            return Err(SessionError::Closed);
        }
        if let Some(id) = message.request_id() {
            if self.request_origin.contains_key(id) {
                return Err(SessionError::DuplicateRequestId(id.clone()));
            }
            self.request_origin.insert(id.clone(), stream_id);
        }
        if self.to_service.send(message).is_err() {
            return Err(SessionError::Closed);
        }
        Ok(())
    }

    async fn route_outbound(&mut self, outbound: OutboundMessage) {
        let OutboundMessage {
            message,
            related_request_id,
        } = outbound;

        self.observe_initialize_outcome(&message).await;

        if let Some(id) = message.response_id().cloned() {
            self.route_response(id, message).await;
        } else {
            self.route_uncorrelated(message, related_request_id).await;
        }
    }

    /// Flip the session to initialized once the handshake response passes
    /// through, and persist the durable part of the session.
    async fn observe_initialize_outcome(&mut self, message: &JsonRpcMessage) {
        let Some(init_id) = &self.init_request_id else {
            return;
        };
        if message.response_id() != Some(init_id) {
            return;
        }
        match message {
            JsonRpcMessage::Response(_) => {
                self.initialized = true;
                self.initialized_flag.store(true, Ordering::Release);
                self.init_request_id = None;
                self.store
                    .save(
                        &self.id,
                        SessionRecord {
                            properties: (*self.properties).clone(),
                            initialized: true,
                        },
                    )
                    .await;
                tracing::info!(session_id = %self.id, "session initialized");
            }
            JsonRpcMessage::Error(_) => {
                self.init_request_id = None;
                tracing::warn!(session_id = %self.id, "initialize failed");
            }
            _ => {}
        }
    }

    /// Correlated delivery: the origin table names the stream, the entry is
    /// removed exactly once, and a request stream closes when its last
    /// outstanding request is answered. When the origin stream has closed,
    /// the response falls through to the standalone listener.
    async fn route_response(&mut self, id: RequestId, message: JsonRpcMessage) {
        let mut target = None;
        if let Some(stream_id) = self.request_origin.remove(&id) {
            if self.stream_alive(stream_id) {
                target = Some(stream_id);
            } else {
                self.remove_stream(stream_id);
            }
        }
        if target.is_none() {
            target = self.fallback_stream();
        }

        let hint = target.and_then(|stream_id| self.stream_hint(stream_id));
        let event_id = self.history.record(&message, hint);

        let Some(stream_id) = target else {
            tracing::debug!(session_id = %self.id, response_id = %id, "no open stream for response, kept for replay");
            return;
        };
        if self.deliver(stream_id, event_id, message).await {
            self.finish_request_on_stream(stream_id, &id);
        } else {
            self.remove_stream(stream_id);
            tracing::debug!(session_id = %self.id, response_id = %id, "response stream gone");
        }
    }

    /// Server-initiated requests and notifications: pinned to the stream
    /// carrying `related_request_id` when given, else any open listener,
    /// else kept in history only.
    async fn route_uncorrelated(
        &mut self,
        message: JsonRpcMessage,
        related_request_id: Option<RequestId>,
    ) {
        let mut target = related_request_id
            .as_ref()
            .and_then(|id| self.request_origin.get(id).copied())
            .filter(|stream_id| self.stream_alive(*stream_id));
        if target.is_none() {
            target = self.fallback_stream();
        }

        let hint = target.and_then(|stream_id| self.stream_hint(stream_id));
        let event_id = self.history.record(&message, hint);

        let Some(stream_id) = target else {
            tracing::debug!(session_id = %self.id, "no open stream for message, kept for replay");
            return;
        };
        if !self.deliver(stream_id, event_id, message).await {
            self.remove_stream(stream_id);
        }
    }

    async fn deliver(&self, stream_id: StreamId, event_id: u64, message: JsonRpcMessage) -> bool {
        let Some(entry) = self.streams.get(&stream_id) else {
            return false;
        };
        entry
            .tx
            .send(SseMessage {
                event_id: Some(event_id),
                message,
            })
            .await
            .is_ok()
    }

    fn finish_request_on_stream(&mut self, stream_id: StreamId, id: &RequestId) {
        let close = match self.streams.get_mut(&stream_id) {
            Some(StreamEntry {
                kind: StreamKind::Request { outstanding },
                ..
            }) => {
                outstanding.remove(id);
                outstanding.is_empty()
            }
            _ => false,
        };
        if close {
            self.remove_stream(stream_id);
        }
    }
}

/// Cheap, clonable handle to one session's worker.
#[derive(Clone)]
pub struct SessionHandle {
    id: SessionId,
    commands: mpsc::Sender<SessionCommand>,
    initialized: Arc<AtomicBool>,
}

impl SessionHandle {
    pub fn id(&self) -> &SessionId {
        &self.id
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::Acquire)
    }

    fn is_alive(&self) -> bool {
        !self.commands.is_closed()
    }

    async fn command<R>(
        &self,
        make: impl FnOnce(oneshot::Sender<Result<R, SessionError>>) -> SessionCommand,
    ) -> Result<R, SessionError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.commands
            .send(make(reply_tx))
            .await
            .map_err(|_| SessionError::Closed)?;
        reply_rx.await.map_err(|_| SessionError::Closed)?
    }

    /// Run the `initialize` handshake; the returned stream carries the
    /// handshake response and closes after it.
    pub async fn initialize(
        &self,
        message: JsonRpcMessage,
    ) -> Result<mpsc::Receiver<SseMessage>, SessionError> {
        self.command(|reply| SessionCommand::Initialize { message, reply })
            .await
    }

    /// Dispatch a validated POST carrying at least one request; the
    /// returned stream closes once every request is answered.
    pub async fn open_request_stream(
        &self,
        messages: Vec<JsonRpcMessage>,
    ) -> Result<mpsc::Receiver<SseMessage>, SessionError> {
        self.command(|reply| SessionCommand::OpenRequestStream { messages, reply })
            .await
    }

    /// Dispatch notifications and client replies that need no stream.
    pub async fn accept_messages(
        &self,
        messages: Vec<JsonRpcMessage>,
    ) -> Result<(), SessionError> {
        self.command(|reply| SessionCommand::AcceptMessages { messages, reply })
            .await
    }

    /// Open (or replace) the standalone listener stream, replaying history
    /// past `last_event_id` first.
    pub async fn open_listener(
        &self,
        last_event_id: Option<u64>,
    ) -> Result<mpsc::Receiver<SseMessage>, SessionError> {
        self.command(|reply| SessionCommand::OpenListener {
            last_event_id,
            reply,
        })
        .await
    }

    /// Attach a bidirectional stream (WebSocket) to this session.
    pub async fn open_duplex(
        &self,
    ) -> Result<(StreamId, mpsc::Receiver<SseMessage>), SessionError> {
        self.command(|reply| SessionCommand::OpenDuplex { reply }).await
    }

    /// Feed one inbound message arriving on `stream_id`; responses to any
    /// request in it are routed back to that stream.
    pub async fn accept_inbound(
        &self,
        stream_id: StreamId,
        message: JsonRpcMessage,
    ) -> Result<(), SessionError> {
        self.command(|reply| SessionCommand::AcceptInbound {
            stream_id,
            message,
            reply,
        })
        .await
    }

    /// Tear the session down irrecoverably.
    pub async fn terminate(&self) {
        let (reply_tx, reply_rx) = oneshot::channel();
        if self
            .commands
            .send(SessionCommand::Terminate { reply: reply_tx })
            .await
            .is_ok()
        {
            let _ = reply_rx.await;
        }
    }
}

/// Durable part of a session: what survives hibernation.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct SessionRecord {
    pub properties: Properties,
    pub initialized: bool,
}

/// Persistence for session records. Back this with an external store to
/// let sessions survive process restarts.
pub trait SessionStore: Send + Sync + 'static {
    fn load(&self, id: &str) -> impl Future<Output = Option<SessionRecord>> + Send;
    fn save(&self, id: &str, record: SessionRecord) -> impl Future<Output = ()> + Send;
    fn remove(&self, id: &str) -> impl Future<Output = ()> + Send;
}

/// The default in-process store.
#[derive(Default)]
pub struct InMemorySessionStore {
    records: RwLock<HashMap<String, SessionRecord>>,
}

impl SessionStore for InMemorySessionStore {
    async fn load(&self, id: &str) -> Option<SessionRecord> {
        self.records.read().await.get(id).cloned()
    }

    async fn save(&self, id: &str, record: SessionRecord) {
        self.records.write().await.insert(id.to_owned(), record);
    }

    async fn remove(&self, id: &str) {
        self.records.write().await.remove(id);
    }
}

/// Creates, restores and closes sessions; one agent instance per session.
pub struct SessionManager<A, S = InMemorySessionStore>
where
    A: McpAgent,
    S: SessionStore,
{
    agent_factory: Arc<dyn Fn() -> A + Send + Sync>,
    store: Arc<S>,
    sessions: RwLock<HashMap<String, SessionHandle>>,
    history_capacity: usize,
    ct: CancellationToken,
}

impl<A, S> SessionManager<A, S>
where
    A: McpAgent,
    S: SessionStore,
{
    pub fn new(
        agent_factory: impl Fn() -> A + Send + Sync + 'static,
        store: Arc<S>,
        history_capacity: usize,
        ct: CancellationToken,
    ) -> Self {
        Self {
            agent_factory: Arc::new(agent_factory),
            store,
            sessions: RwLock::new(HashMap::new()),
            history_capacity,
            ct,
        }
    }

    /// Allocate a session id and spawn its worker and agent, attaching the
    /// caller-supplied properties.
    pub async fn create_session(&self, properties: Properties) -> SessionHandle {
        let id = session_id();
        let handle = self.spawn_worker(id.clone(), Arc::new(properties), false);
        self.sessions
            .write()
            .await
            .insert(id.to_string(), handle.clone());
        tracing::info!(session_id = %id, "created session");
        handle
    }

    /// Load an existing session, restoring a hibernated one from the store.
    /// Fails with [`SessionError::NotFound`] for ids this node never issued
    /// or already tore down.
    pub async fn ensure(&self, id: &str) -> Result<SessionHandle, SessionError> {
        if let Some(handle) = self.sessions.read().await.get(id)
            && handle.is_alive()
        {
            return Ok(handle.clone());
        }
        let Some(record) = self.store.load(id).await else {
            return Err(SessionError::NotFound);
        };
        let mut sessions = self.sessions.write().await;
        // another request may have restored it while we read the store
        if let Some(handle) = sessions.get(id)
            && handle.is_alive()
        {
            return Ok(handle.clone());
        }
        let handle = self.spawn_worker(
            id.into(),
            Arc::new(record.properties),
            record.initialized,
        );
        sessions.insert(id.to_owned(), handle.clone());
        tracing::info!(session_id = %id, "restored session");
        Ok(handle)
    }

    pub async fn has_session(&self, id: &str) -> bool {
        if let Some(handle) = self.sessions.read().await.get(id)
            && handle.is_alive()
        {
            return true;
        }
        self.store.load(id).await.is_some()
    }

    /// DELETE semantics: terminate the worker and erase the durable record.
    pub async fn close_session(&self, id: &str) {
        let handle = self.sessions.write().await.remove(id);
        if let Some(handle) = handle {
            handle.terminate().await;
        }
        self.store.remove(id).await;
        tracing::info!(session_id = %id, "closed session");
    }

    /// Evict the worker but keep the durable record; a later request with
    /// this id restores the session.
    pub async fn hibernate(&self, id: &str) {
        let handle = self.sessions.write().await.remove(id);
        if let Some(handle) = handle {
            handle.terminate().await;
            tracing::info!(session_id = %id, "hibernated session");
        }
    }

    fn spawn_worker(
        &self,
        id: SessionId,
        properties: Arc<Properties>,
        already_initialized: bool,
    ) -> SessionHandle {
        let ct = self.ct.child_token();
        let (commands_tx, commands_rx) = mpsc::channel(32);
        let (transport, to_service_tx, from_service_rx) = SessionTransport::channel(64);
        let initialized_flag = Arc::new(AtomicBool::new(already_initialized));

        let worker = SessionWorker {
            id: id.clone(),
            properties: properties.clone(),
            initialized: already_initialized,
            initialized_flag: initialized_flag.clone(),
            init_request_id: None,
            to_service: to_service_tx,
            request_origin: HashMap::new(),
            streams: HashMap::new(),
            listener: None,
            history: EventHistory::new(self.history_capacity),
            next_stream_id: 1,
            store: self.store.clone(),
            ct: ct.clone(),
        };
        tokio::spawn(worker.run(commands_rx, from_service_rx));

        let agent = (self.agent_factory)();
        let serve_context = ServeContext {
            session_id: Some(id.clone()),
            properties,
            already_initialized,
            track_lifecycle: true,
            ct,
        };
        tokio::spawn({
            let id = id.clone();
            async move {
                if let Err(error) = serve_session(agent, transport, serve_context).await {
                    tracing::error!(session_id = %id, %error, "session service terminated");
                }
            }
        });

        SessionHandle {
            id,
            commands: commands_tx,
            initialized: initialized_flag,
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::{Value, json};

    use super::*;
    use crate::{
        error::ErrorData,
        model::JsonRpcRequest,
        service::{McpService, RequestContext},
    };

    struct PingService;

    impl McpService for PingService {
        async fn handle_request(
            &self,
            request: JsonRpcRequest,
            context: RequestContext,
        ) -> Result<Value, ErrorData> {
            match request.method.as_str() {
                "initialize" => Ok(json!({"protocolVersion": "2025-03-26"})),
                "ping" => Ok(json!({})),
                "slow_ping" => {
                    tokio::time::sleep(std::time::Duration::from_millis(30)).await;
                    Ok(json!({}))
                }
                "announce" => {
                    // unrelated server-initiated notification
                    context
                        .peer
                        .notify("notifications/message", Some(json!({"level": "info"})))
                        .await
                        .unwrap();
                    Ok(json!({}))
                }
                other => Err(ErrorData::method_not_found(other)),
            }
        }
    }

    struct PingAgent(PingService);

    impl McpAgent for PingAgent {
        type Service = PingService;

        fn server(&self) -> &PingService {
            &self.0
        }
    }

    fn manager() -> SessionManager<PingAgent> {
        SessionManager::new(
            || PingAgent(PingService),
            Arc::new(InMemorySessionStore::default()),
            1000,
            CancellationToken::new(),
        )
    }

    fn init_message() -> JsonRpcMessage {
        JsonRpcMessage::request(1.into(), "initialize", Some(json!({})))
    }

    async fn initialized_session(
        manager: &SessionManager<PingAgent>,
    ) -> SessionHandle {
        let handle = manager.create_session(Properties::default()).await;
        let mut rx = handle.initialize(init_message()).await.unwrap();
        let event = rx.recv().await.unwrap();
        assert!(matches!(event.message, JsonRpcMessage::Response(_)));
        // stream closes once the handshake request is answered
        assert!(rx.recv().await.is_none());
        handle
    }

    #[tokio::test]
    async fn test_initialize_marks_session() {
        let manager = manager();
        let handle = initialized_session(&manager).await;
        assert!(handle.is_initialized());
    }

    #[tokio::test]
    async fn test_second_initialize_rejected_and_first_wins() {
        let manager = manager();
        let handle = initialized_session(&manager).await;
        let err = handle.initialize(init_message()).await.unwrap_err();
        assert!(matches!(err, SessionError::AlreadyInitialized));
        assert!(handle.is_initialized());
    }

    #[tokio::test]
    async fn test_concurrent_initialize_single_winner() {
        let manager = manager();
        let handle = manager.create_session(Properties::default()).await;
        let first = handle.initialize(init_message()).await;
        let second = handle
            .initialize(JsonRpcMessage::request(2.into(), "initialize", Some(json!({}))))
            .await;
        assert!(first.is_ok());
        assert!(matches!(second, Err(SessionError::AlreadyInitialized)));
    }

    #[tokio::test]
    async fn test_request_stream_closes_after_all_responses() {
        let manager = manager();
        let handle = initialized_session(&manager).await;
        let mut rx = handle
            .open_request_stream(vec![
                JsonRpcMessage::request(2.into(), "ping", None),
                JsonRpcMessage::request(3.into(), "ping", None),
            ])
            .await
            .unwrap();
        let mut ids = Vec::new();
        while let Some(event) = rx.recv().await {
            ids.push(event.message.response_id().cloned().unwrap());
        }
        assert_eq!(ids.len(), 2);
        assert!(ids.contains(&2.into()));
        assert!(ids.contains(&3.into()));
    }

    #[tokio::test]
    async fn test_uninitialized_session_rejects_requests() {
        let manager = manager();
        let handle = manager.create_session(Properties::default()).await;
        let err = handle
            .open_request_stream(vec![JsonRpcMessage::request(2.into(), "ping", None)])
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::NotInitialized));
    }

    #[tokio::test]
    async fn test_duplicate_request_id_rejected() {
        let manager = manager();
        let handle = initialized_session(&manager).await;
        let err = handle
            .open_request_stream(vec![
                JsonRpcMessage::request(2.into(), "ping", None),
                JsonRpcMessage::request(2.into(), "ping", None),
            ])
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::DuplicateRequestId(_)));
    }

    #[tokio::test]
    async fn test_unrelated_notification_goes_to_listener() {
        let manager = manager();
        let handle = initialized_session(&manager).await;
        let mut listener = handle.open_listener(None).await.unwrap();

        let mut rx = handle
            .open_request_stream(vec![JsonRpcMessage::request(2.into(), "announce", None)])
            .await
            .unwrap();
        // request stream only carries the response
        let event = rx.recv().await.unwrap();
        assert!(matches!(event.message, JsonRpcMessage::Response(_)));
        assert!(rx.recv().await.is_none());

        let event = listener.recv().await.unwrap();
        assert!(matches!(event.message, JsonRpcMessage::Notification(_)));
    }

    #[tokio::test]
    async fn test_replay_skips_request_stream_events() {
        let manager = manager();
        let handle = initialized_session(&manager).await;

        // no listener open: the notification lands in history unhinted
        let mut rx = handle
            .open_request_stream(vec![JsonRpcMessage::request(2.into(), "announce", None)])
            .await
            .unwrap();
        while rx.recv().await.is_some() {}

        let mut listener = handle.open_listener(Some(0)).await.unwrap();
        let replayed = listener.recv().await.unwrap();
        assert!(matches!(replayed.message, JsonRpcMessage::Notification(_)));
        let first_id = replayed.event_id.unwrap();

        // replaying from that id yields nothing further
        let mut listener = handle.open_listener(Some(first_id)).await.unwrap();
        tokio::select! {
            event = listener.recv() => {
                assert!(event.is_none(), "unexpected replayed event");
            }
            _ = tokio::time::sleep(std::time::Duration::from_millis(50)) => {}
        }
    }

    #[tokio::test]
    async fn test_replay_is_monotonic() {
        let mut history = EventHistory::new(10);
        let notification = JsonRpcMessage::notification("notifications/message", None);
        for _ in 0..5 {
            history.record(&notification, None);
        }
        let replay = history.replay_for_listener(2);
        let ids: Vec<u64> = replay.iter().map(|e| e.event_id.unwrap()).collect();
        assert_eq!(ids, vec![3, 4, 5]);
    }

    #[test]
    fn test_history_evicts_oldest() {
        let mut history = EventHistory::new(3);
        let notification = JsonRpcMessage::notification("notifications/message", None);
        for _ in 0..5 {
            history.record(&notification, None);
        }
        let replay = history.replay_for_listener(0);
        let ids: Vec<u64> = replay.iter().map(|e| e.event_id.unwrap()).collect();
        assert_eq!(ids, vec![3, 4, 5]);
    }

    #[tokio::test]
    async fn test_close_session_is_irrecoverable() {
        let manager = manager();
        let handle = initialized_session(&manager).await;
        let id = handle.id().to_string();
        manager.close_session(&id).await;
        assert!(matches!(
            manager.ensure(&id).await,
            Err(SessionError::NotFound)
        ));
    }

    #[tokio::test]
    async fn test_hibernate_and_restore_keeps_initialized() {
        let manager = manager();
        let handle = initialized_session(&manager).await;
        let id = handle.id().to_string();

        manager.hibernate(&id).await;
        let restored = manager.ensure(&id).await.unwrap();
        assert!(restored.is_initialized());

        // the restored worker answers without a second handshake
        let mut rx = restored
            .open_request_stream(vec![JsonRpcMessage::request(9.into(), "ping", None)])
            .await
            .unwrap();
        let event = rx.recv().await.unwrap();
        assert!(matches!(event.message, JsonRpcMessage::Response(_)));
    }

    #[tokio::test]
    async fn test_unknown_session_not_found() {
        let manager = manager();
        assert!(matches!(
            manager.ensure("NOT-A-SID").await,
            Err(SessionError::NotFound)
        ));
    }

    #[tokio::test]
    async fn test_closed_origin_stream_falls_through_to_listener() {
        let manager = manager();
        let handle = initialized_session(&manager).await;
        let mut listener = handle.open_listener(None).await.unwrap();

        let rx = handle
            .open_request_stream(vec![JsonRpcMessage::request(2.into(), "slow_ping", None)])
            .await
            .unwrap();
        // client went away before the response
        drop(rx);

        let event = listener.recv().await.unwrap();
        assert_eq!(event.message.response_id(), Some(&2.into()));
    }
}
