//! HTTP handlers for the streamable endpoint.
//!
//! POST answers requests over a per-request SSE stream and acknowledges
//! notification-only payloads with 202; GET opens the standalone listener
//! with `Last-Event-ID` replay; DELETE tears the session down. In
//! stateless mode every POST is served by a throwaway server instance and
//! the `mcp-session-id` header is refused.

use std::{collections::HashSet, convert::Infallible, sync::Arc, time::Duration};

use axum::{
    Extension,
    body::Bytes,
    extract::State,
    http::{HeaderMap, HeaderValue, StatusCode, header},
    response::{
        IntoResponse, Response,
        sse::{Event, KeepAlive, Sse},
    },
};
use futures::StreamExt;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;

use super::{
    StreamableHttpServerConfig,
    session::{SessionError, SessionManager, SessionStore, SseMessage},
};
use crate::{
    model::JsonRpcMessage,
    service::{McpAgent, Properties, ServeContext, serve_session},
    transport::{
        SessionTransport,
        common::{
            envelope::{self, EnvelopeError, SessionPolicy},
            http_header::{HEADER_LAST_EVENT_ID, HEADER_SESSION_ID, HEADER_X_ACCEL_BUFFERING},
        },
    },
};

pub struct StreamableHttpService<A, S>
where
    A: McpAgent,
    S: SessionStore,
{
    pub config: StreamableHttpServerConfig,
    session_manager: Arc<SessionManager<A, S>>,
    agent_factory: Arc<dyn Fn() -> A + Send + Sync>,
    ct: CancellationToken,
}

impl<A, S> StreamableHttpService<A, S>
where
    A: McpAgent,
    S: SessionStore,
{
    pub fn new(
        agent_factory: impl Fn() -> A + Send + Sync + 'static,
        store: Arc<S>,
        config: StreamableHttpServerConfig,
        ct: CancellationToken,
    ) -> Self {
        let agent_factory: Arc<dyn Fn() -> A + Send + Sync> = Arc::new(agent_factory);
        let session_manager = Arc::new(SessionManager::new(
            {
                let agent_factory = agent_factory.clone();
                move || (agent_factory)()
            },
            store,
            config.history_capacity,
            ct.clone(),
        ));
        Self {
            config,
            session_manager,
            agent_factory,
            ct,
        }
    }

    pub fn session_manager(&self) -> &Arc<SessionManager<A, S>> {
        &self.session_manager
    }

    fn policy(&self) -> SessionPolicy {
        if self.config.stateful_mode {
            SessionPolicy::Stateful
        } else {
            SessionPolicy::Stateless
        }
    }

    pub async fn handle_post(
        State(service): State<Arc<Self>>,
        properties: Option<Extension<Properties>>,
        headers: HeaderMap,
        body: Bytes,
    ) -> Response {
        let validated = match envelope::validate_post(&headers, &body, service.policy()) {
            Ok(validated) => validated,
            Err(error) => return error.into_response(),
        };
        tracing::debug!(
            messages = validated.messages.len(),
            has_initialize = validated.has_initialize,
            "POST accepted by envelope checks"
        );
        let properties = properties.map(|Extension(p)| p).unwrap_or_default();
        if service.config.stateful_mode {
            service.post_stateful(validated, properties).await
        } else {
            service.post_stateless(validated).await
        }
    }

    async fn post_stateful(
        &self,
        validated: envelope::ValidatedPost,
        properties: Properties,
    ) -> Response {
        if validated.has_initialize {
            // the validator guarantees a singleton batch without session id
            let Some(message) = validated.messages.into_iter().next() else {
                return EnvelopeError::invalid_request("Empty batch").into_response();
            };
            let handle = self.session_manager.create_session(properties).await;
            let session_id = handle.id().clone();
            return match handle.initialize(message).await {
                Ok(rx) => self.sse_response(rx, Some(session_id.as_ref())),
                Err(error) => session_error_response(error),
            };
        }

        let Some(session_id) = validated.session_id else {
            return EnvelopeError::missing_session().into_response();
        };
        let handle = match self.session_manager.ensure(&session_id).await {
            Ok(handle) => handle,
            Err(error) => return session_error_response(error),
        };
        if !handle.is_initialized() {
            return EnvelopeError::session_not_initialized().into_response();
        }

        let has_request = validated.messages.iter().any(JsonRpcMessage::is_request);
        if has_request {
            match handle.open_request_stream(validated.messages).await {
                Ok(rx) => self.sse_response(rx, Some(handle.id().as_ref())),
                Err(error) => session_error_response(error),
            }
        } else {
            match handle.accept_messages(validated.messages).await {
                Ok(()) => {
                    let mut response = StatusCode::ACCEPTED.into_response();
                    if let Ok(value) = HeaderValue::from_str(handle.id()) {
                        response.headers_mut().insert(HEADER_SESSION_ID, value);
                    }
                    response
                }
                Err(error) => session_error_response(error),
            }
        }
    }

    /// One throwaway server instance per POST; the stream closes as soon as
    /// every request in the payload is answered, and nothing outlives the
    /// response.
    async fn post_stateless(&self, validated: envelope::ValidatedPost) -> Response {
        let expected: HashSet<_> = validated
            .messages
            .iter()
            .filter_map(|message| message.request_id().cloned())
            .collect();

        let (transport, to_service_tx, mut outbound_rx) = SessionTransport::channel(64);
        let agent = (self.agent_factory)();
        let ct = self.ct.child_token();
        let serve_ct = ct.clone();
        tokio::spawn(async move {
            if let Err(error) =
                serve_session(agent, transport, ServeContext::detached(serve_ct)).await
            {
                tracing::debug!(%error, "stateless service terminated");
            }
        });
        for message in validated.messages {
            if to_service_tx.send(message).is_err() {
                break;
            }
        }
        drop(to_service_tx);

        if expected.is_empty() {
            // notifications only: the service drains them and winds down
            // on its own once the closed inbound channel runs dry
            return StatusCode::ACCEPTED.into_response();
        }

        let stream = async_stream::stream! {
            let _guard = ct.drop_guard();
            let mut pending = expected;
            let mut event_id: u64 = 0;
            while !pending.is_empty() {
                let Some(out) = outbound_rx.recv().await else { break };
                if let Some(id) = out.message.response_id() {
                    pending.remove(id);
                }
                event_id += 1;
                yield SseMessage {
                    event_id: Some(event_id),
                    message: out.message,
                };
            }
        };
        let keep_alive = self.config.sse_keep_alive;
        sse_response_from_stream(stream.map(sse_event), keep_alive, None)
    }

    pub async fn handle_get(
        State(service): State<Arc<Self>>,
        headers: HeaderMap,
    ) -> Response {
        if !service.config.stateful_mode {
            return EnvelopeError::method_not_allowed().into_response();
        }
        if let Err(error) = envelope::validate_sse_accept(&headers) {
            return error.into_response();
        }
        let Some(session_id) = envelope::session_id_header(&headers) else {
            return EnvelopeError::missing_session().into_response();
        };
        let handle = match service.session_manager.ensure(&session_id).await {
            Ok(handle) => handle,
            Err(error) => return session_error_response(error),
        };

        let last_event_id = headers
            .get(HEADER_LAST_EVENT_ID)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.parse::<u64>().ok());
        tracing::debug!(%session_id, ?last_event_id, "GET listener stream");

        match handle.open_listener(last_event_id).await {
            Ok(rx) => service.sse_response(rx, Some(handle.id().as_ref())),
            Err(error) => session_error_response(error),
        }
    }

    pub async fn handle_delete(
        State(service): State<Arc<Self>>,
        headers: HeaderMap,
    ) -> Response {
        if !service.config.stateful_mode {
            return EnvelopeError::method_not_allowed().into_response();
        }
        let Some(session_id) = envelope::session_id_header(&headers) else {
            return EnvelopeError::missing_session().into_response();
        };
        if !service.session_manager.has_session(&session_id).await {
            return EnvelopeError::session_not_found().into_response();
        }
        service.session_manager.close_session(&session_id).await;
        StatusCode::NO_CONTENT.into_response()
    }

    fn sse_response(
        &self,
        rx: tokio::sync::mpsc::Receiver<SseMessage>,
        session_id: Option<&str>,
    ) -> Response {
        sse_response_from_stream(
            ReceiverStream::new(rx).map(sse_event),
            self.config.sse_keep_alive,
            session_id,
        )
    }
}

fn sse_event(event: SseMessage) -> Result<Event, Infallible> {
    let data = serde_json::to_string(&event.message).unwrap_or_else(|_| "{}".to_string());
    let mut sse_event = Event::default();
    if let Some(id) = event.event_id {
        sse_event = sse_event.id(id.to_string());
    }
    Ok(sse_event.event("message").data(data))
}

fn sse_response_from_stream(
    stream: impl futures::Stream<Item = Result<Event, Infallible>> + Send + 'static,
    keep_alive: Option<Duration>,
    session_id: Option<&str>,
) -> Response {
    let sse = Sse::new(stream);
    let mut response = match keep_alive {
        Some(interval) => sse.keep_alive(KeepAlive::new().interval(interval)).into_response(),
        None => sse.into_response(),
    };
    let headers = response.headers_mut();
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    headers.insert(HEADER_X_ACCEL_BUFFERING, HeaderValue::from_static("no"));
    if let Some(session_id) = session_id
        && let Ok(value) = HeaderValue::from_str(session_id)
    {
        headers.insert(HEADER_SESSION_ID, value);
    }
    response
}

fn session_error_response(error: SessionError) -> Response {
    let status = match error {
        SessionError::NotFound | SessionError::Closed => StatusCode::NOT_FOUND,
        _ => StatusCode::BAD_REQUEST,
    };
    EnvelopeError::new(status, error.to_error_data()).into_response()
}
