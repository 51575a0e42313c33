//! Gateway assembly: one router exposing the streamable endpoint, the
//! optional legacy SSE pair and the optional WebSocket path, with CORS
//! handling and graceful shutdown.

use std::{io, net::SocketAddr, sync::Arc};

use axum::{
    Router,
    extract::{DefaultBodyLimit, Request},
    http::{HeaderMap, HeaderValue, StatusCode, header},
    middleware::Next,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::{
    service::McpAgent,
    transport::{
        common::envelope::{self, EnvelopeError},
        sse_server::{SseServer, SseServerConfig},
        streamable_http_server::{
            InMemorySessionStore, SessionStore, StreamableHttpServerConfig, StreamableHttpService,
        },
        ws_server::WsService,
    },
};

/// The `Access-Control-*` surface emitted on responses and preflights.
#[derive(Debug, Clone)]
pub struct CorsConfig {
    pub allow_origin: String,
    pub allow_methods: String,
    pub allow_headers: String,
    pub expose_headers: String,
    pub max_age: Option<u32>,
}

impl Default for CorsConfig {
    fn default() -> Self {
        Self {
            allow_origin: "*".to_string(),
            allow_methods: "GET, POST, DELETE, OPTIONS".to_string(),
            allow_headers: "Content-Type, Accept, Authorization, Last-Event-ID, Mcp-Session-Id"
                .to_string(),
            expose_headers: "Mcp-Session-Id".to_string(),
            max_age: Some(86400),
        }
    }
}

impl CorsConfig {
    fn insert(headers: &mut HeaderMap, name: header::HeaderName, value: &str) {
        if let Ok(value) = HeaderValue::from_str(value) {
            headers.insert(name, value);
        }
    }

    fn apply_common(&self, headers: &mut HeaderMap) {
        Self::insert(
            headers,
            header::ACCESS_CONTROL_ALLOW_ORIGIN,
            &self.allow_origin,
        );
        Self::insert(
            headers,
            header::ACCESS_CONTROL_EXPOSE_HEADERS,
            &self.expose_headers,
        );
    }

    fn apply_preflight(&self, headers: &mut HeaderMap) {
        self.apply_common(headers);
        Self::insert(
            headers,
            header::ACCESS_CONTROL_ALLOW_METHODS,
            &self.allow_methods,
        );
        Self::insert(
            headers,
            header::ACCESS_CONTROL_ALLOW_HEADERS,
            &self.allow_headers,
        );
        if let Some(max_age) = self.max_age {
            Self::insert(
                headers,
                header::ACCESS_CONTROL_MAX_AGE,
                &max_age.to_string(),
            );
        }
    }
}

/// Builder for the whole gateway.
pub struct McpGateway<A, S = InMemorySessionStore>
where
    A: McpAgent,
    S: SessionStore,
{
    path: String,
    config: StreamableHttpServerConfig,
    cors: Option<CorsConfig>,
    sse: Option<(String, String)>,
    ws_path: Option<String>,
    agent_factory: Arc<dyn Fn() -> A + Send + Sync>,
    store: Arc<S>,
    ct: CancellationToken,
}

impl<A> McpGateway<A>
where
    A: McpAgent,
{
    pub fn new(agent_factory: impl Fn() -> A + Send + Sync + 'static) -> Self {
        Self {
            path: "/mcp".to_string(),
            config: StreamableHttpServerConfig::default(),
            cors: Some(CorsConfig::default()),
            sse: None,
            ws_path: None,
            agent_factory: Arc::new(agent_factory),
            store: Arc::new(InMemorySessionStore::default()),
            ct: CancellationToken::new(),
        }
    }
}

impl<A, S> McpGateway<A, S>
where
    A: McpAgent,
    S: SessionStore,
{
    /// Back sessions with a different store (external persistence).
    pub fn with_store<S2: SessionStore>(self, store: Arc<S2>) -> McpGateway<A, S2> {
        McpGateway {
            path: self.path,
            config: self.config,
            cors: self.cors,
            sse: self.sse,
            ws_path: self.ws_path,
            agent_factory: self.agent_factory,
            store,
            ct: self.ct,
        }
    }

    /// Mount path of the streamable endpoint. Use `/` to mount at root.
    pub fn path(mut self, path: impl Into<String>) -> Self {
        self.path = path.into();
        self
    }

    pub fn config(mut self, config: StreamableHttpServerConfig) -> Self {
        self.config = config;
        self
    }

    /// Serve every POST with a throwaway server instance and refuse
    /// session ids.
    pub fn stateless(mut self) -> Self {
        self.config.stateful_mode = false;
        self
    }

    pub fn cors(mut self, cors: Option<CorsConfig>) -> Self {
        self.cors = cors;
        self
    }

    /// Also expose the legacy SSE transport pair.
    pub fn with_sse(mut self, sse_path: impl Into<String>, post_path: impl Into<String>) -> Self {
        self.sse = Some((sse_path.into(), post_path.into()));
        self
    }

    /// Also expose a WebSocket upgrade path.
    pub fn with_ws(mut self, path: impl Into<String>) -> Self {
        self.ws_path = Some(path.into());
        self
    }

    pub fn cancellation_token(mut self, ct: CancellationToken) -> Self {
        self.ct = ct;
        self
    }

    /// Assemble the router and hand back the streamable service for
    /// embedders that need session control (hibernation, metrics).
    pub fn build(self) -> (Router, Arc<StreamableHttpService<A, S>>) {
        let streamable = Arc::new(StreamableHttpService::new(
            {
                let factory = self.agent_factory.clone();
                move || (factory)()
            },
            self.store.clone(),
            self.config.clone(),
            self.ct.clone(),
        ));

        let preflight_cors = self.cors.clone();
        let method_router = post(StreamableHttpService::<A, S>::handle_post)
            .get(StreamableHttpService::<A, S>::handle_get)
            .delete(StreamableHttpService::<A, S>::handle_delete)
            .options(move || {
                let cors = preflight_cors.clone();
                async move { preflight_response(cors.as_ref()) }
            })
            .fallback(method_not_allowed);

        let mut router = Router::new()
            .route(&self.path, method_router)
            .with_state(streamable.clone())
            // declared-oversize bodies bounce before any byte is read
            .layer(axum::middleware::from_fn(enforce_content_length))
            .layer(DefaultBodyLimit::max(envelope::MAX_BODY_BYTES + 1024));

        if let Some((sse_path, post_path)) = self.sse {
            let sse_config = SseServerConfig {
                // the listener below owns the real bind address
                bind: ([0, 0, 0, 0], 0).into(),
                sse_path,
                post_path,
                ct: self.ct.child_token(),
                sse_keep_alive: self.config.sse_keep_alive,
            };
            let (sse_server, sse_router) = SseServer::new(sse_config);
            let factory = self.agent_factory.clone();
            sse_server.with_service(move || (factory)());
            router = router.merge(sse_router);
        }

        if let Some(ws_path) = self.ws_path {
            let ws_service = Arc::new(WsService::new(
                streamable.session_manager().clone(),
                self.agent_factory.clone(),
                self.ct.child_token(),
            ));
            router = router.merge(
                Router::new()
                    .route(&ws_path, get(WsService::<A, S>::handle_upgrade))
                    .with_state(ws_service),
            );
        }

        if let Some(cors) = self.cors {
            let cors = Arc::new(cors);
            router = router.layer(axum::middleware::map_response(
                move |mut response: Response| {
                    let cors = cors.clone();
                    async move {
                        cors.apply_common(response.headers_mut());
                        response
                    }
                },
            ));
        }

        (router, streamable)
    }

    pub fn router(self) -> Router {
        self.build().0
    }

    /// Bind and serve until the gateway token is cancelled.
    pub async fn serve(self, bind: SocketAddr) -> io::Result<RunningGateway> {
        let ct = self.ct.clone();
        let listener = tokio::net::TcpListener::bind(bind).await?;
        let bind = listener.local_addr()?;
        let router = self.router();
        let shutdown = ct.child_token();
        let server = axum::serve(listener, router).with_graceful_shutdown(async move {
            shutdown.cancelled().await;
            tracing::info!("gateway cancelled");
        });
        tokio::spawn(
            async move {
                if let Err(e) = server.await {
                    tracing::error!(error = %e, "gateway shutdown with error");
                }
            }
            .instrument(tracing::info_span!("mcp-gateway", bind_address = %bind)),
        );
        Ok(RunningGateway { bind, ct })
    }
}

/// A bound, serving gateway.
pub struct RunningGateway {
    pub bind: SocketAddr,
    ct: CancellationToken,
}

impl RunningGateway {
    pub fn cancel(&self) {
        self.ct.cancel();
    }

    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.ct
    }
}

fn preflight_response(cors: Option<&CorsConfig>) -> Response {
    let mut response = StatusCode::NO_CONTENT.into_response();
    if let Some(cors) = cors {
        cors.apply_preflight(response.headers_mut());
    }
    response
}

async fn method_not_allowed() -> Response {
    EnvelopeError::method_not_allowed().into_response()
}

async fn enforce_content_length(request: Request, next: Next) -> Response {
    let declared = request
        .headers()
        .get(header::CONTENT_LENGTH)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.parse::<usize>().ok());
    if let Some(length) = declared
        && length > envelope::MAX_BODY_BYTES
    {
        return EnvelopeError::payload_too_large().into_response();
    }
    next.run(request).await
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

    struct NullService;

    impl McpService for NullService {
        async fn handle_request(
            &self,
            _request: JsonRpcRequest,
            _context: RequestContext,
        ) -> Result<Value, ErrorData> {
            Ok(json!({}))
        }
    }

    struct NullAgent;

    impl McpAgent for NullAgent {
        type Service = NullService;

        fn server(&self) -> &NullService {
            &NullService
        }
    }

    #[test]
    fn test_preflight_has_configured_headers_and_no_body() {
        let cors = CorsConfig::default();
        let response = preflight_response(Some(&cors));
        assert_eq!(response.status(), StatusCode::NO_CONTENT);
        let headers = response.headers();
        assert_eq!(
            headers.get(header::ACCESS_CONTROL_ALLOW_ORIGIN).unwrap(),
            "*"
        );
        assert!(headers.contains_key(header::ACCESS_CONTROL_ALLOW_METHODS));
        assert!(headers.contains_key(header::ACCESS_CONTROL_ALLOW_HEADERS));
        assert!(headers.contains_key(header::ACCESS_CONTROL_MAX_AGE));
    }

    #[test]
    fn test_expose_headers_includes_session_id() {
        let cors = CorsConfig::default();
        let mut headers = HeaderMap::new();
        cors.apply_common(&mut headers);
        assert_eq!(
            headers.get(header::ACCESS_CONTROL_EXPOSE_HEADERS).unwrap(),
            "Mcp-Session-Id"
        );
    }

    #[tokio::test]
    async fn test_router_builds_with_all_transports() {
        let router = McpGateway::new(|| NullAgent)
            .path("/mcp")
            .with_sse("/sse", "/message")
            .with_ws("/ws")
            .router();
        drop(router);
    }
}
