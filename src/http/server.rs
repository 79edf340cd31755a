//! HTTP server setup and configuration.
//!
//! # Responsibilities
//! - Create the Axum router with a single catch-all handler
//! - Wire up middleware (tracing, limits, timeout, request ID, server header)
//! - Translate Axum requests into [`RequestContext`]s for the pipeline
//! - Complete WebSocket handshakes for upgrade-capable endpoints
//! - Serve until the shutdown coordinator fires

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::{
    body::Body,
    extract::{ConnectInfo, FromRequestParts, State, WebSocketUpgrade},
    http::{header, request::Parts, HeaderMap, HeaderValue, Request, StatusCode},
    response::{IntoResponse, Response},
    routing::any,
    Router,
};
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tower_http::{
    limit::RequestBodyLimitLayer,
    request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer},
    set_header::SetResponseHeaderLayer,
    timeout::TimeoutLayer,
    trace::TraceLayer,
};

use crate::config::RouterConfig;
use crate::error::ServerError;
use crate::http::lifecycle::RequestPipeline;
use crate::http::request::{OneshotSink, RequestContext};
use crate::http::response::OutgoingResponse;
use crate::http::websocket::{SessionRegistry, WsPayload};
use crate::lifecycle::Shutdown;
use crate::routing::{Endpoint, EndpointRegistry, HttpMethod, WsEndpointId};

/// Header carrying the per-request correlation ID.
pub const X_REQUEST_ID: &str = "x-request-id";

/// Application state injected into handlers.
#[derive(Clone)]
pub struct AppState {
    pub pipeline: Arc<RequestPipeline>,
    pub sessions: Arc<SessionRegistry>,
    pub shutdown: Arc<Shutdown>,
    pub body_limit: usize,
}

/// HTTP server for the embedded router.
pub struct HttpServer {
    router: Router,
    config: RouterConfig,
    pipeline: Arc<RequestPipeline>,
    sessions: Arc<SessionRegistry>,
    shutdown: Arc<Shutdown>,
}

impl HttpServer {
    /// Create a new HTTP server with the given configuration.
    pub fn new(config: RouterConfig, pipeline: RequestPipeline, shutdown: Arc<Shutdown>) -> Self {
        let pipeline = Arc::new(pipeline);
        let sessions = Arc::new(SessionRegistry::new(config.websocket.outbound_buffer));

        let state = AppState {
            pipeline: Arc::clone(&pipeline),
            sessions: Arc::clone(&sessions),
            shutdown: Arc::clone(&shutdown),
            body_limit: config.security.max_body_size,
        };

        let router = Self::build_router(&config, state);
        Self {
            router,
            config,
            pipeline,
            sessions,
            shutdown,
        }
    }

    /// Build the Axum router with all middleware layers.
    #[allow(deprecated)]
    fn build_router(config: &RouterConfig, state: AppState) -> Router {
        Router::new()
            .route("/{*path}", any(dispatch_handler))
            .route("/", any(dispatch_handler))
            .with_state(state)
            .layer(RequestBodyLimitLayer::new(config.security.max_body_size))
            .layer(TimeoutLayer::new(Duration::from_secs(config.timeouts.request_secs)))
            .layer(PropagateRequestIdLayer::x_request_id())
            .layer(SetResponseHeaderLayer::if_not_present(
                header::SERVER,
                HeaderValue::from_static(concat!("host-router/", env!("CARGO_PKG_VERSION"))),
            ))
            .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
            .layer(TraceLayer::new_for_http())
    }

    /// Run the server, accepting connections on the given listener.
    pub async fn run(self, listener: TcpListener) -> Result<(), ServerError> {
        let addr = listener.local_addr()?;
        tracing::info!(
            address = %addr,
            request_timeout_secs = self.config.timeouts.request_secs,
            max_body_size = self.config.security.max_body_size,
            "HTTP server starting"
        );

        let shutdown = Arc::clone(&self.shutdown);
        let app = self.router.into_make_service_with_connect_info::<SocketAddr>();

        // Serve with graceful shutdown
        axum::serve(listener, app)
            .with_graceful_shutdown(async move { shutdown.wait().await })
            .await?;

        tracing::info!("HTTP server stopped");
        Ok(())
    }

    /// The configured router, for in-process use.
    pub fn router(&self) -> Router {
        self.router.clone()
    }

    pub fn registry(&self) -> &Arc<EndpointRegistry> {
        self.pipeline.registry()
    }

    pub fn sessions(&self) -> Arc<SessionRegistry> {
        Arc::clone(&self.sessions)
    }

    /// Broadcast `payload` to every session on a WebSocket endpoint.
    /// Returns the number of sessions reached.
    pub fn ws_send(&self, ws_id: WsEndpointId, payload: impl Into<WsPayload>) -> usize {
        self.sessions.broadcast(ws_id, payload)
    }

    /// Get a reference to the config.
    pub fn config(&self) -> &RouterConfig {
        &self.config
    }
}

/// Catch-all handler feeding every request into the pipeline.
async fn dispatch_handler(State(state): State<AppState>, request: Request<Body>) -> Response {
    let remote = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|info| info.0);

    let Ok(method) = HttpMethod::try_from(request.method()) else {
        tracing::debug!(method = %request.method(), "Unsupported method");
        return (StatusCode::METHOD_NOT_ALLOWED, "Method not allowed").into_response();
    };

    let (mut parts, body) = request.into_parts();
    let path_and_query = parts
        .uri
        .path_and_query()
        .map(|p| p.as_str().to_string())
        .unwrap_or_else(|| "/".to_string());

    let (sink, response_rx) = OneshotSink::channel();
    let mut ctx = RequestContext::new(method, &path_and_query, Box::new(sink))
        .with_headers(parts.headers.clone())
        .with_protocol(format!("{:?}", parts.version));
    if let Some(addr) = remote {
        ctx = ctx.with_remote_addr(addr);
    }
    if let Some(id) = parts.headers.get(X_REQUEST_ID).and_then(|v| v.to_str().ok()) {
        ctx = ctx.with_request_id(id);
    }

    // Header phase: the endpoint decides whether an upgrade is possible.
    let resolved = state.pipeline.resolve(&ctx);

    if is_websocket_upgrade(&parts.headers) {
        if let Some(endpoint) = resolved.clone().filter(|e| e.websocket_upgrade_allowed()) {
            return upgrade(state, &mut parts, ctx, response_rx, endpoint).await;
        }
    }

    let body = match axum::body::to_bytes(body, state.body_limit).await {
        Ok(bytes) => bytes,
        Err(e) => {
            tracing::debug!(error = %e, "Failed to read request body");
            return (StatusCode::PAYLOAD_TOO_LARGE, "Request body too large").into_response();
        }
    };
    let ctx = ctx.with_body(body);

    let pipeline = Arc::clone(&state.pipeline);
    if let Err(e) = tokio::task::spawn_blocking(move || pipeline.handle(ctx, resolved)).await {
        tracing::error!(error = %e, "Request pipeline task failed");
    }

    finish(response_rx).await
}

async fn upgrade(
    state: AppState,
    parts: &mut Parts,
    ctx: RequestContext,
    response_rx: oneshot::Receiver<OutgoingResponse>,
    endpoint: Arc<Endpoint>,
) -> Response {
    let start = Instant::now();
    let pipeline = Arc::clone(&state.pipeline);
    let checked = tokio::task::spawn_blocking(move || {
        let mut ctx = ctx;
        let accepted = pipeline.check_upgrade(&mut ctx);
        (ctx, accepted)
    })
    .await;

    let ctx = match checked {
        Ok((ctx, true)) => ctx,
        Ok((ctx, false)) => {
            state.pipeline.record_access(&ctx, ctx.sent_status(), start);
            return finish(response_rx).await;
        }
        Err(e) => {
            tracing::error!(error = %e, "Upgrade check task failed");
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    };

    let ws = match WebSocketUpgrade::from_request_parts(parts, &state).await {
        Ok(ws) => ws,
        Err(rejection) => {
            let response = rejection.into_response();
            state
                .pipeline
                .record_access(&ctx, Some(response.status().as_u16()), start);
            return response;
        }
    };
    state.pipeline.record_access(
        &ctx,
        Some(StatusCode::SWITCHING_PROTOCOLS.as_u16()),
        start,
    );

    let sessions = Arc::clone(&state.sessions);
    let shutdown = state.shutdown.subscribe();
    let path = parts.uri.path().to_string();
    ws.on_upgrade(move |socket| sessions.serve_session(socket, endpoint, path, shutdown))
}

/// Await the pipeline's response. A request that ended without one is
/// reported to the client as timed out, the same as the timeout layer does.
async fn finish(response_rx: oneshot::Receiver<OutgoingResponse>) -> Response {
    match response_rx.await {
        Ok(response) => response.into_response(),
        Err(_) => StatusCode::REQUEST_TIMEOUT.into_response(),
    }
}

fn is_websocket_upgrade(headers: &HeaderMap) -> bool {
    headers
        .get(header::UPGRADE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.eq_ignore_ascii_case("websocket"))
        .unwrap_or(false)
}
