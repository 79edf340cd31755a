//! Request dispatch loop.
//!
//! # Responsibilities
//! - Run the optional auth hook, then look up and invoke the endpoint
//! - Follow internal redirects up to a fixed ceiling
//! - Route handler errors and panics to the endpoint-error hook
//! - Emit one access record per request
//!
//! # Data Flow
//! ```text
//! RequestContext (+ endpoint resolved during the header phase)
//!     → auth hook (false ends the request)
//!     → registry.find_endpoint(method, path, ignore_tag)
//!         found, has handler  → handler (errors/panics → endpoint-error hook)
//!         found, upgradable   → no-upgrade hook (426)
//!         not found           → not-found hook (404)
//!     → pending redirect? bump count, swap path, loop
//!     → AccessRecord → access-log sink
//! ```
//!
//! # Design Decisions
//! - Runs on a blocking worker thread; handlers may block
//! - Faults never escape the request they belong to
//! - A request that ends without a response is logged, not failed

use std::sync::Arc;
use std::time::Instant;

use axum::http::{header, HeaderMap, StatusCode};
use thiserror::Error;

use crate::config::{OriginPolicy, RouterConfig};
use crate::error::catch_panic;
use crate::http::request::RequestContext;
use crate::observability::access_log::{
    AccessLogSink, AccessRecord, NoopAccessLog, TracingAccessLog,
};
use crate::observability::metrics;
use crate::routing::{Endpoint, EndpointRegistry};
use crate::BoxError;

/// Internal redirects allowed per request. The hop that exceeds this is fatal.
pub const MAX_INTERNAL_REDIRECTS: u32 = 50;

/// Failures contained within a single request.
#[derive(Debug, Error)]
pub enum RequestFault {
    #[error(transparent)]
    Handler(BoxError),

    #[error("handler panicked: {0}")]
    Panicked(String),

    #[error("too many internal redirects ({count}) while redirecting to {path}")]
    TooManyRedirects { count: u32, path: String },
}

/// Returns false to end the request; the hook writes its own response.
pub type AuthHook = Arc<dyn Fn(&mut RequestContext) -> bool + Send + Sync>;
pub type RequestHook = Arc<dyn Fn(&mut RequestContext) + Send + Sync>;
pub type ErrorHook = Arc<dyn Fn(&mut RequestContext, &RequestFault) + Send + Sync>;
/// Decides whether a WebSocket upgrade request is accepted.
pub type UpgradeHook = Arc<dyn Fn(&HeaderMap) -> bool + Send + Sync>;

/// Drives a request through lookup, handler, redirects and access logging.
pub struct RequestPipeline {
    registry: Arc<EndpointRegistry>,
    auth: Option<AuthHook>,
    not_found: RequestHook,
    endpoint_error: ErrorHook,
    no_upgrade: RequestHook,
    upgrade_check: UpgradeHook,
    access_log: Arc<dyn AccessLogSink>,
}

impl RequestPipeline {
    pub fn new(registry: Arc<EndpointRegistry>) -> Self {
        Self {
            registry,
            auth: None,
            not_found: Arc::new(default_not_found),
            endpoint_error: Arc::new(default_endpoint_error),
            no_upgrade: Arc::new(default_no_upgrade),
            upgrade_check: origin_check(OriginPolicy::Localhost),
            access_log: Arc::new(NoopAccessLog),
        }
    }

    /// Pipeline with the upgrade policy and access log taken from `config`.
    pub fn from_config(registry: Arc<EndpointRegistry>, config: &RouterConfig) -> Self {
        let pipeline = Self::new(registry).with_origin_policy(config.websocket.origin_policy);
        if config.observability.access_log {
            pipeline.with_access_log(Arc::new(TracingAccessLog))
        } else {
            pipeline
        }
    }

    pub fn with_auth<F>(mut self, hook: F) -> Self
    where
        F: Fn(&mut RequestContext) -> bool + Send + Sync + 'static,
    {
        self.auth = Some(Arc::new(hook));
        self
    }

    pub fn with_not_found<F>(mut self, hook: F) -> Self
    where
        F: Fn(&mut RequestContext) + Send + Sync + 'static,
    {
        self.not_found = Arc::new(hook);
        self
    }

    pub fn with_endpoint_error<F>(mut self, hook: F) -> Self
    where
        F: Fn(&mut RequestContext, &RequestFault) + Send + Sync + 'static,
    {
        self.endpoint_error = Arc::new(hook);
        self
    }

    pub fn with_no_upgrade<F>(mut self, hook: F) -> Self
    where
        F: Fn(&mut RequestContext) + Send + Sync + 'static,
    {
        self.no_upgrade = Arc::new(hook);
        self
    }

    pub fn with_upgrade_check<F>(mut self, hook: F) -> Self
    where
        F: Fn(&HeaderMap) -> bool + Send + Sync + 'static,
    {
        self.upgrade_check = Arc::new(hook);
        self
    }

    /// Use the built-in upgrade decision for `policy`.
    pub fn with_origin_policy(mut self, policy: OriginPolicy) -> Self {
        self.upgrade_check = origin_check(policy);
        self
    }

    pub fn with_access_log(mut self, sink: Arc<dyn AccessLogSink>) -> Self {
        self.access_log = sink;
        self
    }

    pub fn registry(&self) -> &Arc<EndpointRegistry> {
        &self.registry
    }

    /// Look up the endpoint for the request line, before the body is read.
    pub fn resolve(&self, ctx: &RequestContext) -> Option<Arc<Endpoint>> {
        self.registry.find_endpoint(ctx.method(), ctx.path(), None)
    }

    /// Run auth and the upgrade decision for a WebSocket handshake.
    ///
    /// Returns true to accept. On refusal a response has been sent through
    /// the context (403 unless the auth hook sent its own).
    pub fn check_upgrade(&self, ctx: &mut RequestContext) -> bool {
        if !self.authorize(ctx) {
            return false;
        }

        let check = Arc::clone(&self.upgrade_check);
        let allowed = catch_panic(|| check(ctx.headers())).unwrap_or_else(|message| {
            tracing::error!(panic = %message, "Upgrade check panicked");
            false
        });

        if !allowed {
            tracing::debug!(
                path = %ctx.path(),
                origin = ?ctx.header(header::ORIGIN.as_str()),
                "WebSocket upgrade refused"
            );
            if !ctx.response_sent() {
                ctx.create_response()
                    .status(StatusCode::FORBIDDEN)
                    .text("WebSocket upgrade not allowed")
                    .send();
            }
        }
        allowed
    }

    /// Dispatch a request to completion.
    ///
    /// `resolved` is the endpoint found during the header phase, reused for
    /// the first iteration instead of a second lookup.
    pub fn handle(&self, mut ctx: RequestContext, resolved: Option<Arc<Endpoint>>) -> AccessRecord {
        let start = Instant::now();
        let mut pre_resolved = resolved.is_some();
        ctx.set_endpoint(resolved);

        if self.authorize(&mut ctx) {
            loop {
                let endpoint = if pre_resolved {
                    pre_resolved = false;
                    ctx.endpoint().cloned()
                } else {
                    let found = self.registry.find_endpoint(
                        ctx.method(),
                        ctx.path(),
                        ctx.redirect_state().ignore_tag(),
                    );
                    ctx.set_endpoint(found.clone());
                    found
                };

                self.dispatch(&mut ctx, endpoint);

                let Some(next) = ctx.redirect_state_mut().take_pending() else {
                    break;
                };
                let count = ctx.redirect_state().redirect_count();
                if count > MAX_INTERNAL_REDIRECTS {
                    let fault = RequestFault::TooManyRedirects { count, path: next };
                    self.report_fault(&mut ctx, fault);
                    break;
                }

                tracing::debug!(
                    from = %ctx.path(),
                    to = %next,
                    count,
                    "Internal redirect"
                );
                metrics::record_redirect();
                ctx.set_path(&next);
            }
        }

        if !ctx.response_sent() {
            tracing::warn!(
                method = %ctx.method(),
                path = %ctx.original_path(),
                "Request finished without a response"
            );
        }

        self.record_access(&ctx, ctx.sent_status(), start)
    }

    /// Emit the access record and request metrics for a finished request.
    ///
    /// `status` is what reached the client; `None` is recorded as `-1`.
    /// Handshakes use this directly with 101 or the refusal status.
    pub fn record_access(
        &self,
        ctx: &RequestContext,
        status: Option<u16>,
        start: Instant,
    ) -> AccessRecord {
        let record = AccessRecord {
            client_addr: ctx.remote_addr(),
            method: ctx.method().to_string(),
            path: ctx.original_path().to_string(),
            protocol: ctx.protocol().to_string(),
            status: status.map(i32::from).unwrap_or(-1),
            elapsed_ms: start.elapsed().as_millis(),
        };
        metrics::record_request(&record.method, record.status, start);
        self.access_log.record(&record);
        record
    }

    fn authorize(&self, ctx: &mut RequestContext) -> bool {
        let Some(auth) = self.auth.clone() else {
            return true;
        };
        match catch_panic(|| auth(ctx)) {
            Ok(allowed) => allowed,
            Err(message) => {
                self.report_fault(ctx, RequestFault::Panicked(message));
                false
            }
        }
    }

    fn dispatch(&self, ctx: &mut RequestContext, endpoint: Option<Arc<Endpoint>>) {
        let Some(endpoint) = endpoint else {
            self.run_hook("not_found", &self.not_found, ctx);
            return;
        };

        let handler = match endpoint.handler() {
            Some(handler) if !endpoint.websocket_upgrade_allowed() => Arc::clone(handler),
            // Plain HTTP on an upgrade-capable endpoint never reaches a handler.
            _ => {
                self.run_hook("no_upgrade", &self.no_upgrade, ctx);
                return;
            }
        };

        match catch_panic(|| handler(ctx)) {
            Ok(Ok(())) => {}
            Ok(Err(e)) => self.report_fault(ctx, RequestFault::Handler(e)),
            Err(message) => self.report_fault(ctx, RequestFault::Panicked(message)),
        }
    }

    fn report_fault(&self, ctx: &mut RequestContext, fault: RequestFault) {
        let hook = Arc::clone(&self.endpoint_error);
        if let Err(message) = catch_panic(|| hook(ctx, &fault)) {
            tracing::error!(panic = %message, error = %fault, "Endpoint error hook panicked");
        }
    }

    fn run_hook(&self, name: &'static str, hook: &RequestHook, ctx: &mut RequestContext) {
        let hook = Arc::clone(hook);
        if let Err(message) = catch_panic(|| hook(ctx)) {
            tracing::error!(hook = name, panic = %message, "Request hook panicked");
        }
    }
}

fn default_not_found(ctx: &mut RequestContext) {
    let body = format!("No endpoint registered for {} {}", ctx.method(), ctx.path());
    ctx.create_response()
        .status(StatusCode::NOT_FOUND)
        .text(body)
        .send();
}

fn default_endpoint_error(ctx: &mut RequestContext, fault: &RequestFault) {
    tracing::error!(
        request_id = ?ctx.request_id(),
        method = %ctx.method(),
        path = %ctx.path(),
        error = %fault,
        "Endpoint failed"
    );
    if !ctx.response_sent() {
        ctx.create_response()
            .status(StatusCode::INTERNAL_SERVER_ERROR)
            .text("Internal server error")
            .send();
    }
}

fn default_no_upgrade(ctx: &mut RequestContext) {
    ctx.create_response()
        .status(StatusCode::UPGRADE_REQUIRED)
        .header(header::UPGRADE.as_str(), "websocket")
        .text("This endpoint only accepts WebSocket connections")
        .send();
}

/// Built-in upgrade decision for an [`OriginPolicy`].
pub fn origin_check(policy: OriginPolicy) -> UpgradeHook {
    match policy {
        OriginPolicy::AllowAll => Arc::new(|_| true),
        OriginPolicy::Localhost => Arc::new(|headers: &HeaderMap| {
            headers
                .get(header::ORIGIN)
                .and_then(|v| v.to_str().ok())
                .map(|origin| origin.starts_with("http://localhost"))
                .unwrap_or(false)
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::request::RecordingSink;
    use crate::routing::{HttpMethod, Route, Tag};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    fn request(method: HttpMethod, path: &str) -> (RequestContext, RecordingSink) {
        let sink = RecordingSink::new();
        (RequestContext::new(method, path, Box::new(sink.clone())), sink)
    }

    fn text(ctx: &mut RequestContext, body: &str) -> Result<(), BoxError> {
        ctx.create_response().text(body.to_string()).send();
        Ok(())
    }

    #[test]
    fn echo_template_route() {
        let registry = Arc::new(EndpointRegistry::new());
        registry
            .register(HttpMethod::Get, "/echo/{word}", |ctx: &mut RequestContext| {
                let word = ctx.path_param("word").unwrap_or_default().to_string();
                text(ctx, &word)
            }, None)
            .unwrap();
        let pipeline = RequestPipeline::new(Arc::clone(&registry));

        let (ctx, sink) = request(HttpMethod::Get, "/echo/hello");
        let record = pipeline.handle(ctx, None);
        assert_eq!(record.status, 200);
        assert_eq!(sink.last().unwrap().body_text(), "hello");

        let (ctx, sink) = request(HttpMethod::Get, "/echo/hello/");
        let record = pipeline.handle(ctx, None);
        assert_eq!(record.status, 404);
        assert_eq!(
            sink.last().unwrap().body_text(),
            "No endpoint registered for GET /echo/hello/"
        );
    }

    #[test]
    fn pre_resolved_endpoint_gets_path_params() {
        let registry = Arc::new(EndpointRegistry::new());
        registry
            .register(HttpMethod::Get, "/items/{id}", |ctx: &mut RequestContext| {
                let id = ctx.path_param("id").unwrap_or("none").to_string();
                text(ctx, &id)
            }, None)
            .unwrap();
        let pipeline = RequestPipeline::new(registry);

        let (ctx, sink) = request(HttpMethod::Get, "/items/7");
        let resolved = pipeline.resolve(&ctx);
        assert!(resolved.is_some());
        pipeline.handle(ctx, resolved);
        assert_eq!(sink.last().unwrap().body_text(), "7");
    }

    #[test]
    fn handler_error_and_panic_become_500() {
        let registry = Arc::new(EndpointRegistry::new());
        registry
            .register(HttpMethod::Get, "/fail", |_: &mut RequestContext| Err("nope".into()), None)
            .unwrap();
        registry
            .register(HttpMethod::Get, "/panic", |_: &mut RequestContext| -> Result<(), BoxError> {
                panic!("handler blew up")
            }, None)
            .unwrap();
        let pipeline = RequestPipeline::new(registry);

        for path in ["/fail", "/panic"] {
            let (ctx, sink) = request(HttpMethod::Get, path);
            let record = pipeline.handle(ctx, None);
            assert_eq!(record.status, 500);
            assert_eq!(sink.last().unwrap().body_text(), "Internal server error");
        }
    }

    #[test]
    fn self_redirect_hits_ceiling_once() {
        let registry = Arc::new(EndpointRegistry::new());
        let invocations = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&invocations);
        registry
            .register(HttpMethod::Get, "/loop", move |ctx: &mut RequestContext| {
                counter.fetch_add(1, Ordering::SeqCst);
                ctx.schedule_internal_redirect("/loop");
                Ok(())
            }, None)
            .unwrap();

        let faults = Arc::new(Mutex::new(Vec::new()));
        let seen = Arc::clone(&faults);
        let pipeline = RequestPipeline::new(registry).with_endpoint_error(move |ctx, fault| {
            seen.lock().unwrap().push(matches!(fault, RequestFault::TooManyRedirects { count: 51, .. }));
            ctx.create_response()
                .status(StatusCode::LOOP_DETECTED)
                .send();
        });

        let (ctx, _) = request(HttpMethod::Get, "/loop");
        let record = pipeline.handle(ctx, None);

        assert_eq!(invocations.load(Ordering::SeqCst), 51);
        assert_eq!(*faults.lock().unwrap(), vec![true]);
        assert_eq!(record.status, 508);
        assert_eq!(record.path, "/loop");
    }

    #[test]
    fn redirect_can_skip_tagged_endpoints() {
        let registry = Arc::new(EndpointRegistry::new());
        let tag = Tag::new();
        registry
            .register(HttpMethod::Get, Route::Regex("/.*".into()), move |ctx: &mut RequestContext| {
                if ctx.redirect_state().redirect_count() == 0 {
                    ctx.schedule_internal_redirect_ignoring("/real", tag);
                    Ok(())
                } else {
                    text(ctx, "intercepted")
                }
            }, Some(tag))
            .unwrap();
        registry
            .register(HttpMethod::Get, "/real", |ctx: &mut RequestContext| text(ctx, "real"), None)
            .unwrap();
        let pipeline = RequestPipeline::new(registry);

        let (ctx, sink) = request(HttpMethod::Get, "/anything");
        let record = pipeline.handle(ctx, None);
        assert_eq!(sink.last().unwrap().body_text(), "real");
        assert_eq!(record.path, "/anything");
    }

    #[test]
    fn no_response_is_recorded_as_minus_one() {
        let registry = Arc::new(EndpointRegistry::new());
        registry
            .register(HttpMethod::Post, "/silent", |_: &mut RequestContext| Ok(()), None)
            .unwrap();
        let records = Arc::new(Mutex::new(Vec::new()));
        let store = Arc::clone(&records);
        let pipeline = RequestPipeline::new(registry).with_access_log(Arc::new(
            move |record: &AccessRecord| store.lock().unwrap().push(record.clone()),
        ));

        let (ctx, sink) = request(HttpMethod::Post, "/silent");
        pipeline.handle(ctx, None);
        assert!(sink.responses().is_empty());

        let records = records.lock().unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].status, -1);
        assert_eq!(records[0].method, "POST");
    }

    #[test]
    fn auth_hook_can_end_request() {
        let registry = Arc::new(EndpointRegistry::new());
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);
        registry
            .register(HttpMethod::Get, "/private", move |ctx: &mut RequestContext| {
                counter.fetch_add(1, Ordering::SeqCst);
                text(ctx, "secret")
            }, None)
            .unwrap();
        let pipeline = RequestPipeline::new(registry).with_auth(|ctx| {
            if ctx.header("authorization") == Some("Bearer ok") {
                return true;
            }
            ctx.create_response().status(StatusCode::UNAUTHORIZED).send();
            false
        });

        let (ctx, sink) = request(HttpMethod::Get, "/private");
        assert_eq!(pipeline.handle(ctx, None).status, 401);
        assert!(sink.last().is_some());
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn websocket_only_endpoint_needs_upgrade() {
        let registry = Arc::new(EndpointRegistry::new());
        registry
            .register_websocket_endpoint("/ws", Arc::new(|_| Ok(())), None)
            .unwrap();
        let pipeline = RequestPipeline::new(registry);

        let (ctx, _) = request(HttpMethod::Get, "/ws");
        assert_eq!(pipeline.handle(ctx, None).status, 426);
    }

    #[test]
    fn upgradable_endpoint_skips_http_handler() {
        let registry = Arc::new(EndpointRegistry::new());
        let http_hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&http_hits);
        let endpoint = Endpoint::builder(HttpMethod::Get)
            .exact("/ws")
            .handler(move |ctx: &mut RequestContext| {
                counter.fetch_add(1, Ordering::SeqCst);
                text(ctx, "http handler ran")
            })
            .websocket(|_| Ok(()))
            .build()
            .unwrap();
        registry.register_endpoint(endpoint);
        let pipeline = RequestPipeline::new(registry);

        let (ctx, sink) = request(HttpMethod::Get, "/ws");
        assert_eq!(pipeline.handle(ctx, None).status, 426);
        assert_eq!(http_hits.load(Ordering::SeqCst), 0);
        let response = sink.last().unwrap();
        assert_eq!(response.headers[header::UPGRADE], "websocket");
    }

    #[test]
    fn handshake_access_record_uses_given_status() {
        let records = Arc::new(Mutex::new(Vec::new()));
        let seen = Arc::clone(&records);
        let pipeline = RequestPipeline::new(Arc::new(EndpointRegistry::new()))
            .with_access_log(Arc::new(move |record: &AccessRecord| {
                seen.lock().unwrap().push((record.path.clone(), record.status));
            }));

        let (ctx, _) = request(HttpMethod::Get, "/ws/feed");
        let record = pipeline.record_access(&ctx, Some(101), Instant::now());
        assert_eq!(record.status, 101);

        let (ctx, _) = request(HttpMethod::Get, "/ws/feed");
        pipeline.record_access(&ctx, None, Instant::now());

        assert_eq!(
            *records.lock().unwrap(),
            vec![("/ws/feed".to_string(), 101), ("/ws/feed".to_string(), -1)]
        );
    }

    #[test]
    fn localhost_origin_policy() {
        let pipeline = RequestPipeline::new(Arc::new(EndpointRegistry::new()));

        let mut headers = HeaderMap::new();
        headers.insert(header::ORIGIN, "http://localhost:3000".parse().unwrap());
        let (ctx, _) = request(HttpMethod::Get, "/ws");
        let mut ctx = ctx.with_headers(headers);
        assert!(pipeline.check_upgrade(&mut ctx));

        let mut headers = HeaderMap::new();
        headers.insert(header::ORIGIN, "http://evil.example".parse().unwrap());
        let (ctx, sink) = request(HttpMethod::Get, "/ws");
        let mut ctx = ctx.with_headers(headers);
        assert!(!pipeline.check_upgrade(&mut ctx));
        assert_eq!(sink.last().unwrap().status, StatusCode::FORBIDDEN);

        let (mut ctx, _) = request(HttpMethod::Get, "/ws");
        assert!(!pipeline.check_upgrade(&mut ctx));

        let open = RequestPipeline::new(Arc::new(EndpointRegistry::new()))
            .with_origin_policy(OriginPolicy::AllowAll);
        let (mut ctx, _) = request(HttpMethod::Get, "/ws");
        assert!(open.check_upgrade(&mut ctx));
    }
}
