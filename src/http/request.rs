//! Per-request context handed to endpoint handlers.
//!
//! # Responsibilities
//! - Expose the parsed request (path, query, headers, body, path parameters)
//! - Own the response sink and remember whether a response went out
//! - Carry internal-redirect state between dispatch iterations
//!
//! # Design Decisions
//! - Identity fields are fixed at construction; only the resolved endpoint,
//!   the current path and the redirect state change during dispatch
//! - A second send on the same context is refused, never forwarded to the wire
//! - Query values are percent-decoded; the path is kept exactly as received

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use axum::body::Bytes;
use axum::http::HeaderMap;
use serde::de::DeserializeOwned;
use tokio::sync::oneshot;

use crate::http::response::{OutgoingResponse, ResponseBuilder};
use crate::routing::{Endpoint, HttpMethod, PathParamValue, Tag};

/// Where a finished response is delivered.
pub trait ResponseSink: Send {
    /// Hand a response to the transport. Returns false if the transport is
    /// gone or will not accept it.
    fn send(&mut self, response: OutgoingResponse) -> bool;
}

/// Sink that completes a tokio oneshot awaited by the connection task.
pub struct OneshotSink {
    tx: Option<oneshot::Sender<OutgoingResponse>>,
}

impl OneshotSink {
    pub fn channel() -> (Self, oneshot::Receiver<OutgoingResponse>) {
        let (tx, rx) = oneshot::channel();
        (Self { tx: Some(tx) }, rx)
    }
}

impl ResponseSink for OneshotSink {
    fn send(&mut self, response: OutgoingResponse) -> bool {
        match self.tx.take() {
            Some(tx) => tx.send(response).is_ok(),
            None => false,
        }
    }
}

/// Sink that stores every response it is given. Useful for driving the
/// request pipeline without a network layer.
#[derive(Clone, Default)]
pub struct RecordingSink {
    responses: Arc<Mutex<Vec<OutgoingResponse>>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Responses recorded so far.
    pub fn responses(&self) -> Vec<OutgoingResponse> {
        self.responses
            .lock()
            .map(|r| r.clone())
            .unwrap_or_default()
    }

    pub fn last(&self) -> Option<OutgoingResponse> {
        self.responses().pop()
    }
}

impl ResponseSink for RecordingSink {
    fn send(&mut self, response: OutgoingResponse) -> bool {
        match self.responses.lock() {
            Ok(mut responses) => {
                responses.push(response);
                true
            }
            Err(_) => false,
        }
    }
}

/// Internal redirect bookkeeping for one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RedirectState {
    original_path: String,
    pending_path: Option<String>,
    ignore_tag: Option<Tag>,
    redirect_count: u32,
}

impl RedirectState {
    pub fn new(original_path: impl Into<String>) -> Self {
        Self {
            original_path: original_path.into(),
            pending_path: None,
            ignore_tag: None,
            redirect_count: 0,
        }
    }

    pub fn original_path(&self) -> &str {
        &self.original_path
    }

    pub fn pending_path(&self) -> Option<&str> {
        self.pending_path.as_deref()
    }

    pub fn ignore_tag(&self) -> Option<Tag> {
        self.ignore_tag
    }

    pub fn redirect_count(&self) -> u32 {
        self.redirect_count
    }

    pub(crate) fn schedule(&mut self, path: String, ignore_tag: Option<Tag>) {
        self.pending_path = Some(path);
        self.ignore_tag = ignore_tag;
    }

    /// Consume the pending hop, bumping the counter. Returns the new path.
    pub(crate) fn take_pending(&mut self) -> Option<String> {
        let path = self.pending_path.take()?;
        self.redirect_count += 1;
        Some(path)
    }
}

/// Everything a handler knows about the request it is serving.
pub struct RequestContext {
    request_id: Option<String>,
    method: HttpMethod,
    path: String,
    query: Vec<(String, String)>,
    headers: HeaderMap,
    body: Bytes,
    remote_addr: Option<SocketAddr>,
    protocol: String,
    path_params: HashMap<String, PathParamValue>,
    sink: Box<dyn ResponseSink>,
    sent_status: Option<u16>,
    redirect: RedirectState,
    endpoint: Option<Arc<Endpoint>>,
}

impl RequestContext {
    /// Build a context for `method` on `path_and_query` (e.g. `/a/b?x=1`).
    pub fn new(method: HttpMethod, path_and_query: &str, sink: Box<dyn ResponseSink>) -> Self {
        let (path, query) = split_path_and_query(path_and_query);
        let query = query.map(parse_query).unwrap_or_default();

        Self {
            request_id: None,
            method,
            path: path.to_string(),
            query,
            headers: HeaderMap::new(),
            body: Bytes::new(),
            remote_addr: None,
            protocol: "HTTP/1.1".to_string(),
            path_params: HashMap::new(),
            sink,
            sent_status: None,
            redirect: RedirectState::new(path),
            endpoint: None,
        }
    }

    pub fn with_headers(mut self, headers: HeaderMap) -> Self {
        self.headers = headers;
        self
    }

    pub fn with_body(mut self, body: Bytes) -> Self {
        self.body = body;
        self
    }

    pub fn with_remote_addr(mut self, addr: SocketAddr) -> Self {
        self.remote_addr = Some(addr);
        self
    }

    pub fn with_protocol(mut self, protocol: impl Into<String>) -> Self {
        self.protocol = protocol.into();
        self
    }

    pub fn with_request_id(mut self, id: impl Into<String>) -> Self {
        self.request_id = Some(id.into());
        self
    }

    /// Value of the `x-request-id` header assigned at the edge, if any.
    pub fn request_id(&self) -> Option<&str> {
        self.request_id.as_deref()
    }

    pub fn method(&self) -> HttpMethod {
        self.method
    }

    /// Path currently being dispatched. Changes on internal redirect.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Path the client asked for.
    pub fn original_path(&self) -> &str {
        self.redirect.original_path()
    }

    /// First value of query parameter `name`.
    pub fn query(&self, name: &str) -> Option<&str> {
        self.query
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    /// Every value of query parameter `name`, in request order.
    pub fn query_all(&self, name: &str) -> Vec<&str> {
        self.query
            .iter()
            .filter(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
            .collect()
    }

    pub fn query_pairs(&self) -> &[(String, String)] {
        &self.query
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// Header value as text; `None` if absent or not visible ASCII.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    pub fn body(&self) -> &Bytes {
        &self.body
    }

    /// Body decoded as UTF-8, lossily.
    pub fn body_text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    /// Body deserialized from JSON.
    pub fn json<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_slice(&self.body)
    }

    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.remote_addr
    }

    pub fn protocol(&self) -> &str {
        &self.protocol
    }

    /// Value of path parameter `name` from the matched template.
    pub fn path_param(&self, name: &str) -> Option<&str> {
        self.path_params.get(name).map(|p| p.value.as_str())
    }

    pub fn path_params(&self) -> &HashMap<String, PathParamValue> {
        &self.path_params
    }

    /// Endpoint resolved for the current dispatch iteration.
    pub fn endpoint(&self) -> Option<&Arc<Endpoint>> {
        self.endpoint.as_ref()
    }

    pub fn redirect_state(&self) -> &RedirectState {
        &self.redirect
    }

    /// True once a response has been handed to the transport.
    pub fn response_sent(&self) -> bool {
        self.sent_status.is_some()
    }

    /// Status of the response sent, if any.
    pub fn sent_status(&self) -> Option<u16> {
        self.sent_status
    }

    /// Start building the response for this request.
    pub fn create_response(&mut self) -> ResponseBuilder<'_> {
        ResponseBuilder::new(self)
    }

    /// Re-dispatch this request on `path` once the current handler returns.
    pub fn schedule_internal_redirect(&mut self, path: impl Into<String>) {
        self.redirect.schedule(path.into(), None);
    }

    /// Like [`schedule_internal_redirect`](Self::schedule_internal_redirect),
    /// but endpoints tagged `ignore_tag` are skipped on the next lookup.
    pub fn schedule_internal_redirect_ignoring(&mut self, path: impl Into<String>, ignore_tag: Tag) {
        self.redirect.schedule(path.into(), Some(ignore_tag));
    }

    /// Deliver `response`. Returns false if one was already sent or the
    /// transport refused it.
    pub(crate) fn send_response(&mut self, response: OutgoingResponse) -> bool {
        if let Some(status) = self.sent_status {
            tracing::warn!(
                path = %self.path,
                previous_status = status,
                attempted_status = response.status.as_u16(),
                "Response already sent; ignoring second send"
            );
            return false;
        }

        let status = response.status.as_u16();
        if self.sink.send(response) {
            self.sent_status = Some(status);
            true
        } else {
            tracing::debug!(path = %self.path, status, "Transport refused response");
            false
        }
    }

    pub(crate) fn set_endpoint(&mut self, endpoint: Option<Arc<Endpoint>>) {
        self.path_params = endpoint
            .as_ref()
            .map(|e| e.path_params(&self.path))
            .unwrap_or_default();
        self.endpoint = endpoint;
    }

    /// Point the context at a redirect target. A target carrying its own
    /// query string replaces the current query parameters.
    pub(crate) fn set_path(&mut self, target: &str) {
        let (path, query) = split_path_and_query(target);
        self.path = path.to_string();
        if let Some(query) = query {
            self.query = parse_query(query);
        }
    }

    pub(crate) fn redirect_state_mut(&mut self) -> &mut RedirectState {
        &mut self.redirect
    }
}

fn split_path_and_query(path_and_query: &str) -> (&str, Option<&str>) {
    let (path, query) = match path_and_query.split_once('?') {
        Some((path, query)) => (path, Some(query)),
        None => (path_and_query, None),
    };
    (if path.is_empty() { "/" } else { path }, query)
}

fn parse_query(query: &str) -> Vec<(String, String)> {
    url::form_urlencoded::parse(query.as_bytes())
        .into_owned()
        .collect()
}
