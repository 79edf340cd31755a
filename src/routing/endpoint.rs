//! Endpoint definitions.
//!
//! # Responsibilities
//! - Describe one routable endpoint (method, matcher, handlers, tag)
//! - Validate endpoint definitions before they reach the registry
//! - Provide identity types for tags and WebSocket endpoints
//!
//! # Design Decisions
//! - Exact routes compare ASCII case-insensitively
//! - Regex and template routes match with a compiled `Regex`
//! - Tags compare by identity (a process-unique counter), never by content

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use regex::Regex;
use thiserror::Error;
use uuid::Uuid;

use crate::http::request::RequestContext;
use crate::http::websocket::Frame;
use crate::routing::template::{parse_template, FormatError, PathParamValue, PathTemplate};
use crate::BoxError;

/// Request handler invoked on a worker thread.
pub type Handler = Arc<dyn Fn(&mut RequestContext) -> Result<(), BoxError> + Send + Sync>;

/// WebSocket frame handler invoked for every data frame a session receives.
pub type FrameHandler = Arc<dyn Fn(Frame) -> Result<(), BoxError> + Send + Sync>;

/// Errors raised while validating an endpoint registration.
#[derive(Debug, Error)]
pub enum RegistrationError {
    /// Missing handler, or neither/both of exact path and regex set.
    #[error("invalid endpoint definition: {0}")]
    Argument(String),

    /// The path template was malformed.
    #[error(transparent)]
    Format(#[from] FormatError),

    /// A raw regex route failed to compile.
    #[error("invalid route regex `{pattern}`: {reason}")]
    InvalidRegex { pattern: String, reason: String },
}

/// HTTP methods the registry keeps tables for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HttpMethod {
    Head,
    Get,
    Post,
    Put,
    Patch,
    Delete,
    Options,
}

impl HttpMethod {
    /// Every supported method, in table order.
    pub const ALL: [HttpMethod; 7] = [
        HttpMethod::Head,
        HttpMethod::Get,
        HttpMethod::Post,
        HttpMethod::Put,
        HttpMethod::Patch,
        HttpMethod::Delete,
        HttpMethod::Options,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            HttpMethod::Head => "HEAD",
            HttpMethod::Get => "GET",
            HttpMethod::Post => "POST",
            HttpMethod::Put => "PUT",
            HttpMethod::Patch => "PATCH",
            HttpMethod::Delete => "DELETE",
            HttpMethod::Options => "OPTIONS",
        }
    }

    pub(crate) fn index(&self) -> usize {
        *self as usize
    }
}

impl fmt::Display for HttpMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Returned when a request uses a method without a routing table.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unsupported HTTP method: {0}")]
pub struct UnsupportedMethod(pub String);

impl FromStr for HttpMethod {
    type Err = UnsupportedMethod;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        HttpMethod::ALL
            .into_iter()
            .find(|m| m.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| UnsupportedMethod(s.to_string()))
    }
}

impl TryFrom<&axum::http::Method> for HttpMethod {
    type Error = UnsupportedMethod;

    fn try_from(method: &axum::http::Method) -> Result<Self, Self::Error> {
        method.as_str().parse()
    }
}

/// Global counter for tag identities.
static TAG_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Opaque grouping token attached to endpoints.
///
/// Two tags are equal only if one was copied from the other.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Tag(u64);

impl Tag {
    /// Allocate a fresh tag.
    pub fn new() -> Self {
        Self(TAG_COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl Default for Tag {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tag-{}", self.0)
    }
}

/// Addressing handle for a WebSocket endpoint, used for broadcasts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WsEndpointId(Uuid);

impl WsEndpointId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for WsEndpointId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for WsEndpointId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ws-{}", self.0)
    }
}

/// How an endpoint decides whether it handles a path.
#[derive(Debug, Clone)]
pub enum MatchKind {
    /// Case-insensitive equality.
    Exact(String),
    /// Regex match. `pattern` is the text as registered (raw regex or
    /// path template).
    Regex { pattern: String, regex: Regex },
}

/// A registered endpoint.
#[derive(Clone)]
pub struct Endpoint {
    method: HttpMethod,
    matcher: MatchKind,
    handler: Option<Handler>,
    template: Option<Arc<PathTemplate>>,
    ws_handler: Option<FrameHandler>,
    ws_id: Option<WsEndpointId>,
    tag: Option<Tag>,
    label: Option<String>,
}

impl Endpoint {
    /// Start defining an endpoint for `method`.
    pub fn builder(method: HttpMethod) -> EndpointBuilder {
        EndpointBuilder::new(method)
    }

    pub fn method(&self) -> HttpMethod {
        self.method
    }

    pub fn matcher(&self) -> &MatchKind {
        &self.matcher
    }

    pub fn handler(&self) -> Option<&Handler> {
        self.handler.as_ref()
    }

    pub fn template(&self) -> Option<&PathTemplate> {
        self.template.as_deref()
    }

    pub fn ws_handler(&self) -> Option<&FrameHandler> {
        self.ws_handler.as_ref()
    }

    pub fn ws_id(&self) -> Option<WsEndpointId> {
        self.ws_id
    }

    pub fn tag(&self) -> Option<Tag> {
        self.tag
    }

    pub fn label(&self) -> Option<&str> {
        self.label.as_deref()
    }

    /// The exact path, for exact routes.
    pub fn exact_path(&self) -> Option<&str> {
        match &self.matcher {
            MatchKind::Exact(path) => Some(path),
            MatchKind::Regex { .. } => None,
        }
    }

    /// The registered pattern text, for regex and template routes.
    pub fn pattern(&self) -> Option<&str> {
        match &self.matcher {
            MatchKind::Exact(_) => None,
            MatchKind::Regex { pattern, .. } => Some(pattern),
        }
    }

    /// True when this endpoint accepts WebSocket upgrades.
    pub fn websocket_upgrade_allowed(&self) -> bool {
        self.ws_handler.is_some()
    }

    /// Returns true if this endpoint structurally matches `path`.
    pub fn can_handle(&self, path: &str) -> bool {
        match &self.matcher {
            MatchKind::Exact(expected) => expected.eq_ignore_ascii_case(path),
            MatchKind::Regex { regex, .. } => regex.is_match(path),
        }
    }

    /// Path parameter values for `path`; empty for non-template routes.
    pub fn path_params(&self, path: &str) -> HashMap<String, PathParamValue> {
        self.template
            .as_ref()
            .map(|t| t.extract(path))
            .unwrap_or_default()
    }

    /// Short description used in logs.
    pub fn describe(&self) -> String {
        let route = match &self.matcher {
            MatchKind::Exact(path) => path.as_str(),
            MatchKind::Regex { pattern, .. } => pattern.as_str(),
        };
        match &self.label {
            Some(label) => format!("{} {} ({})", self.method, route, label),
            None => format!("{} {}", self.method, route),
        }
    }

    pub(crate) fn assign_ws_id(&mut self, id: WsEndpointId) {
        self.ws_id = Some(id);
    }
}

impl fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Endpoint")
            .field("method", &self.method)
            .field("matcher", &self.matcher)
            .field("has_handler", &self.handler.is_some())
            .field("template", &self.template.as_ref().map(|t| t.source()))
            .field("ws_id", &self.ws_id)
            .field("tag", &self.tag)
            .field("label", &self.label)
            .finish()
    }
}

/// Route text as supplied by the caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    Exact(String),
    Regex(String),
    /// Path template with `{name}` segments.
    Template(String),
}

impl Route {
    /// Classify free-form route text: anything containing `{` is a
    /// template, everything else an exact path.
    pub fn infer(text: impl Into<String>) -> Self {
        let text = text.into();
        if text.contains('{') {
            Route::Template(text)
        } else {
            Route::Exact(text)
        }
    }
}

impl From<&str> for Route {
    fn from(text: &str) -> Self {
        Route::infer(text)
    }
}

impl From<String> for Route {
    fn from(text: String) -> Self {
        Route::infer(text)
    }
}

/// Builder that validates an [`Endpoint`] definition.
pub struct EndpointBuilder {
    method: HttpMethod,
    exact: Option<String>,
    regex: Option<Route>,
    handler: Option<Handler>,
    ws_handler: Option<FrameHandler>,
    tag: Option<Tag>,
    label: Option<String>,
}

impl EndpointBuilder {
    pub fn new(method: HttpMethod) -> Self {
        Self {
            method,
            exact: None,
            regex: None,
            handler: None,
            ws_handler: None,
            tag: None,
            label: None,
        }
    }

    /// Match `path` exactly (case-insensitive).
    pub fn exact(mut self, path: impl Into<String>) -> Self {
        self.exact = Some(path.into());
        self
    }

    /// Match with a raw regex.
    pub fn regex(mut self, pattern: impl Into<String>) -> Self {
        self.regex = Some(Route::Regex(pattern.into()));
        self
    }

    /// Match with a `{name}` path template.
    pub fn template(mut self, template: impl Into<String>) -> Self {
        self.regex = Some(Route::Template(template.into()));
        self
    }

    /// Set the matcher from a [`Route`].
    pub fn route(self, route: impl Into<Route>) -> Self {
        match route.into() {
            Route::Exact(path) => self.exact(path),
            Route::Regex(pattern) => self.regex(pattern),
            Route::Template(template) => self.template(template),
        }
    }

    pub fn handler<F>(mut self, handler: F) -> Self
    where
        F: Fn(&mut RequestContext) -> Result<(), BoxError> + Send + Sync + 'static,
    {
        self.handler = Some(Arc::new(handler));
        self
    }

    pub fn handler_arc(mut self, handler: Handler) -> Self {
        self.handler = Some(handler);
        self
    }

    /// Accept WebSocket upgrades on this endpoint.
    pub fn websocket<F>(mut self, frame_handler: F) -> Self
    where
        F: Fn(Frame) -> Result<(), BoxError> + Send + Sync + 'static,
    {
        self.ws_handler = Some(Arc::new(frame_handler));
        self
    }

    pub fn websocket_arc(mut self, frame_handler: FrameHandler) -> Self {
        self.ws_handler = Some(frame_handler);
        self
    }

    pub fn tag(mut self, tag: Tag) -> Self {
        self.tag = Some(tag);
        self
    }

    pub fn maybe_tag(mut self, tag: Option<Tag>) -> Self {
        self.tag = tag;
        self
    }

    pub fn label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    /// Validate and compile the endpoint.
    pub fn build(self) -> Result<Endpoint, RegistrationError> {
        if self.handler.is_none() && self.ws_handler.is_none() {
            return Err(RegistrationError::Argument(format!(
                "{} endpoint has no handler",
                self.method
            )));
        }

        let (matcher, template) = match (self.exact, self.regex) {
            (Some(_), Some(_)) => {
                return Err(RegistrationError::Argument(
                    "both an exact path and a regex were set".to_string(),
                ))
            }
            (None, None) => {
                return Err(RegistrationError::Argument(
                    "neither an exact path nor a regex was set".to_string(),
                ))
            }
            (Some(path), None) => (MatchKind::Exact(path), None),
            (None, Some(Route::Regex(pattern))) => {
                let regex = Regex::new(&pattern).map_err(|e| RegistrationError::InvalidRegex {
                    pattern: pattern.clone(),
                    reason: e.to_string(),
                })?;
                (MatchKind::Regex { pattern, regex }, None)
            }
            (None, Some(Route::Template(text))) | (None, Some(Route::Exact(text))) => {
                match parse_template(&text)? {
                    Some(template) => (
                        MatchKind::Regex {
                            pattern: text,
                            regex: template.regex().clone(),
                        },
                        Some(Arc::new(template)),
                    ),
                    // A template without parameters is an exact route.
                    None => (MatchKind::Exact(text), None),
                }
            }
        };

        Ok(Endpoint {
            method: self.method,
            matcher,
            handler: self.handler,
            template,
            ws_handler: self.ws_handler,
            ws_id: None,
            tag: self.tag,
            label: self.label,
        })
    }
}
