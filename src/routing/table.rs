//! Bulk route registration.
//!
//! A [`RouteTable`] collects endpoint definitions and installs them under a
//! single shared [`Tag`], so a plugin or subsystem can later remove
//! everything it added with one call.

use std::sync::Arc;

use crate::http::request::RequestContext;
use crate::routing::endpoint::{
    Endpoint, EndpointBuilder, FrameHandler, Handler, HttpMethod, RegistrationError, Route, Tag,
};
use crate::routing::registry::EndpointRegistry;
use crate::BoxError;

struct Entry {
    method: HttpMethod,
    route: Route,
    handler: Option<Handler>,
    ws_handler: Option<FrameHandler>,
    label: Option<String>,
}

/// Ordered set of routes installed together.
#[derive(Default)]
pub struct RouteTable {
    entries: Vec<Entry>,
}

impl RouteTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an HTTP route.
    pub fn route<F>(mut self, method: HttpMethod, route: impl Into<Route>, handler: F) -> Self
    where
        F: Fn(&mut RequestContext) -> Result<(), BoxError> + Send + Sync + 'static,
    {
        self.entries.push(Entry {
            method,
            route: route.into(),
            handler: Some(Arc::new(handler)),
            ws_handler: None,
            label: None,
        });
        self
    }

    pub fn get<F>(self, route: impl Into<Route>, handler: F) -> Self
    where
        F: Fn(&mut RequestContext) -> Result<(), BoxError> + Send + Sync + 'static,
    {
        self.route(HttpMethod::Get, route, handler)
    }

    pub fn post<F>(self, route: impl Into<Route>, handler: F) -> Self
    where
        F: Fn(&mut RequestContext) -> Result<(), BoxError> + Send + Sync + 'static,
    {
        self.route(HttpMethod::Post, route, handler)
    }

    /// Add a GET route that accepts WebSocket upgrades.
    pub fn websocket(mut self, route: impl Into<Route>, frame_handler: FrameHandler) -> Self {
        self.entries.push(Entry {
            method: HttpMethod::Get,
            route: route.into(),
            handler: None,
            ws_handler: Some(frame_handler),
            label: None,
        });
        self
    }

    /// Label the most recently added route.
    pub fn label(mut self, label: impl Into<String>) -> Self {
        if let Some(last) = self.entries.last_mut() {
            last.label = Some(label.into());
        }
        self
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Validate every entry, then register them all under a fresh tag.
    ///
    /// Nothing is registered if any entry is invalid.
    pub fn install(self, registry: &EndpointRegistry) -> Result<InstalledRoutes, RegistrationError> {
        let tag = Tag::new();
        let endpoints = self
            .entries
            .into_iter()
            .map(|entry| build_entry(entry, tag))
            .collect::<Result<Vec<Endpoint>, _>>()?;

        let count = endpoints.len();
        let endpoints = endpoints
            .into_iter()
            .map(|e| registry.register_endpoint(e))
            .collect();

        tracing::info!(tag = %tag, count, "Route table installed");
        Ok(InstalledRoutes { tag, endpoints })
    }
}

fn build_entry(entry: Entry, tag: Tag) -> Result<Endpoint, RegistrationError> {
    let mut builder = EndpointBuilder::new(entry.method).route(entry.route).tag(tag);
    if let Some(handler) = entry.handler {
        builder = builder.handler_arc(handler);
    }
    if let Some(ws_handler) = entry.ws_handler {
        builder = builder.websocket_arc(ws_handler);
    }
    if let Some(label) = entry.label {
        builder = builder.label(label);
    }
    builder.build()
}

/// Handle to routes registered by [`RouteTable::install`].
pub struct InstalledRoutes {
    tag: Tag,
    endpoints: Vec<Arc<Endpoint>>,
}

impl InstalledRoutes {
    pub fn tag(&self) -> Tag {
        self.tag
    }

    pub fn endpoints(&self) -> &[Arc<Endpoint>] {
        &self.endpoints
    }

    /// Remove every route this table installed.
    pub fn uninstall(self, registry: &EndpointRegistry) -> usize {
        registry.remove_by_tag(self.tag).len()
    }
}
