//! Endpoint registry and lookup.
//!
//! # Responsibilities
//! - Keep one ordered endpoint table per HTTP method
//! - Register, look up, and remove endpoints from any thread
//! - Issue WebSocket endpoint identifiers
//!
//! # Design Decisions
//! - Each table is an immutable snapshot swapped atomically (copy-on-write)
//! - Lookups never block; writers serialize on a mutex and rebuild the table
//! - Registration order is priority: the first structural match wins, even
//!   when a later endpoint is more specific
//! - A table that was never written is `None`, distinct from an empty table

use std::sync::{Arc, Mutex};

use arc_swap::ArcSwapOption;

use crate::observability::metrics;
use crate::routing::endpoint::{
    Endpoint, EndpointBuilder, FrameHandler, Handler, HttpMethod, RegistrationError, Route, Tag,
    WsEndpointId,
};

/// Snapshot of one method's endpoints, in registration order.
pub type EndpointTable = Arc<Vec<Arc<Endpoint>>>;

/// Thread-safe endpoint registry.
pub struct EndpointRegistry {
    tables: [ArcSwapOption<Vec<Arc<Endpoint>>>; HttpMethod::ALL.len()],
    write_lock: Mutex<()>,
}

impl EndpointRegistry {
    pub fn new() -> Self {
        Self {
            tables: Default::default(),
            write_lock: Mutex::new(()),
        }
    }

    /// Register a validated endpoint, appending it to its method's table.
    ///
    /// WebSocket-capable endpoints receive a fresh [`WsEndpointId`] unless
    /// they already carry one.
    pub fn register_endpoint(&self, mut endpoint: Endpoint) -> Arc<Endpoint> {
        if endpoint.websocket_upgrade_allowed() && endpoint.ws_id().is_none() {
            endpoint.assign_ws_id(WsEndpointId::new());
        }

        let method = endpoint.method();
        let endpoint = Arc::new(endpoint);

        self.rewrite(method, |current| {
            let mut next = current.map(|t| t.as_ref().clone()).unwrap_or_default();
            next.push(Arc::clone(&endpoint));
            Some(next)
        });

        tracing::debug!(endpoint = %endpoint.describe(), "Endpoint registered");
        metrics::record_registry_change("register", 1);
        endpoint
    }

    /// Build and register an endpoint in one call.
    ///
    /// `route` text containing `{` is parsed as a path template; anything
    /// else is an exact path. Use [`Route::Regex`] for raw regexes.
    pub fn register<F>(
        &self,
        method: HttpMethod,
        route: impl Into<Route>,
        handler: F,
        tag: Option<Tag>,
    ) -> Result<Arc<Endpoint>, RegistrationError>
    where
        F: Fn(&mut crate::http::request::RequestContext) -> Result<(), crate::BoxError>
            + Send
            + Sync
            + 'static,
    {
        let endpoint = EndpointBuilder::new(method)
            .route(route)
            .handler(handler)
            .maybe_tag(tag)
            .build()?;
        Ok(self.register_endpoint(endpoint))
    }

    /// Register a handler that is already behind an `Arc`.
    pub fn register_handler(
        &self,
        method: HttpMethod,
        route: impl Into<Route>,
        handler: Handler,
        tag: Option<Tag>,
    ) -> Result<Arc<Endpoint>, RegistrationError> {
        let endpoint = EndpointBuilder::new(method)
            .route(route)
            .handler_arc(handler)
            .maybe_tag(tag)
            .build()?;
        Ok(self.register_endpoint(endpoint))
    }

    /// Register a GET endpoint that accepts WebSocket upgrades.
    pub fn register_websocket_endpoint(
        &self,
        route: impl Into<Route>,
        frame_handler: FrameHandler,
        tag: Option<Tag>,
    ) -> Result<WsEndpointId, RegistrationError> {
        let endpoint = EndpointBuilder::new(HttpMethod::Get)
            .route(route)
            .websocket_arc(frame_handler)
            .maybe_tag(tag)
            .build()?;
        let registered = self.register_endpoint(endpoint);
        registered.ws_id().ok_or_else(|| {
            RegistrationError::Argument("websocket endpoint was not assigned an id".to_string())
        })
    }

    /// Find the first endpoint for `method` that handles `path`, skipping
    /// endpoints tagged with `ignore_tag`.
    pub fn find_endpoint(
        &self,
        method: HttpMethod,
        path: &str,
        ignore_tag: Option<Tag>,
    ) -> Option<Arc<Endpoint>> {
        let guard = self.tables[method.index()].load();
        let table = (*guard).as_ref()?;
        table
            .iter()
            .filter(|e| ignore_tag.is_none() || e.tag() != ignore_tag)
            .find(|e| e.can_handle(path))
            .cloned()
    }

    /// Snapshot of every endpoint for `method`.
    ///
    /// `None` means nothing was ever registered for the method; an empty
    /// table means everything registered has since been removed.
    pub fn get_all_endpoints(&self, method: HttpMethod) -> Option<EndpointTable> {
        self.tables[method.index()].load_full()
    }

    /// Remove the first exact-path endpoint equal (case-insensitively) to `path`.
    pub fn remove_by_path(&self, method: HttpMethod, path: &str) -> Option<Arc<Endpoint>> {
        self.remove_first(method, |e| {
            e.exact_path()
                .map(|p| p.eq_ignore_ascii_case(path))
                .unwrap_or(false)
        })
    }

    /// Remove the first regex or template endpoint whose registered pattern
    /// text equals `pattern`.
    pub fn remove_by_pattern(&self, method: HttpMethod, pattern: &str) -> Option<Arc<Endpoint>> {
        self.remove_first(method, |e| e.pattern() == Some(pattern))
    }

    /// Remove every endpoint, across all methods, tagged with `tag`.
    pub fn remove_by_tag(&self, tag: Tag) -> Vec<Arc<Endpoint>> {
        let mut removed = Vec::new();
        for method in HttpMethod::ALL {
            self.rewrite(method, |current| {
                let current = current?;
                if !current.iter().any(|e| e.tag() == Some(tag)) {
                    return None;
                }
                let (gone, kept): (Vec<_>, Vec<_>) = current
                    .iter()
                    .cloned()
                    .partition(|e| e.tag() == Some(tag));
                removed.extend(gone);
                Some(kept)
            });
        }

        if !removed.is_empty() {
            tracing::debug!(tag = %tag, count = removed.len(), "Endpoints removed by tag");
            metrics::record_registry_change("remove", removed.len());
        }
        removed
    }

    /// Number of endpoints currently registered across all methods.
    pub fn len(&self) -> usize {
        self.tables
            .iter()
            .map(|t| t.load_full().map(|v| v.len()).unwrap_or(0))
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn remove_first<P>(&self, method: HttpMethod, predicate: P) -> Option<Arc<Endpoint>>
    where
        P: Fn(&Endpoint) -> bool,
    {
        let mut removed = None;
        self.rewrite(method, |current| {
            let current = current?;
            let position = current.iter().position(|e| predicate(e))?;
            let mut next = current.as_ref().clone();
            removed = Some(next.remove(position));
            Some(next)
        });

        if let Some(endpoint) = &removed {
            tracing::debug!(endpoint = %endpoint.describe(), "Endpoint removed");
            metrics::record_registry_change("remove", 1);
        }
        removed
    }

    /// Apply `f` to the method's table under the write lock. Returning
    /// `None` leaves the table untouched.
    fn rewrite<F>(&self, method: HttpMethod, f: F)
    where
        F: FnOnce(Option<&EndpointTable>) -> Option<Vec<Arc<Endpoint>>>,
    {
        let _guard = self
            .write_lock
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let slot = &self.tables[method.index()];
        let current = slot.load_full();
        if let Some(next) = f(current.as_ref()) {
            slot.store(Some(Arc::new(next)));
        }
    }
}

impl Default for EndpointRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::request::RequestContext;
    use crate::BoxError;

    fn ok(_: &mut RequestContext) -> Result<(), BoxError> {
        Ok(())
    }

    fn labelled(method: HttpMethod, route: Route, label: &str, tag: Option<Tag>) -> Endpoint {
        Endpoint::builder(method)
            .route(route)
            .handler(ok)
            .label(label)
            .maybe_tag(tag)
            .build()
            .unwrap()
    }

    #[test]
    fn first_registered_match_wins() {
        let registry = EndpointRegistry::new();
        registry.register_endpoint(labelled(HttpMethod::Get, Route::Regex("/.*".into()), "catch-all", None));
        registry.register_endpoint(labelled(HttpMethod::Get, Route::Exact("/position".into()), "position", None));

        let found = registry.find_endpoint(HttpMethod::Get, "/position", None).unwrap();
        assert_eq!(found.label(), Some("catch-all"));
    }

    #[test]
    fn specific_route_registered_first_wins() {
        let registry = EndpointRegistry::new();
        registry.register_endpoint(labelled(HttpMethod::Get, Route::Exact("/a".into()), "a", None));
        registry.register_endpoint(labelled(HttpMethod::Get, Route::Regex("/.*".into()), "any", None));

        assert_eq!(registry.find_endpoint(HttpMethod::Get, "/a", None).unwrap().label(), Some("a"));
        assert_eq!(registry.find_endpoint(HttpMethod::Get, "/b", None).unwrap().label(), Some("any"));
    }

    #[test]
    fn lookup_is_per_method() {
        let registry = EndpointRegistry::new();
        registry.register(HttpMethod::Post, "/submit", ok, None).unwrap();
        assert!(registry.find_endpoint(HttpMethod::Get, "/submit", None).is_none());
        assert!(registry.find_endpoint(HttpMethod::Post, "/submit", None).is_some());
    }

    #[test]
    fn ignore_tag_skips_endpoints() {
        let registry = EndpointRegistry::new();
        let tag = Tag::new();
        registry.register_endpoint(labelled(HttpMethod::Get, Route::Regex("/.*".into()), "tagged", Some(tag)));
        registry.register_endpoint(labelled(HttpMethod::Get, Route::Exact("/x".into()), "plain", None));

        let found = registry.find_endpoint(HttpMethod::Get, "/x", Some(tag)).unwrap();
        assert_eq!(found.label(), Some("plain"));
        assert!(registry.find_endpoint(HttpMethod::Get, "/y", Some(tag)).is_none());
    }

    #[test]
    fn never_registered_differs_from_emptied() {
        let registry = EndpointRegistry::new();
        assert!(registry.get_all_endpoints(HttpMethod::Put).is_none());

        registry.register(HttpMethod::Put, "/thing", ok, None).unwrap();
        assert!(registry.remove_by_path(HttpMethod::Put, "/THING").is_some());

        let table = registry.get_all_endpoints(HttpMethod::Put).unwrap();
        assert!(table.is_empty());
    }

    #[test]
    fn remove_by_pattern_uses_text_equality() {
        let registry = EndpointRegistry::new();
        registry.register(HttpMethod::Get, Route::Regex("/items/.*".into()), ok, None).unwrap();
        registry.register(HttpMethod::Get, "/echo/{word}", ok, None).unwrap();

        assert!(registry.remove_by_pattern(HttpMethod::Get, "/items/.+").is_none());
        assert!(registry.remove_by_pattern(HttpMethod::Get, "/items/.*").is_some());
        assert!(registry.remove_by_pattern(HttpMethod::Get, "/echo/{word}").is_some());
        assert!(registry.is_empty());
    }

    #[test]
    fn removing_missing_endpoint_is_silent() {
        let registry = EndpointRegistry::new();
        assert!(registry.remove_by_path(HttpMethod::Get, "/nope").is_none());
        assert!(registry.remove_by_pattern(HttpMethod::Get, "/nope").is_none());
        assert!(registry.remove_by_tag(Tag::new()).is_empty());
    }

    #[test]
    fn tag_removal_spans_methods_and_is_idempotent() {
        let registry = EndpointRegistry::new();
        let tag = Tag::new();
        for method in [HttpMethod::Get, HttpMethod::Post, HttpMethod::Delete] {
            for i in 0..3 {
                registry.register(method, format!("/t/{i}"), ok, Some(tag)).unwrap();
            }
        }
        registry.register(HttpMethod::Get, "/keep", ok, None).unwrap();

        let removed = registry.remove_by_tag(tag);
        assert_eq!(removed.len(), 9);
        assert_eq!(registry.len(), 1);
        assert!(registry.remove_by_tag(tag).is_empty());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn websocket_endpoints_get_distinct_ids() {
        let registry = EndpointRegistry::new();
        let handler: FrameHandler = Arc::new(|_| Ok(()));
        let a = registry.register_websocket_endpoint("/ws/a", handler.clone(), None).unwrap();
        let b = registry.register_websocket_endpoint("/ws/b", handler, None).unwrap();
        assert_ne!(a, b);

        let ep = registry.find_endpoint(HttpMethod::Get, "/ws/a", None).unwrap();
        assert!(ep.websocket_upgrade_allowed());
        assert_eq!(ep.ws_id(), Some(a));
    }

    #[test]
    fn concurrent_registration_keeps_every_endpoint() {
        let registry = Arc::new(EndpointRegistry::new());
        let handles: Vec<_> = (0..8)
            .map(|t| {
                let registry = Arc::clone(&registry);
                std::thread::spawn(move || {
                    for i in 0..50 {
                        registry
                            .register(HttpMethod::Get, format!("/t{t}/{i}"), ok, None)
                            .unwrap();
                        let _ = registry.find_endpoint(HttpMethod::Get, "/t0/0", None);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(registry.len(), 400);
    }

    #[test]
    fn removals_race_lookups_and_registrations() {
        let registry = Arc::new(EndpointRegistry::new());
        registry.register(HttpMethod::Get, "/stable", ok, None).unwrap();

        let tags: Vec<Tag> = (0..4).map(|_| Tag::new()).collect();
        for (k, tag) in tags.iter().enumerate() {
            for i in 0..25 {
                registry
                    .register(HttpMethod::Get, format!("/tag{k}/{i}"), ok, Some(*tag))
                    .unwrap();
            }
            registry
                .register(HttpMethod::Post, format!("/doomed{k}"), ok, None)
                .unwrap();
        }

        let mut handles = Vec::new();
        for (k, tag) in tags.iter().copied().enumerate() {
            let registry = Arc::clone(&registry);
            handles.push(std::thread::spawn(move || {
                assert_eq!(registry.remove_by_tag(tag).len(), 25);
                assert!(registry
                    .remove_by_path(HttpMethod::Post, &format!("/doomed{k}"))
                    .is_some());
            }));
        }
        for t in 0..4 {
            let registry = Arc::clone(&registry);
            handles.push(std::thread::spawn(move || {
                for i in 0..50 {
                    registry
                        .register(HttpMethod::Get, format!("/new{t}/{i}"), ok, None)
                        .unwrap();
                }
            }));
        }
        for _ in 0..4 {
            let registry = Arc::clone(&registry);
            handles.push(std::thread::spawn(move || {
                for _ in 0..500 {
                    let found = registry
                        .find_endpoint(HttpMethod::Get, "/stable", None)
                        .expect("untouched endpoint disappeared during a rebuild");
                    assert_eq!(found.exact_path(), Some("/stable"));
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }

        assert_eq!(registry.len(), 1 + 200);
        for k in 0..4 {
            assert!(registry
                .find_endpoint(HttpMethod::Get, &format!("/tag{k}/0"), None)
                .is_none());
            assert!(registry
                .find_endpoint(HttpMethod::Get, &format!("/new{k}/49"), None)
                .is_some());
        }
        assert_eq!(registry.get_all_endpoints(HttpMethod::Post).map(|t| t.len()), Some(0));
    }
}
