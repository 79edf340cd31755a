//! Embedded HTTP and WebSocket router.
//!
//! Lets a host application register HTTP and WebSocket endpoints at runtime
//! while keeping its own state on a single owning thread.
//!
//! # Architecture Overview
//!
//! ```text
//!   Client ──▶ http::server (Axum, middleware)
//!                 │
//!                 ▼
//!              http::lifecycle ──▶ routing::registry ──▶ routing::template
//!                 │                  (first match wins)    (path params)
//!                 ▼
//!              handler (blocking pool) ──execute_sync──▶ dispatch (owning thread)
//!                 │
//!                 ▼
//!              http::response ──▶ Client
//!
//!   Upgrade ──▶ http::websocket (sessions, frame handler, broadcast)
//!
//!   Cross-cutting: config, observability, lifecycle
//! ```

// Core subsystems
pub mod dispatch;
pub mod http;
pub mod routing;

// Cross-cutting concerns
pub mod config;
pub mod error;
pub mod lifecycle;
pub mod observability;

pub use config::RouterConfig;
pub use dispatch::{DispatchError, WorkDispatcher};
pub use error::{BoxError, ServerError};
pub use http::{HttpServer, RequestContext, RequestPipeline};
pub use lifecycle::Shutdown;
pub use routing::{EndpointRegistry, HttpMethod, Route, RouteTable, Tag, WsEndpointId};
