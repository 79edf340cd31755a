//! HTTP protocol handling subsystem.
//!
//! # Data Flow
//! ```text
//! TCP connection
//!     → server.rs (Axum setup, middleware, catch-all handler)
//!     → request.rs (RequestContext: path, query, headers, body)
//!     → lifecycle.rs (auth, endpoint lookup, handler, redirects, access log)
//!     → response.rs (ResponseBuilder → OutgoingResponse)
//!     → Send to client
//!
//! Upgrade requests on WebSocket endpoints:
//!     → lifecycle.rs (auth + upgrade decision)
//!     → websocket.rs (session registry, frame dispatch, broadcast)
//! ```

pub mod lifecycle;
pub mod request;
pub mod response;
pub mod server;
pub mod websocket;

pub use lifecycle::{RequestFault, RequestPipeline, MAX_INTERNAL_REDIRECTS};
pub use request::{OneshotSink, RecordingSink, RedirectState, RequestContext, ResponseSink};
pub use response::{OutgoingResponse, ResponseBuilder};
pub use server::{HttpServer, X_REQUEST_ID};
pub use websocket::{Frame, SessionHandle, SessionId, SessionRegistry, WsPayload};
