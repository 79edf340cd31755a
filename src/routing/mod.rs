//! Routing subsystem.
//!
//! # Data Flow
//! ```text
//! Incoming Request (method, path)
//!     → registry.rs (per-method snapshot, first match wins)
//!     → endpoint.rs (exact, regex, or template match)
//!     → template.rs (extract path parameters)
//!     → Return: matched Endpoint or None
//!
//! Registration (any thread, any time):
//!     EndpointBuilder / RouteTable
//!     → Validate and compile matcher
//!     → Append to a copy of the method's table
//!     → Swap the new table in atomically
//! ```
//!
//! # Design Decisions
//! - Registration order is priority; no specificity ranking
//! - Readers see a consistent snapshot and never take a lock
//! - Template parameters are typed by hint only, never validated

pub mod endpoint;
pub mod registry;
pub mod table;
pub mod template;

pub use endpoint::{
    Endpoint, EndpointBuilder, FrameHandler, Handler, HttpMethod, MatchKind, RegistrationError,
    Route, Tag, UnsupportedMethod, WsEndpointId,
};
pub use registry::{EndpointRegistry, EndpointTable};
pub use table::{InstalledRoutes, RouteTable};
pub use template::{
    parse_request_path, parse_template, FormatError, ParamSlot, ParamTable, PathParamValue,
    PathTemplate,
};
