//! Owning-thread work dispatch.
//!
//! # Data Flow
//! ```text
//! Worker thread (request handler)
//!     → execute_sync / execute_async / execute_async_coroutine
//!     → workload.rs (boxed action or coroutine factory)
//!     → dispatcher.rs queue (mutex-protected deque)
//!
//! Owning thread (host main loop)
//!     → do_update() each tick
//!     → run action, capture value / error / panic
//!     → signal waiting caller, or report to async error handler
//! ```
//!
//! # Design Decisions
//! - Explicitly constructed and shared by `Arc`, never a global
//! - Many producers, exactly one consumer
//! - Synchronous waits are bounded by a timeout

pub mod dispatcher;
pub mod workload;

pub use dispatcher::{AsyncErrorHandler, DispatchError, WorkDispatcher};
pub use workload::{Action, Coroutine, CoroutineFactory, Step, WorkValue, Workload, WorkloadFault};
