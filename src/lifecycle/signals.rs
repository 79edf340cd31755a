//! OS signal handling.
//!
//! # Responsibilities
//! - Wait for SIGINT (Ctrl+C)
//! - Translate it into a [`Shutdown`] trigger
//!
//! # Design Decisions
//! - Uses Tokio's signal handling (async-safe)

use std::sync::Arc;

use crate::lifecycle::shutdown::Shutdown;

/// Block until Ctrl+C, then trigger `shutdown`.
pub async fn wait_for_ctrl_c(shutdown: Arc<Shutdown>) {
    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            match result {
                Ok(()) => {
                    tracing::info!("Ctrl+C received, shutting down");
                    shutdown.trigger();
                }
                Err(e) => {
                    tracing::error!(error = %e, "Failed to listen for Ctrl+C");
                    shutdown.wait().await;
                }
            }
        }
        _ = shutdown.wait() => {}
    }
}
