//! Per-request access records.

use std::net::SocketAddr;

/// Summary of one finished request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessRecord {
    pub client_addr: Option<SocketAddr>,
    pub method: String,
    /// Path as originally requested, before any internal redirect.
    pub path: String,
    pub protocol: String,
    /// Status sent, or -1 if no response was sent.
    pub status: i32,
    pub elapsed_ms: u128,
}

/// Destination for access records.
pub trait AccessLogSink: Send + Sync {
    fn record(&self, record: &AccessRecord);
}

/// Discards every record.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopAccessLog;

impl AccessLogSink for NoopAccessLog {
    fn record(&self, _record: &AccessRecord) {}
}

/// Emits records as `tracing` events with target `access`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingAccessLog;

impl AccessLogSink for TracingAccessLog {
    fn record(&self, record: &AccessRecord) {
        let client = record
            .client_addr
            .map(|a| a.to_string())
            .unwrap_or_else(|| "-".to_string());
        tracing::info!(
            target: "access",
            client = %client,
            method = %record.method,
            path = %record.path,
            protocol = %record.protocol,
            status = record.status,
            elapsed_ms = record.elapsed_ms as u64,
            "request finished"
        );
    }
}

impl<F> AccessLogSink for F
where
    F: Fn(&AccessRecord) + Send + Sync,
{
    fn record(&self, record: &AccessRecord) {
        self(record)
    }
}
