//! WebSocket sessions.
//!
//! # Responsibilities
//! - Track connected sessions per WebSocket endpoint
//! - Feed received data frames to the endpoint's frame handler
//! - Deliver outbound frames to one session or broadcast to all of them
//!
//! # Data Flow
//! ```text
//! Client ──frames──→ serve_session ──Frame──→ frame handler (blocking pool)
//! ws_send / SessionHandle::send ──→ per-session channel ──→ serve_session ──→ Client
//! ```
//!
//! # Design Decisions
//! - One bounded outbound channel per session; a full channel fails the send
//! - Frames for one session are handled in order, one at a time
//! - Handler errors and panics are logged and the session stays open
//! - Ping/pong is answered by the protocol layer

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::ws::{Message, WebSocket};
use dashmap::DashMap;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::{broadcast, mpsc};

use crate::error::catch_panic;
use crate::observability::metrics;
use crate::routing::{Endpoint, WsEndpointId};

/// Global counter for session IDs.
static SESSION_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Unique identifier for a WebSocket session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId(u64);

impl SessionId {
    /// Generate a new unique session ID.
    pub fn next() -> Self {
        Self(SESSION_COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "session-{}", self.0)
    }
}

/// Outbound data for a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WsPayload {
    Text(String),
    Binary(Bytes),
}

impl WsPayload {
    fn into_message(self) -> Message {
        match self {
            WsPayload::Text(text) => Message::Text(text.into()),
            WsPayload::Binary(bytes) => Message::Binary(bytes),
        }
    }
}

impl From<&str> for WsPayload {
    fn from(text: &str) -> Self {
        WsPayload::Text(text.to_string())
    }
}

impl From<String> for WsPayload {
    fn from(text: String) -> Self {
        WsPayload::Text(text)
    }
}

impl From<Bytes> for WsPayload {
    fn from(bytes: Bytes) -> Self {
        WsPayload::Binary(bytes)
    }
}

impl From<Vec<u8>> for WsPayload {
    fn from(bytes: Vec<u8>) -> Self {
        WsPayload::Binary(Bytes::from(bytes))
    }
}

/// Sending half of one connected session.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    id: SessionId,
    endpoint: WsEndpointId,
    path: String,
    tx: mpsc::Sender<Message>,
}

impl SessionHandle {
    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn endpoint(&self) -> WsEndpointId {
        self.endpoint
    }

    /// Request path the session connected on.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Queue a frame for this session. Returns false if the session is gone
    /// or its outbound buffer is full.
    pub fn send(&self, payload: impl Into<WsPayload>) -> bool {
        self.tx.try_send(payload.into().into_message()).is_ok()
    }

    pub fn send_text(&self, text: impl Into<String>) -> bool {
        self.send(WsPayload::Text(text.into()))
    }

    /// Ask the session to close.
    pub fn close(&self) -> bool {
        self.tx.try_send(Message::Close(None)).is_ok()
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// A data frame received from a client.
#[derive(Debug, Clone)]
pub struct Frame {
    payload: Bytes,
    is_text: bool,
    session: SessionHandle,
}

impl Frame {
    pub fn new(payload: Bytes, is_text: bool, session: SessionHandle) -> Self {
        Self {
            payload,
            is_text,
            session,
        }
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    pub fn is_text(&self) -> bool {
        self.is_text
    }

    /// Payload as text, for text frames.
    pub fn text(&self) -> Option<&str> {
        if self.is_text {
            std::str::from_utf8(&self.payload).ok()
        } else {
            None
        }
    }

    /// Session the frame arrived on.
    pub fn session(&self) -> &SessionHandle {
        &self.session
    }
}

/// Connected sessions, grouped by WebSocket endpoint.
pub struct SessionRegistry {
    endpoints: DashMap<WsEndpointId, DashMap<SessionId, SessionHandle>>,
    outbound_buffer: usize,
}

impl SessionRegistry {
    pub fn new(outbound_buffer: usize) -> Self {
        Self {
            endpoints: DashMap::new(),
            outbound_buffer: outbound_buffer.max(1),
        }
    }

    /// Create and register a session, returning its handle and the
    /// receiving end of its outbound channel.
    pub fn open(
        &self,
        endpoint: WsEndpointId,
        path: impl Into<String>,
    ) -> (SessionHandle, mpsc::Receiver<Message>) {
        let (tx, rx) = mpsc::channel(self.outbound_buffer);
        let handle = SessionHandle {
            id: SessionId::next(),
            endpoint,
            path: path.into(),
            tx,
        };
        self.endpoints
            .entry(endpoint)
            .or_default()
            .insert(handle.id, handle.clone());
        metrics::record_ws_session_opened();
        (handle, rx)
    }

    /// Remove a session. Returns false if it was not registered.
    pub fn close(&self, endpoint: WsEndpointId, session: SessionId) -> bool {
        let removed = self
            .endpoints
            .get(&endpoint)
            .map(|sessions| sessions.remove(&session).is_some())
            .unwrap_or(false);
        if removed {
            metrics::record_ws_session_closed();
        }
        self.endpoints
            .remove_if(&endpoint, |_, sessions| sessions.is_empty());
        removed
    }

    pub fn session(&self, endpoint: WsEndpointId, session: SessionId) -> Option<SessionHandle> {
        self.endpoints
            .get(&endpoint)
            .and_then(|sessions| sessions.get(&session).map(|s| s.value().clone()))
    }

    /// Handles for every session on `endpoint`.
    pub fn sessions(&self, endpoint: WsEndpointId) -> Vec<SessionHandle> {
        self.endpoints
            .get(&endpoint)
            .map(|sessions| sessions.iter().map(|s| s.value().clone()).collect())
            .unwrap_or_default()
    }

    pub fn session_count(&self, endpoint: WsEndpointId) -> usize {
        self.endpoints
            .get(&endpoint)
            .map(|sessions| sessions.len())
            .unwrap_or(0)
    }

    pub fn total_sessions(&self) -> usize {
        self.endpoints.iter().map(|e| e.value().len()).sum()
    }

    /// Send `payload` to every session on `endpoint`. Returns how many
    /// sessions accepted it.
    pub fn broadcast(&self, endpoint: WsEndpointId, payload: impl Into<WsPayload>) -> usize {
        let payload = payload.into();
        let delivered = self
            .sessions(endpoint)
            .iter()
            .filter(|session| session.send(payload.clone()))
            .count();
        tracing::trace!(endpoint = %endpoint, delivered, "WebSocket broadcast");
        delivered
    }

    /// Send `payload` to one session.
    pub fn send_to(
        &self,
        endpoint: WsEndpointId,
        session: SessionId,
        payload: impl Into<WsPayload>,
    ) -> bool {
        self.session(endpoint, session)
            .map(|s| s.send(payload))
            .unwrap_or(false)
    }

    /// Run one upgraded connection until either side closes or shutdown.
    pub async fn serve_session(
        self: Arc<Self>,
        socket: WebSocket,
        endpoint: Arc<Endpoint>,
        path: String,
        mut shutdown: broadcast::Receiver<()>,
    ) {
        let (Some(ws_id), Some(frame_handler)) = (endpoint.ws_id(), endpoint.ws_handler().cloned())
        else {
            tracing::warn!(endpoint = %endpoint.describe(), "Upgraded endpoint has no frame handler");
            return;
        };

        let (session, mut outbound) = self.open(ws_id, path);
        tracing::info!(
            session = %session.id(),
            endpoint = %ws_id,
            path = %session.path(),
            "WebSocket session connected"
        );

        let (mut ws_tx, mut ws_rx) = socket.split();

        loop {
            tokio::select! {
                msg = ws_rx.next() => {
                    let frame = match msg {
                        Some(Ok(Message::Text(text))) => {
                            Frame::new(Bytes::copy_from_slice(text.as_str().as_bytes()), true, session.clone())
                        }
                        Some(Ok(Message::Binary(bytes))) => Frame::new(bytes, false, session.clone()),
                        Some(Ok(Message::Close(_))) | None => break,
                        Some(Err(e)) => {
                            tracing::warn!(session = %session.id(), error = %e, "WebSocket error");
                            break;
                        }
                        Some(Ok(_)) => continue,
                    };

                    let handler = Arc::clone(&frame_handler);
                    let id = session.id();
                    match tokio::task::spawn_blocking(move || catch_panic(|| handler(frame))).await {
                        Ok(Ok(Ok(()))) => {}
                        Ok(Ok(Err(e))) => {
                            tracing::warn!(session = %id, error = %e, "Frame handler failed");
                        }
                        Ok(Err(message)) => {
                            tracing::warn!(session = %id, panic = %message, "Frame handler panicked");
                        }
                        Err(e) => {
                            tracing::warn!(session = %id, error = %e, "Frame handler task failed");
                        }
                    }
                }

                out = outbound.recv() => {
                    let Some(message) = out else { break };
                    let closing = matches!(message, Message::Close(_));
                    if let Err(e) = ws_tx.send(message).await {
                        tracing::debug!(session = %session.id(), error = %e, "Failed to send frame");
                        break;
                    }
                    if closing {
                        break;
                    }
                }

                _ = shutdown.recv() => {
                    let _ = ws_tx.send(Message::Close(None)).await;
                    break;
                }
            }
        }

        self.close(ws_id, session.id());
        tracing::info!(session = %session.id(), endpoint = %ws_id, "WebSocket session disconnected");
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new(256)
    }
}
