//! Transport adapter: one persistent connection per authenticated identity,
//! typed emit and listener registration.

pub mod listeners;
pub mod memory;
pub mod socket;

use std::sync::Arc;

use serde_json::Value;
use thiserror::Error;

use crate::protocol::Frame;

pub use listeners::{ListenerRegistry, Subscription, Subscriptions};
pub use memory::MemoryTransport;
pub use socket::SocketTransport;

/// Callback invoked with the raw payload of an inbound frame.
pub type Handler = Arc<dyn Fn(&Value) + Send + Sync>;

/// Who the connection is opened for. A change of identity means a new connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub email: String,
    pub role: String,
    /// Bearer token presented on the upgrade request.
    pub token: Option<String>,
}

impl Identity {
    pub fn new(email: impl Into<String>, role: impl Into<String>) -> Self {
        Self {
            email: email.into(),
            role: role.into(),
            token: None,
        }
    }

    #[must_use]
    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("invalid bearer token header: {0}")]
    InvalidHeader(#[from] tokio_tungstenite::tungstenite::http::header::InvalidHeaderValue),

    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("connection rejected: {0}")]
    Rejected(String),
}

/// The operations the reconciler and dispatcher need from a connection.
///
/// `connect`/`disconnect` are inherent on each implementation because their
/// signatures differ (the socket transport is async).
pub trait Transport: Send + Sync {
    /// Fire-and-forget send. Returns whether the frame was queued; it is
    /// dropped with a warning while disconnected.
    fn emit(&self, frame: Frame) -> bool;

    fn on(&self, event: &str, handler: Handler) -> Subscription;

    /// Like [`Transport::on`], but the handler is removed after its first call.
    fn once(&self, event: &str, handler: Handler) -> Subscription;

    /// Unregister a handler. Unknown subscriptions are ignored.
    fn off(&self, subscription: &Subscription);

    fn is_connected(&self) -> bool;
}
