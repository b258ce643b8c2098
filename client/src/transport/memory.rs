use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError};

use tracing::{info, warn};

use super::listeners::{ListenerRegistry, Subscription};
use super::{Handler, Identity, Transport, TransportError};
use crate::protocol::{Frame, ServerEvent};

/// In-process transport: outbound frames are recorded, inbound frames are
/// injected with [`MemoryTransport::deliver`]. Same contract as the socket.
#[derive(Default)]
pub struct MemoryTransport {
    registry: ListenerRegistry,
    identity: Mutex<Option<Identity>>,
    sent: Mutex<Vec<Frame>>,
    reject: AtomicBool,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// A transport that is already connected for `identity`.
    pub fn connected(identity: Identity) -> Self {
        let transport = Self::new();
        *transport.lock_identity() = Some(identity);
        transport
    }

    /// Idempotent for the same identity; a different identity replaces the
    /// connection but keeps registered listeners.
    pub fn connect(&self, identity: Identity) -> Result<(), TransportError> {
        if self.reject.load(Ordering::SeqCst) {
            return Err(TransportError::Rejected(format!(
                "authentication refused for {}",
                identity.email
            )));
        }
        let mut current = self.lock_identity();
        if current.as_ref() == Some(&identity) {
            return Ok(());
        }
        if let Some(old) = current.take() {
            info!(old = %old.email, new = %identity.email, "identity changed, reconnecting");
        }
        *current = Some(identity);
        Ok(())
    }

    /// Drop the connection and every listener. Safe when not connected.
    pub fn disconnect(&self) {
        self.lock_identity().take();
        self.registry.clear();
    }

    /// Make subsequent `connect` calls fail, as an auth/network failure would.
    pub fn reject_connections(&self, reject: bool) {
        self.reject.store(reject, Ordering::SeqCst);
    }

    pub fn identity(&self) -> Option<Identity> {
        self.lock_identity().clone()
    }

    /// Push an inbound frame to listeners. Returns how many handlers ran.
    /// Frames are dropped while disconnected, like a closed socket would.
    pub fn deliver(&self, frame: &Frame) -> usize {
        if !self.is_connected() {
            warn!(event = %frame.event, "inbound frame on a disconnected transport dropped");
            return 0;
        }
        self.registry.dispatch(&frame.event, &frame.data)
    }

    pub fn deliver_event(&self, event: &ServerEvent) -> Result<usize, serde_json::Error> {
        Ok(self.deliver(&event.to_frame()?))
    }

    /// Frames emitted so far, oldest first.
    pub fn sent(&self) -> Vec<Frame> {
        self.sent
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn take_sent(&self) -> Vec<Frame> {
        std::mem::take(&mut *self.sent.lock().unwrap_or_else(PoisonError::into_inner))
    }

    pub fn listener_count(&self, event: &str) -> usize {
        self.registry.listener_count(event)
    }

    pub fn total_listeners(&self) -> usize {
        self.registry.total_listeners()
    }

    fn lock_identity(&self) -> std::sync::MutexGuard<'_, Option<Identity>> {
        self.identity.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Transport for MemoryTransport {
    fn emit(&self, frame: Frame) -> bool {
        if !self.is_connected() {
            warn!(event = %frame.event, "transport not connected, dropping outbound frame");
            return false;
        }
        self.sent
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(frame);
        true
    }

    fn on(&self, event: &str, handler: Handler) -> Subscription {
        self.registry.add(event, handler, false)
    }

    fn once(&self, event: &str, handler: Handler) -> Subscription {
        self.registry.add(event, handler, true)
    }

    fn off(&self, subscription: &Subscription) {
        self.registry.remove(subscription);
    }

    fn is_connected(&self) -> bool {
        self.lock_identity().is_some()
    }
}
