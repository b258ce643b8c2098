use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use serde_json::Value;
use tracing::debug;

use super::{Handler, Transport};

/// Handle returned by `on`/`once`; the only way to unregister a handler.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Subscription {
    event: String,
    id: u64,
}

impl Subscription {
    pub fn event(&self) -> &str {
        &self.event
    }
}

struct Listener {
    id: u64,
    once: bool,
    handler: Handler,
}

/// Event name -> handlers, shared by every transport implementation.
pub struct ListenerRegistry {
    listeners: DashMap<String, Vec<Listener>>,
    next_id: AtomicU64,
}

impl Default for ListenerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ListenerRegistry {
    pub fn new() -> Self {
        Self {
            listeners: DashMap::new(),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn add(&self, event: &str, handler: Handler, once: bool) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.listeners
            .entry(event.to_string())
            .or_default()
            .push(Listener { id, once, handler });
        Subscription {
            event: event.to_string(),
            id,
        }
    }

    /// Returns false if the subscription was not registered.
    pub fn remove(&self, subscription: &Subscription) -> bool {
        let Some(mut entry) = self.listeners.get_mut(&subscription.event) else {
            return false;
        };
        let before = entry.len();
        entry.retain(|l| l.id != subscription.id);
        let removed = entry.len() != before;
        let now_empty = entry.is_empty();
        drop(entry);
        if now_empty {
            self.listeners.remove_if(&subscription.event, |_, v| v.is_empty());
        }
        removed
    }

    /// Invoke every handler registered for `event`. Returns how many ran.
    ///
    /// Handlers are collected first and called without holding the map lock,
    /// so a handler may register or unregister listeners itself.
    pub fn dispatch(&self, event: &str, payload: &Value) -> usize {
        let handlers: Vec<Handler> = {
            let Some(mut entry) = self.listeners.get_mut(event) else {
                debug!(%event, "no listener registered");
                return 0;
            };
            let handlers = entry.iter().map(|l| l.handler.clone()).collect();
            entry.retain(|l| !l.once);
            handlers
        };

        for handler in &handlers {
            handler(payload);
        }
        handlers.len()
    }

    pub fn clear(&self) {
        self.listeners.clear();
    }

    pub fn listener_count(&self, event: &str) -> usize {
        self.listeners.get(event).map(|v| v.len()).unwrap_or(0)
    }

    pub fn total_listeners(&self) -> usize {
        self.listeners.iter().map(|e| e.value().len()).sum()
    }
}

/// A bag of subscriptions released together.
#[derive(Debug, Default)]
pub struct Subscriptions {
    handles: Vec<Subscription>,
}

impl Subscriptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, subscription: Subscription) {
        self.handles.push(subscription);
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Unregister everything from `transport`. Calling twice is harmless.
    pub fn dispose(&mut self, transport: &dyn Transport) {
        for subscription in self.handles.drain(..) {
            transport.off(&subscription);
        }
    }
}
