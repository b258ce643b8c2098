use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::notify::{NotificationSink, TracingSink};
use crate::permissions::PermissionEvaluator;
use crate::session::{
    CommandDispatcher, DEFAULT_ACK_TIMEOUT, Reconciler, SessionPhase, SessionSnapshot,
    SessionStore,
};
use crate::transport::{Subscriptions, Transport};

/// Wires a transport to the session store: the reconciler listens for server
/// events and the dispatcher sends commands.
pub struct SessionClient {
    id: Uuid,
    transport: Arc<dyn Transport>,
    store: Arc<SessionStore>,
    dispatcher: CommandDispatcher,
    subscriptions: Mutex<Subscriptions>,
}

pub struct SessionClientBuilder {
    transport: Arc<dyn Transport>,
    notifier: Arc<dyn NotificationSink>,
    permissions: Option<Arc<dyn PermissionEvaluator>>,
    ack_timeout: Duration,
}

impl SessionClientBuilder {
    #[must_use]
    pub fn notifier(mut self, notifier: Arc<dyn NotificationSink>) -> Self {
        self.notifier = notifier;
        self
    }

    /// Gate commands on the local user's permissions. Without an evaluator
    /// every command is allowed.
    #[must_use]
    pub fn permissions(mut self, permissions: Arc<dyn PermissionEvaluator>) -> Self {
        self.permissions = Some(permissions);
        self
    }

    #[must_use]
    pub fn ack_timeout(mut self, timeout: Duration) -> Self {
        self.ack_timeout = timeout;
        self
    }

    pub fn build(self) -> SessionClient {
        let id = Uuid::new_v4();
        let store = Arc::new(SessionStore::new());
        let reconciler = Arc::new(Reconciler::new(store.clone(), self.notifier.clone()));
        let subscriptions = reconciler.attach(self.transport.as_ref());
        let dispatcher = CommandDispatcher::new(
            self.transport.clone(),
            store.clone(),
            self.notifier,
            self.permissions,
            self.ack_timeout,
        );
        info!(client_id = %id, listeners = subscriptions.len(), "session client attached");

        SessionClient {
            id,
            transport: self.transport,
            store,
            dispatcher,
            subscriptions: Mutex::new(subscriptions),
        }
    }
}

impl SessionClient {
    pub fn builder(transport: Arc<dyn Transport>) -> SessionClientBuilder {
        SessionClientBuilder {
            transport,
            notifier: Arc::new(TracingSink),
            permissions: None,
            ack_timeout: DEFAULT_ACK_TIMEOUT,
        }
    }

    /// Identifies this client instance in logs.
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn store(&self) -> &Arc<SessionStore> {
        &self.store
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        self.store.snapshot()
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionSnapshot> {
        self.store.subscribe()
    }

    pub fn is_in_session(&self) -> bool {
        self.store.is_in_session()
    }

    /// Read through to the transport, never cached.
    pub fn is_socket_connected(&self) -> bool {
        self.transport.is_connected()
    }

    pub fn commands(&self) -> &CommandDispatcher {
        &self.dispatcher
    }

    /// Leave the session and release listeners. A create/join still waiting
    /// for its acknowledgement is given up to the acknowledgement timeout to
    /// settle first, so the session the server opens for it is left too.
    pub async fn shutdown(&self) {
        let mut updates = self.store.subscribe();
        let settled = updates.wait_for(|s| !matches!(s.phase, SessionPhase::Pending { .. }));
        if tokio::time::timeout(self.dispatcher.ack_timeout(), settled)
            .await
            .is_err()
        {
            warn!(client_id = %self.id, "pending request unresolved at shutdown");
        }
        self.dispatcher.leave_session();
        self.dispose();
    }

    /// Release every listener this client registered. Idempotent.
    pub fn dispose(&self) {
        let mut subscriptions = self
            .subscriptions
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if subscriptions.is_empty() {
            return;
        }
        subscriptions.dispose(self.transport.as_ref());
        debug!(client_id = %self.id, "session client detached");
    }
}

impl Drop for SessionClient {
    fn drop(&mut self) {
        self.dispose();
    }
}
