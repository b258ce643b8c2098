use std::sync::Arc;
use std::time::Duration;

use chrono::NaiveDate;
use tracing::{debug, error, info, warn};

use super::store::{PendingRequest, SessionStore};
use crate::model::{AttendanceStatus, SessionId, StudentId};
use crate::notify::{Notification, NotificationSink};
use crate::permissions::{PermissionEvaluator, SessionAction};
use crate::protocol::{ClientCommand, MarkEntry};
use crate::transport::Transport;

/// Default wait for a create/join acknowledgement.
pub const DEFAULT_ACK_TIMEOUT: Duration = Duration::from_secs(10);

/// What happened to a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    /// Handed to the transport.
    Sent,
    /// Needs a current session and there is none; nothing was sent.
    NoSession,
    /// Refused by the permission evaluator; nothing was sent.
    Denied,
    /// The command could not be encoded; nothing was sent.
    Failed,
    /// The transport was not connected and dropped the frame.
    Offline,
}

/// Translates user intents into outbound frames. Never mutates records or
/// progress: visible changes wait for the server's events.
pub struct CommandDispatcher {
    transport: Arc<dyn Transport>,
    store: Arc<SessionStore>,
    notifier: Arc<dyn NotificationSink>,
    permissions: Option<Arc<dyn PermissionEvaluator>>,
    ack_timeout: Duration,
}

impl CommandDispatcher {
    pub fn new(
        transport: Arc<dyn Transport>,
        store: Arc<SessionStore>,
        notifier: Arc<dyn NotificationSink>,
        permissions: Option<Arc<dyn PermissionEvaluator>>,
        ack_timeout: Duration,
    ) -> Self {
        Self {
            transport,
            store,
            notifier,
            permissions,
            ack_timeout,
        }
    }

    /// How long a create/join waits for its acknowledgement.
    pub fn ack_timeout(&self) -> Duration {
        self.ack_timeout
    }

    pub fn create_session(
        &self,
        class_id: impl Into<String>,
        workspace_id: impl Into<String>,
        date: NaiveDate,
        total_students: u32,
    ) -> Dispatch {
        if !self.permitted(SessionAction::Create) {
            return Dispatch::Denied;
        }
        let class_id = class_id.into();
        let workspace_id = workspace_id.into();
        self.leave_current("creating a new session");

        let ticket = self.store.begin_pending(PendingRequest::Create {
            class_id: class_id.clone(),
            workspace_id: workspace_id.clone(),
            date,
        });
        let outcome = self.send(ClientCommand::CreateSession {
            class_id,
            workspace_id,
            date,
            total_students,
        });
        self.await_ack(ticket, outcome);
        outcome
    }

    pub fn join_session(
        &self,
        session_id: impl Into<SessionId>,
        class_id: impl Into<String>,
    ) -> Dispatch {
        if !self.permitted(SessionAction::Join) {
            return Dispatch::Denied;
        }
        let session_id = session_id.into();
        let class_id = class_id.into();
        self.leave_current("joining another session");

        let ticket = self.store.begin_pending(PendingRequest::Join {
            session_id: session_id.clone(),
            class_id: class_id.clone(),
        });
        let outcome = self.send(ClientCommand::JoinSession {
            session_id,
            class_id,
        });
        self.await_ack(ticket, outcome);
        outcome
    }

    /// Clear local state immediately, then tell the server. Without a
    /// current session this withdraws a pending create/join instead.
    pub fn leave_session(&self) -> Dispatch {
        let Some(session_id) = self.store.current_session_id() else {
            return self.withdraw_pending();
        };
        self.store.clear();
        info!(%session_id, "left attendance session");
        self.send(ClientCommand::LeaveSession { session_id })
    }

    /// A late acknowledgement for a withdrawn request is dropped, so a
    /// pending join is also left on the server, which may already have
    /// added us. A pending create has no session id to leave yet.
    fn withdraw_pending(&self) -> Dispatch {
        match self.store.abandon_pending() {
            Some(PendingRequest::Join { session_id, .. }) => {
                info!(%session_id, "withdrew pending join");
                self.send(ClientCommand::LeaveSession { session_id })
            }
            Some(request) => {
                warn!(?request, "withdrew pending request; nothing to leave yet");
                Dispatch::NoSession
            }
            None => {
                debug!("leave_session ignored: no current session");
                Dispatch::NoSession
            }
        }
    }

    pub fn mark_attendance(
        &self,
        student_id: impl Into<StudentId>,
        status: AttendanceStatus,
        notes: Option<String>,
    ) -> Dispatch {
        let Some(session_id) = self.require_session("mark_attendance") else {
            return Dispatch::NoSession;
        };
        if !self.permitted(SessionAction::Mark) {
            return Dispatch::Denied;
        }
        self.send(ClientCommand::MarkAttendance {
            session_id,
            student_id: student_id.into(),
            status,
            notes,
        })
    }

    pub fn bulk_mark_attendance(&self, records: Vec<MarkEntry>) -> Dispatch {
        let Some(session_id) = self.require_session("bulk_mark_attendance") else {
            return Dispatch::NoSession;
        };
        if !self.permitted(SessionAction::Mark) {
            return Dispatch::Denied;
        }
        self.send(ClientCommand::BulkMarkAttendance {
            session_id,
            records,
        })
    }

    pub fn close_session(&self) -> Dispatch {
        let Some(session_id) = self.require_session("close_session") else {
            return Dispatch::NoSession;
        };
        if !self.permitted(SessionAction::Close) {
            return Dispatch::Denied;
        }
        let outcome = self.send(ClientCommand::CloseSession { session_id });
        if outcome == Dispatch::Sent {
            self.store.begin_closing();
        }
        outcome
    }

    /// Works with or without a current session.
    pub fn get_stats(
        &self,
        class_id: impl Into<String>,
        workspace_id: impl Into<String>,
        date: NaiveDate,
    ) -> Dispatch {
        if !self.permitted(SessionAction::Stats) {
            return Dispatch::Denied;
        }
        self.send(ClientCommand::GetStats {
            class_id: class_id.into(),
            workspace_id: workspace_id.into(),
            date,
        })
    }

    pub fn refresh_session_status(&self) -> Dispatch {
        let Some(session_id) = self.require_session("refresh_session_status") else {
            return Dispatch::NoSession;
        };
        if !self.permitted(SessionAction::Refresh) {
            return Dispatch::Denied;
        }
        self.send(ClientCommand::GetSessionStatus { session_id })
    }

    fn require_session(&self, command: &str) -> Option<SessionId> {
        let session_id = self.store.current_session_id();
        if session_id.is_none() {
            debug!(%command, "ignored: no current session");
        }
        session_id
    }

    fn permitted(&self, action: SessionAction) -> bool {
        let Some(evaluator) = &self.permissions else {
            return true;
        };
        if evaluator.allows(action) {
            return true;
        }
        warn!(?action, "command denied by permission evaluator");
        self.notifier.notify(Notification::warning(format!(
            "You do not have permission to {}",
            action.describe()
        )));
        false
    }

    /// The client tracks one session at a time: leave the current one before
    /// asking for another.
    fn leave_current(&self, reason: &str) {
        if self.store.is_in_session() {
            debug!(%reason, "leaving current session first");
            self.leave_session();
        }
    }

    fn send(&self, command: ClientCommand) -> Dispatch {
        match command.to_frame() {
            Ok(frame) => {
                debug!(event = %frame.event, "dispatching command");
                if self.transport.emit(frame) {
                    Dispatch::Sent
                } else {
                    Dispatch::Offline
                }
            }
            Err(e) => {
                error!(command = command.name(), error = %e, "failed to encode command");
                Dispatch::Failed
            }
        }
    }

    /// A request that never left cannot be acknowledged: drop it at once.
    fn await_ack(&self, ticket: u64, outcome: Dispatch) {
        if outcome == Dispatch::Sent {
            self.arm_ack_timeout(ticket);
        } else {
            self.store.expire_pending(ticket);
        }
    }

    /// Revert `Pending` to `Idle` if no acknowledgement arrives in time. Needs
    /// an ambient tokio runtime; without one the request just stays pending.
    fn arm_ack_timeout(&self, ticket: u64) {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            debug!(ticket, "no runtime, acknowledgement timeout not armed");
            return;
        };
        let store = self.store.clone();
        let notifier = self.notifier.clone();
        let timeout = self.ack_timeout;
        runtime.spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some(request) = store.expire_pending(ticket) {
                warn!(?request, ?timeout, "no acknowledgement from server");
                notifier.notify(Notification::error(format!(
                    "Timed out waiting for the server to {}",
                    request.describe()
                )));
            }
        });
    }
}
