use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, info, warn};

use super::store::{SessionPhase, SessionStore};
use crate::notify::{Notification, NotificationSink};
use crate::protocol::ServerEvent;
use crate::protocol::events::INBOUND;
use crate::transport::{Subscriptions, Transport};

/// Turns each inbound server event into at most one store mutation plus
/// notifications. Invoked from the transport's single reader, one event at a
/// time, so applications never interleave. Local commands run on other
/// threads; whether an event still addresses the current session is decided
/// by the store under the same lock as the write.
pub struct Reconciler {
    store: Arc<SessionStore>,
    notifier: Arc<dyn NotificationSink>,
}

impl Reconciler {
    pub fn new(store: Arc<SessionStore>, notifier: Arc<dyn NotificationSink>) -> Self {
        Self { store, notifier }
    }

    /// Register a listener for every attendance event on `transport`.
    pub fn attach(self: &Arc<Self>, transport: &dyn Transport) -> Subscriptions {
        let mut subscriptions = Subscriptions::new();
        for event in INBOUND {
            let reconciler = Arc::clone(self);
            subscriptions.push(transport.on(
                event,
                Arc::new(move |data: &Value| reconciler.handle_frame(event, data)),
            ));
        }
        subscriptions
    }

    /// Decode and apply a raw frame. Unknown names and malformed payloads are
    /// dropped.
    pub fn handle_frame(&self, event: &str, data: &Value) {
        match ServerEvent::decode(event, data) {
            Ok(Some(decoded)) => self.apply(decoded),
            Ok(None) => debug!(%event, "ignoring unknown event"),
            Err(e) => warn!(%event, error = %e, "dropping malformed event payload"),
        }
    }

    pub fn apply(&self, event: ServerEvent) {
        let name = event.name();
        match event {
            ServerEvent::SessionCreated(session) => {
                let session_id = session.session_id.clone();
                let class_id = session.class_id.clone();
                if let Err(phase) = self.store.install_acknowledged(session) {
                    return self.unexpected(name, &session_id, &phase);
                }
                info!(%session_id, %class_id, "attendance session created");
                self.notifier
                    .notify(Notification::success("Attendance session created"));
            }

            ServerEvent::SessionJoined(joined) => {
                let session_id = joined.session.session_id.clone();
                if let Err(phase) = self.store.install_acknowledged(joined.session) {
                    return self.unexpected(name, &session_id, &phase);
                }
                info!(%session_id, "joined attendance session");
                self.notifier
                    .notify(Notification::info("Joined attendance session"));
            }

            ServerEvent::MarkSuccess(ack) | ServerEvent::BulkMarkSuccess(ack) => {
                let scope = ack.session_id.as_deref();
                if self.store.set_progress(scope, ack.session_progress).is_err() {
                    self.dropped(name, scope);
                }
            }

            ServerEvent::StudentMarked(marked) => {
                let scope = marked.session_id.as_deref();
                let message = format!(
                    "{} marked {} by {}",
                    marked.record.student_id, marked.record.status, marked.record.marked_by
                );
                if self
                    .store
                    .upsert_records(scope, vec![marked.record], marked.session_progress)
                    .is_err()
                {
                    return self.dropped(name, scope);
                }
                self.notifier.notify(Notification::info(message));
            }

            ServerEvent::BulkMarked(bulk) => {
                let scope = bulk.session_id.as_deref();
                let count = if bulk.records_count > 0 {
                    bulk.records_count
                } else {
                    bulk.records.len()
                };
                let message = if bulk.marked_by.is_empty() {
                    format!("{count} students marked")
                } else {
                    format!("{count} students marked by {}", bulk.marked_by)
                };
                if self
                    .store
                    .upsert_records(scope, bulk.records, bulk.session_progress)
                    .is_err()
                {
                    return self.dropped(name, scope);
                }
                self.notifier.notify(Notification::info(message));
            }

            ServerEvent::SessionStatus(status) => {
                let session_id = status.session.session_id.clone();
                if self.store.resync(status.session, status.progress).is_err() {
                    return self.dropped(name, Some(&session_id));
                }
                debug!(%session_id, "session resynchronized");
            }

            ServerEvent::SessionClosed(closed) => {
                let scope = closed.session_id.as_deref();
                if self.store.mark_inactive(scope).is_err() {
                    return self.dropped(name, scope);
                }
                let by = if closed.closed_by.is_empty() {
                    "another user"
                } else {
                    closed.closed_by.as_str()
                };
                self.notifier
                    .notify(Notification::warning(format!("Session closed by {by}")));
            }

            ServerEvent::CloseSuccess(ack) => {
                let scope = ack.session_id.as_deref();
                if self.store.clear_current(scope).is_err() {
                    return self.dropped(name, scope);
                }
                info!("attendance session closed");
                self.notifier
                    .notify(Notification::success("Attendance session closed"));
            }

            ServerEvent::UserJoined(change) => {
                let scope = change.session_id.as_deref();
                let email = change.user.email.clone();
                match self.store.add_viewer(scope, change.user) {
                    Ok(true) => self
                        .notifier
                        .notify(Notification::info(format!("{email} joined the session"))),
                    Ok(false) => debug!(%email, "viewer already present"),
                    Err(_) => self.dropped(name, scope),
                }
            }

            ServerEvent::UserLeft(change) => {
                let scope = change.session_id.as_deref();
                let email = &change.user.email;
                if self.store.remove_viewer(scope, email).is_err() {
                    return self.dropped(name, scope);
                }
                self.notifier
                    .notify(Notification::info(format!("{email} left the session")));
            }

            ServerEvent::Persisted(msg) => {
                let message = if msg.message.is_empty() {
                    "Attendance saved".to_string()
                } else {
                    msg.message
                };
                self.notifier.notify(Notification::success(message));
            }

            ServerEvent::Error(msg) => {
                warn!(message = %msg.message, "server reported an attendance error");
                let message = if msg.message.is_empty() {
                    "Attendance error".to_string()
                } else {
                    msg.message
                };
                self.notifier.notify(Notification::error(message));
            }

            ServerEvent::Stats(report) => {
                self.store.set_stats(report.summary);
            }
        }
    }

    /// The store refused a session-scoped event: there is no current
    /// session, or the event names another one.
    fn dropped(&self, event: &str, scope: Option<&str>) {
        match self.store.current_session_id() {
            None => warn!(%event, "dropping session event: no current session"),
            Some(current) => {
                let id = scope.unwrap_or_default();
                warn!(%event, %id, %current, "dropping event for a session that is not current")
            }
        }
    }

    /// Created/joined acknowledgements are only installed while the matching
    /// request is pending; anything else is a late or foreign answer.
    fn unexpected(&self, event: &str, session_id: &str, phase: &SessionPhase) {
        match phase {
            SessionPhase::Pending { .. } => {
                warn!(%event, %session_id, "acknowledgement does not match the pending request")
            }
            phase => warn!(%event, %session_id, ?phase, "unexpected session acknowledgement"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    use chrono::{NaiveDate, Utc};
    use tokio::sync::mpsc;

    use crate::model::{
        AttendanceRecord, AttendanceSession, AttendanceStats, AttendanceStatus, ConnectedViewer,
        SessionProgress,
    };
    use crate::notify::{ChannelSink, NotificationLevel};
    use crate::protocol::events::{
        BulkMarked, CloseAck, PresenceChange, names, ProgressAck, ServerMessage, SessionClosed,
        SessionJoined, SessionStatus, StatsReport, StudentMarked,
    };
    use crate::session::store::PendingRequest;

    fn setup() -> (Reconciler, Arc<SessionStore>, mpsc::UnboundedReceiver<Notification>) {
        let store = Arc::new(SessionStore::new());
        let (sink, rx) = ChannelSink::new();
        (Reconciler::new(store.clone(), Arc::new(sink)), store, rx)
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<Notification>) -> Vec<Notification> {
        let mut out = Vec::new();
        while let Ok(n) = rx.try_recv() {
            out.push(n);
        }
        out
    }

    fn session(id: &str) -> AttendanceSession {
        AttendanceSession {
            session_id: id.into(),
            class_id: "class-9".into(),
            workspace_id: "ws-1".into(),
            date: NaiveDate::from_ymd_opt(2024, 5, 1).unwrap(),
            total_students: 30,
            marked_students: 0,
            is_active: true,
            attendance_records: HashMap::new(),
        }
    }

    fn join_pending(store: &SessionStore, id: &str) {
        store.begin_pending(PendingRequest::Join {
            session_id: id.into(),
            class_id: "class-9".into(),
        });
    }

    fn active(id: &str) -> (Reconciler, Arc<SessionStore>, mpsc::UnboundedReceiver<Notification>) {
        let (reconciler, store, mut rx) = setup();
        join_pending(&store, id);
        reconciler.apply(ServerEvent::SessionJoined(SessionJoined {
            session: session(id),
        }));
        drain(&mut rx);
        (reconciler, store, rx)
    }

    fn marked(student: &str, status: AttendanceStatus, marked: u32) -> StudentMarked {
        StudentMarked {
            session_id: None,
            record: AttendanceRecord {
                student_id: student.into(),
                status,
                timestamp: Utc::now(),
                marked_by: "teacher@x.com".into(),
                notes: None,
            },
            session_progress: SessionProgress::compute(marked, 30),
        }
    }

    fn presence(email: &str) -> PresenceChange {
        PresenceChange {
            user: ConnectedViewer {
                email: email.into(),
                role: "teacher".into(),
            },
            session_id: None,
        }
    }

    #[test]
    fn test_join_ack_installs_session() {
        let (reconciler, store, mut rx) = setup();
        join_pending(&store, "s1");
        reconciler.apply(ServerEvent::SessionJoined(SessionJoined {
            session: session("s1"),
        }));
        assert_eq!(store.phase(), SessionPhase::Active);
        assert_eq!(store.current_session_id().as_deref(), Some("s1"));
        assert_eq!(drain(&mut rx).len(), 1);
    }

    #[test]
    fn test_unsolicited_ack_is_dropped() {
        let (reconciler, store, mut rx) = setup();
        reconciler.apply(ServerEvent::SessionCreated(session("s1")));
        assert!(!store.is_in_session());
        assert!(drain(&mut rx).is_empty());
    }

    #[test]
    fn test_ack_for_other_join_is_dropped() {
        let (reconciler, store, _rx) = setup();
        join_pending(&store, "s1");
        reconciler.apply(ServerEvent::SessionJoined(SessionJoined {
            session: session("s2"),
        }));
        assert!(!store.is_in_session());
        assert!(matches!(store.phase(), SessionPhase::Pending { .. }));
    }

    #[test]
    fn test_marked_uses_server_progress_verbatim() {
        let (reconciler, store, mut rx) = active("s1");
        // Progress that does not match the record map size must still be trusted.
        reconciler.apply(ServerEvent::StudentMarked(marked(
            "S1",
            AttendanceStatus::Present,
            17,
        )));
        let snap = store.snapshot();
        assert_eq!(snap.records.len(), 1);
        assert_eq!(snap.progress, Some(SessionProgress::compute(17, 30)));
        assert!(snap.last_update.is_some());
        assert_eq!(drain(&mut rx).len(), 1);
    }

    #[test]
    fn test_mark_success_replaces_progress_only() {
        let (reconciler, store, mut rx) = active("s1");
        reconciler.apply(ServerEvent::MarkSuccess(ProgressAck {
            session_progress: SessionProgress::compute(4, 30),
            session_id: Some("s1".into()),
        }));
        let snap = store.snapshot();
        assert_eq!(snap.progress, Some(SessionProgress::compute(4, 30)));
        assert!(snap.records.is_empty());
        assert!(drain(&mut rx).is_empty());
    }

    #[test]
    fn test_bulk_notification_mentions_count() {
        let (reconciler, store, mut rx) = active("s1");
        let a = marked("S2", AttendanceStatus::Absent, 0).record;
        let b = marked("S3", AttendanceStatus::Late, 0).record;
        reconciler.apply(ServerEvent::BulkMarked(BulkMarked {
            session_id: None,
            records: vec![a, b],
            records_count: 0,
            marked_by: "teacher@x.com".into(),
            session_progress: SessionProgress::compute(2, 30),
        }));
        assert_eq!(store.snapshot().records.len(), 2);
        let notes = drain(&mut rx);
        assert_eq!(notes.len(), 1);
        assert!(notes[0].message.contains("2 students"));
    }

    #[test]
    fn test_mismatched_session_id_is_dropped() {
        let (reconciler, store, mut rx) = active("s1");
        let mut event = marked("S1", AttendanceStatus::Present, 1);
        event.session_id = Some("s-old".into());
        reconciler.apply(ServerEvent::StudentMarked(event));
        assert!(store.snapshot().records.is_empty());
        assert!(drain(&mut rx).is_empty());
    }

    #[test]
    fn test_events_after_leave_are_dropped() {
        let (reconciler, store, mut rx) = active("s1");
        store.clear();
        reconciler.apply(ServerEvent::StudentMarked(marked(
            "S1",
            AttendanceStatus::Present,
            1,
        )));
        reconciler.apply(ServerEvent::SessionClosed(SessionClosed {
            closed_by: String::new(),
            session_id: Some("s1".into()),
        }));
        let snap = store.snapshot();
        assert!(!snap.is_in_session());
        assert!(snap.records.is_empty());
        assert!(snap.progress.is_none());
        assert!(drain(&mut rx).is_empty());
    }

    #[test]
    fn test_events_without_session_are_dropped() {
        let (reconciler, store, mut rx) = setup();
        reconciler.apply(ServerEvent::StudentMarked(marked(
            "S1",
            AttendanceStatus::Present,
            1,
        )));
        reconciler.apply(ServerEvent::UserJoined(presence("a@x.com")));
        reconciler.apply(ServerEvent::SessionStatus(SessionStatus {
            session: session("s1"),
            progress: SessionProgress::compute(0, 30),
        }));
        let snap = store.snapshot();
        assert!(!snap.is_in_session());
        assert!(snap.records.is_empty());
        assert!(snap.viewers.is_empty());
        assert!(drain(&mut rx).is_empty());
    }

    #[test]
    fn test_presence_join_is_idempotent() {
        let (reconciler, store, mut rx) = active("s1");
        for _ in 0..3 {
            reconciler.apply(ServerEvent::UserJoined(presence("a@x.com")));
        }
        assert_eq!(store.snapshot().viewers.len(), 1);
        assert_eq!(drain(&mut rx).len(), 1);
    }

    #[test]
    fn test_presence_leave_of_unknown_still_notifies() {
        let (reconciler, store, mut rx) = active("s1");
        reconciler.apply(ServerEvent::UserLeft(presence("ghost@x.com")));
        assert!(store.snapshot().viewers.is_empty());
        assert_eq!(drain(&mut rx).len(), 1);
    }

    #[test]
    fn test_error_does_not_mutate() {
        let (reconciler, store, mut rx) = active("s1");
        let before = store.snapshot();
        reconciler.apply(ServerEvent::Error(ServerMessage {
            message: "Student not enrolled".into(),
        }));
        let after = store.snapshot();
        assert_eq!(before.phase, after.phase);
        assert!(Arc::ptr_eq(&before.records, &after.records));
        let notes = drain(&mut rx);
        assert_eq!(notes[0].level, NotificationLevel::Error);
        assert_eq!(notes[0].message, "Student not enrolled");
    }

    #[test]
    fn test_error_while_pending_keeps_pending() {
        let (reconciler, store, _rx) = setup();
        join_pending(&store, "s1");
        reconciler.apply(ServerEvent::Error(ServerMessage {
            message: "Session not found".into(),
        }));
        assert!(matches!(store.phase(), SessionPhase::Pending { .. }));
    }

    #[test]
    fn test_closed_then_close_success() {
        let (reconciler, store, mut rx) = active("s1");
        reconciler.apply(ServerEvent::SessionClosed(SessionClosed {
            closed_by: "teacher@x.com".into(),
            session_id: None,
        }));
        let snap = store.snapshot();
        assert_eq!(snap.phase, SessionPhase::Closed);
        assert!(!snap.session.unwrap().is_active);
        assert!(drain(&mut rx)[0].message.contains("teacher@x.com"));

        reconciler.apply(ServerEvent::CloseSuccess(CloseAck::default()));
        assert_eq!(store.phase(), SessionPhase::Idle);
        assert!(!store.is_in_session());
    }

    #[test]
    fn test_persisted_and_stats_need_no_session() {
        let (reconciler, store, mut rx) = setup();
        reconciler.apply(ServerEvent::Persisted(ServerMessage::default()));
        reconciler.apply(ServerEvent::Stats(StatsReport {
            summary: AttendanceStats {
                total_students: 30,
                present_count: 25,
                absent_count: 3,
                late_count: 2,
                percentage: 90,
            },
        }));
        assert_eq!(store.snapshot().stats.unwrap().present_count, 25);
        assert!(!store.is_in_session());
        assert_eq!(drain(&mut rx)[0].message, "Attendance saved");
    }

    #[test]
    fn test_handle_frame_ignores_unknown_and_malformed() {
        let (reconciler, store, mut rx) = active("s1");
        let before = store.snapshot();
        reconciler.handle_frame("typing-start", &serde_json::json!({"x": 1}));
        reconciler.handle_frame(names::STUDENT_MARKED, &serde_json::json!({"studentId": 5}));
        assert!(Arc::ptr_eq(&before.records, &store.snapshot().records));
        assert!(drain(&mut rx).is_empty());
    }
}
