use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, NaiveDate, Utc};
use thiserror::Error;
use tokio::sync::watch;

use crate::model::{
    AttendanceRecord, AttendanceSession, AttendanceStats, ConnectedViewer, SessionId,
    SessionProgress, StudentId,
};

/// A create or join that is waiting for its acknowledgement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PendingRequest {
    Create {
        class_id: String,
        workspace_id: String,
        date: NaiveDate,
    },
    Join {
        session_id: SessionId,
        class_id: String,
    },
}

impl PendingRequest {
    /// Whether `session` is the answer to this request.
    pub fn matches(&self, session: &AttendanceSession) -> bool {
        match self {
            Self::Create {
                class_id,
                workspace_id,
                date,
            } => {
                session.class_id == *class_id
                    && session.workspace_id == *workspace_id
                    && session.date == *date
            }
            Self::Join { session_id, .. } => session.session_id == *session_id,
        }
    }

    pub fn describe(&self) -> &'static str {
        match self {
            Self::Create { .. } => "create the attendance session",
            Self::Join { .. } => "join the attendance session",
        }
    }
}

/// Where the client is in the session lifecycle.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum SessionPhase {
    #[default]
    Idle,
    Pending {
        request: PendingRequest,
        ticket: u64,
    },
    Active,
    /// Our own close command is in flight.
    Closing,
    /// The server announced the session closed; it is kept, inactive.
    Closed,
}

/// Immutable view of the store. Every mutation produces a new snapshot whose
/// sub-objects are fresh `Arc`s, so earlier snapshots never change.
#[derive(Debug, Clone, Default)]
pub struct SessionSnapshot {
    pub phase: SessionPhase,
    pub session: Option<Arc<AttendanceSession>>,
    pub progress: Option<SessionProgress>,
    pub records: Arc<HashMap<StudentId, AttendanceRecord>>,
    pub viewers: Arc<Vec<ConnectedViewer>>,
    pub last_update: Option<DateTime<Utc>>,
    pub stats: Option<Arc<AttendanceStats>>,
}

impl SessionSnapshot {
    pub fn is_in_session(&self) -> bool {
        self.session.is_some()
    }

    pub fn session_id(&self) -> Option<&str> {
        self.session.as_deref().map(|s| s.session_id.as_str())
    }

    pub fn record(&self, student_id: &str) -> Option<&AttendanceRecord> {
        self.records.get(student_id)
    }

    pub fn has_viewer(&self, email: &str) -> bool {
        self.viewers.iter().any(|v| v.email == email)
    }
}

/// A session-scoped event did not address the current session, or there
/// was none.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("event does not address the current session")]
pub struct NotCurrent;

/// Holds the single current session and its derived views. No I/O.
pub struct SessionStore {
    state: watch::Sender<SessionSnapshot>,
    next_ticket: AtomicU64,
}

impl Default for SessionStore {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionStore {
    pub fn new() -> Self {
        let (state, _) = watch::channel(SessionSnapshot::default());
        Self {
            state,
            next_ticket: AtomicU64::new(1),
        }
    }

    // ── Reads ───────────────────────────────────────────────────────

    pub fn snapshot(&self) -> SessionSnapshot {
        self.state.borrow().clone()
    }

    /// Views receive a new snapshot after every change.
    pub fn subscribe(&self) -> watch::Receiver<SessionSnapshot> {
        self.state.subscribe()
    }

    pub fn is_in_session(&self) -> bool {
        self.state.borrow().is_in_session()
    }

    pub fn current_session_id(&self) -> Option<SessionId> {
        self.state.borrow().session_id().map(str::to_string)
    }

    pub fn phase(&self) -> SessionPhase {
        self.state.borrow().phase.clone()
    }

    // ── Lifecycle ───────────────────────────────────────────────────

    /// Enter `Pending` for a create/join. Returns the ticket identifying it.
    pub fn begin_pending(&self, request: PendingRequest) -> u64 {
        let ticket = self.next_ticket.fetch_add(1, Ordering::Relaxed);
        self.state.send_modify(|s| {
            s.phase = SessionPhase::Pending { request, ticket };
        });
        ticket
    }

    /// Give up on the pending request `ticket`, if it is still the one pending.
    pub fn expire_pending(&self, ticket: u64) -> Option<PendingRequest> {
        let mut expired = None;
        self.state.send_if_modified(|s| match &s.phase {
            SessionPhase::Pending { request, ticket: t } if *t == ticket => {
                expired = Some(request.clone());
                s.phase = SessionPhase::Idle;
                true
            }
            _ => false,
        });
        expired
    }

    /// Install `session` unconditionally, replacing whatever was current.
    /// Its record map is moved into the store; progress derives from the
    /// session's own counters.
    pub fn install(&self, mut session: AttendanceSession) {
        let records = take_records(&mut session);
        self.state.send_modify(|s| fill(s, session, records));
    }

    /// Install the answer to the pending create/join. The pending check and
    /// the write happen under one lock, so a request abandoned or expired
    /// concurrently is never revived. On rejection returns the phase found.
    pub fn install_acknowledged(
        &self,
        mut session: AttendanceSession,
    ) -> Result<(), SessionPhase> {
        let records = take_records(&mut session);
        let mut outcome = Ok(());
        self.state.send_if_modified(|s| match &s.phase {
            SessionPhase::Pending { request, .. } if request.matches(&session) => {
                fill(s, session, records);
                true
            }
            phase => {
                outcome = Err(phase.clone());
                false
            }
        });
        outcome
    }

    /// Give up on whatever create/join is pending, regardless of ticket.
    pub fn abandon_pending(&self) -> Option<PendingRequest> {
        let mut abandoned = None;
        self.state.send_if_modified(|s| {
            let SessionPhase::Pending { request, .. } = &s.phase else {
                return false;
            };
            abandoned = Some(request.clone());
            s.phase = SessionPhase::Idle;
            true
        });
        abandoned
    }

    /// Replace session, progress and records wholesale (reconnect/refresh).
    /// Only applies while `session` is the current one.
    pub fn resync(
        &self,
        mut session: AttendanceSession,
        progress: SessionProgress,
    ) -> Result<(), NotCurrent> {
        let records = take_records(&mut session);
        let id = session.session_id.clone();
        self.update(Some(&id), |s| {
            s.phase = phase_for(&session, &s.phase);
            s.session = Some(Arc::new(session));
            s.progress = Some(progress);
            s.records = Arc::new(records);
            s.last_update = Some(Utc::now());
        })
    }

    /// Our own close command was sent.
    pub fn begin_closing(&self) {
        self.state.send_if_modified(|s| {
            if s.session.is_none() {
                return false;
            }
            s.phase = SessionPhase::Closing;
            true
        });
    }

    /// The session was closed by someone; keep it around, inactive.
    pub fn mark_inactive(&self, scope: Option<&str>) -> Result<(), NotCurrent> {
        self.update(scope, |s| {
            if let Some(current) = s.session.as_deref() {
                let mut closed = current.clone();
                closed.is_active = false;
                s.session = Some(Arc::new(closed));
            }
            if s.phase != SessionPhase::Closing {
                s.phase = SessionPhase::Closed;
            }
            s.last_update = Some(Utc::now());
        })
    }

    /// Drop session, progress, records and viewers. Stats are independent
    /// of the session and survive.
    pub fn clear(&self) {
        self.state.send_modify(reset);
    }

    /// [`clear`](Self::clear), but only if the event addressed the current session.
    pub fn clear_current(&self, scope: Option<&str>) -> Result<(), NotCurrent> {
        self.update(scope, reset)
    }

    // ── Records & progress ──────────────────────────────────────────

    pub fn set_progress(
        &self,
        scope: Option<&str>,
        progress: SessionProgress,
    ) -> Result<(), NotCurrent> {
        self.update(scope, |s| s.progress = Some(progress))
    }

    /// Replace each record by student id (last writer wins) and take the
    /// server's progress verbatim.
    pub fn upsert_records(
        &self,
        scope: Option<&str>,
        records: Vec<AttendanceRecord>,
        progress: SessionProgress,
    ) -> Result<(), NotCurrent> {
        self.update(scope, |s| {
            let mut map = (*s.records).clone();
            for record in records {
                map.insert(record.student_id.clone(), record);
            }
            s.records = Arc::new(map);
            s.progress = Some(progress);
            s.last_update = Some(Utc::now());
        })
    }

    // ── Presence ────────────────────────────────────────────────────

    /// `Ok(false)` if a viewer with the same email is already present.
    pub fn add_viewer(
        &self,
        scope: Option<&str>,
        viewer: ConnectedViewer,
    ) -> Result<bool, NotCurrent> {
        let mut outcome = Err(NotCurrent);
        self.state.send_if_modified(|s| {
            if !targets(s, scope) {
                return false;
            }
            let added = !s.has_viewer(&viewer.email);
            if added {
                let mut viewers = (*s.viewers).clone();
                viewers.push(viewer);
                s.viewers = Arc::new(viewers);
            }
            outcome = Ok(added);
            added
        });
        outcome
    }

    /// `Ok(false)` if no viewer had that email.
    pub fn remove_viewer(&self, scope: Option<&str>, email: &str) -> Result<bool, NotCurrent> {
        let mut outcome = Err(NotCurrent);
        self.state.send_if_modified(|s| {
            if !targets(s, scope) {
                return false;
            }
            let removed = s.has_viewer(email);
            if removed {
                let viewers = s.viewers.iter().filter(|v| v.email != email).cloned().collect();
                s.viewers = Arc::new(viewers);
            }
            outcome = Ok(removed);
            removed
        });
        outcome
    }

    /// Apply `change` only if `scope` addresses the current session, checked
    /// under the same lock as the write.
    fn update(
        &self,
        scope: Option<&str>,
        change: impl FnOnce(&mut SessionSnapshot),
    ) -> Result<(), NotCurrent> {
        let mut outcome = Err(NotCurrent);
        self.state.send_if_modified(|s| {
            if !targets(s, scope) {
                return false;
            }
            change(s);
            outcome = Ok(());
            true
        });
        outcome
    }

    // ── Stats ───────────────────────────────────────────────────────

    pub fn set_stats(&self, stats: AttendanceStats) {
        self.state.send_modify(|s| {
            s.stats = Some(Arc::new(stats));
        });
    }
}

fn take_records(session: &mut AttendanceSession) -> HashMap<StudentId, AttendanceRecord> {
    std::mem::take(&mut session.attendance_records)
        .into_iter()
        .map(|(student_id, mut record)| {
            if record.student_id.is_empty() {
                record.student_id = student_id.clone();
            }
            (student_id, record)
        })
        .collect()
}

/// Session-scoped events need a current session, and must name it when
/// they name any session at all.
fn targets(s: &SessionSnapshot, scope: Option<&str>) -> bool {
    s.session_id()
        .is_some_and(|current| scope.is_none_or(|id| id == current))
}

fn fill(
    s: &mut SessionSnapshot,
    session: AttendanceSession,
    records: HashMap<StudentId, AttendanceRecord>,
) {
    s.phase = phase_for(&session, &SessionPhase::Idle);
    s.progress = Some(SessionProgress::compute(
        session.marked_students,
        session.total_students,
    ));
    s.session = Some(Arc::new(session));
    s.records = Arc::new(records);
    s.viewers = Arc::new(Vec::new());
    s.last_update = Some(Utc::now());
}

fn reset(s: &mut SessionSnapshot) {
    s.phase = SessionPhase::Idle;
    s.session = None;
    s.progress = None;
    s.records = Arc::new(HashMap::new());
    s.viewers = Arc::new(Vec::new());
    s.last_update = None;
}

fn phase_for(session: &AttendanceSession, previous: &SessionPhase) -> SessionPhase {
    match previous {
        SessionPhase::Closing => SessionPhase::Closing,
        _ if !session.is_active => SessionPhase::Closed,
        _ => SessionPhase::Active,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::AttendanceStatus;

    fn session(id: &str, total: u32, marked: u32) -> AttendanceSession {
        AttendanceSession {
            session_id: id.into(),
            class_id: "class-9".into(),
            workspace_id: "ws-1".into(),
            date: NaiveDate::from_ymd_opt(2024, 5, 1).unwrap(),
            total_students: total,
            marked_students: marked,
            is_active: true,
            attendance_records: HashMap::new(),
        }
    }

    fn record(student: &str, status: AttendanceStatus) -> AttendanceRecord {
        AttendanceRecord {
            student_id: student.into(),
            status,
            timestamp: Utc::now(),
            marked_by: "teacher@x.com".into(),
            notes: None,
        }
    }

    fn viewer(email: &str) -> ConnectedViewer {
        ConnectedViewer {
            email: email.into(),
            role: "teacher".into(),
        }
    }

    #[test]
    fn test_install_derives_progress_and_moves_records() {
        let store = SessionStore::new();
        let mut s = session("s1", 30, 1);
        s.attendance_records
            .insert("S9".into(), record("", AttendanceStatus::Late));
        store.install(s);

        let snap = store.snapshot();
        assert_eq!(snap.phase, SessionPhase::Active);
        assert_eq!(snap.progress, Some(SessionProgress::compute(1, 30)));
        assert_eq!(snap.record("S9").unwrap().student_id, "S9");
        assert!(snap.session.unwrap().attendance_records.is_empty());
    }

    #[test]
    fn test_old_snapshots_are_not_mutated() {
        let store = SessionStore::new();
        store.install(session("s1", 3, 0));
        let before = store.snapshot();
        store
            .upsert_records(
                None,
                vec![record("S1", AttendanceStatus::Present)],
                SessionProgress::compute(1, 3),
            )
            .unwrap();
        store.add_viewer(None, viewer("a@x.com")).unwrap();

        assert!(before.records.is_empty());
        assert!(before.viewers.is_empty());
        assert_eq!(before.progress, Some(SessionProgress::compute(0, 3)));
        let after = store.snapshot();
        assert!(!Arc::ptr_eq(&before.records, &after.records));
    }

    #[test]
    fn test_upsert_last_writer_wins() {
        let store = SessionStore::new();
        store.install(session("s1", 3, 0));
        store
            .upsert_records(
                Some("s1"),
                vec![record("S1", AttendanceStatus::Present)],
                SessionProgress::compute(1, 3),
            )
            .unwrap();
        store
            .upsert_records(
                None,
                vec![record("S1", AttendanceStatus::Absent)],
                SessionProgress::compute(1, 3),
            )
            .unwrap();
        let snap = store.snapshot();
        assert_eq!(snap.records.len(), 1);
        assert_eq!(snap.record("S1").unwrap().status, AttendanceStatus::Absent);
    }

    #[test]
    fn test_viewers_unique_by_email() {
        let store = SessionStore::new();
        store.install(session("s1", 3, 0));
        assert_eq!(store.add_viewer(None, viewer("a@x.com")), Ok(true));
        assert_eq!(store.add_viewer(None, viewer("a@x.com")), Ok(false));
        assert_eq!(store.snapshot().viewers.len(), 1);
        assert_eq!(store.remove_viewer(None, "a@x.com"), Ok(true));
        assert_eq!(store.remove_viewer(None, "a@x.com"), Ok(false));
    }

    #[test]
    fn test_pending_ticket_expiry() {
        let store = SessionStore::new();
        let request = PendingRequest::Join {
            session_id: "s1".into(),
            class_id: "class-9".into(),
        };
        let stale = store.begin_pending(request.clone());
        let current = store.begin_pending(request.clone());

        assert_eq!(store.expire_pending(stale), None);
        assert!(matches!(store.phase(), SessionPhase::Pending { .. }));
        assert_eq!(store.expire_pending(current), Some(request));
        assert_eq!(store.phase(), SessionPhase::Idle);
    }

    #[test]
    fn test_expire_after_install_is_noop() {
        let store = SessionStore::new();
        let ticket = store.begin_pending(PendingRequest::Join {
            session_id: "s1".into(),
            class_id: "class-9".into(),
        });
        store.install(session("s1", 3, 0));
        assert_eq!(store.expire_pending(ticket), None);
        assert_eq!(store.phase(), SessionPhase::Active);
    }

    #[test]
    fn test_mark_inactive_keeps_session() {
        let store = SessionStore::new();
        store.install(session("s1", 3, 0));
        store.mark_inactive(None).unwrap();
        let snap = store.snapshot();
        assert_eq!(snap.phase, SessionPhase::Closed);
        assert!(!snap.session.unwrap().is_active);
    }

    #[test]
    fn test_clear_keeps_stats() {
        let store = SessionStore::new();
        store.install(session("s1", 3, 0));
        store.add_viewer(None, viewer("a@x.com")).unwrap();
        store.set_stats(AttendanceStats {
            total_students: 3,
            present_count: 3,
            ..Default::default()
        });
        store.clear();

        let snap = store.snapshot();
        assert!(!snap.is_in_session());
        assert!(snap.progress.is_none());
        assert!(snap.records.is_empty());
        assert!(snap.viewers.is_empty());
        assert_eq!(snap.stats.unwrap().present_count, 3);
    }

    #[test]
    fn test_resync_while_closing_stays_closing() {
        let store = SessionStore::new();
        store.install(session("s1", 3, 0));
        store.begin_closing();
        store
            .resync(session("s1", 3, 2), SessionProgress::compute(2, 3))
            .unwrap();
        assert_eq!(store.phase(), SessionPhase::Closing);
        assert_eq!(store.snapshot().progress.unwrap().marked_students, 2);
    }

    #[test]
    fn test_scoped_updates_need_the_current_session() {
        let store = SessionStore::new();
        let progress = SessionProgress::compute(1, 3);
        assert_eq!(store.set_progress(None, progress), Err(NotCurrent));
        assert_eq!(store.add_viewer(None, viewer("a@x.com")), Err(NotCurrent));
        assert_eq!(store.mark_inactive(None), Err(NotCurrent));
        assert_eq!(
            store.resync(session("s1", 3, 1), progress),
            Err(NotCurrent)
        );
        assert!(!store.is_in_session());

        store.install(session("s1", 3, 0));
        let before = store.snapshot();
        assert_eq!(
            store.upsert_records(
                Some("s0"),
                vec![record("S1", AttendanceStatus::Present)],
                progress
            ),
            Err(NotCurrent)
        );
        assert_eq!(store.remove_viewer(Some("s0"), "a@x.com"), Err(NotCurrent));
        assert_eq!(store.clear_current(Some("s0")), Err(NotCurrent));
        let after = store.snapshot();
        assert!(Arc::ptr_eq(&before.records, &after.records));
        assert_eq!(after.progress, Some(SessionProgress::compute(0, 3)));

        assert_eq!(store.clear_current(Some("s1")), Ok(()));
        assert!(!store.is_in_session());
    }

    #[test]
    fn test_acknowledgement_installs_only_while_pending() {
        let store = SessionStore::new();
        assert_eq!(
            store.install_acknowledged(session("s1", 3, 0)),
            Err(SessionPhase::Idle)
        );

        let ticket = store.begin_pending(PendingRequest::Join {
            session_id: "s1".into(),
            class_id: "class-9".into(),
        });
        assert!(store.install_acknowledged(session("s2", 3, 0)).is_err());
        assert_eq!(store.install_acknowledged(session("s1", 3, 1)), Ok(()));
        assert_eq!(store.phase(), SessionPhase::Active);
        assert_eq!(store.expire_pending(ticket), None);

        // A second copy of the same acknowledgement is late.
        assert_eq!(
            store.install_acknowledged(session("s1", 3, 0)),
            Err(SessionPhase::Active)
        );
        assert_eq!(store.snapshot().progress.unwrap().marked_students, 1);
    }

    #[test]
    fn test_abandoned_request_cannot_be_installed() {
        let store = SessionStore::new();
        let request = PendingRequest::Join {
            session_id: "s1".into(),
            class_id: "class-9".into(),
        };
        let ticket = store.begin_pending(request.clone());
        assert_eq!(store.abandon_pending(), Some(request));
        assert_eq!(store.abandon_pending(), None);
        assert_eq!(store.expire_pending(ticket), None);
        assert!(store.install_acknowledged(session("s1", 3, 0)).is_err());
        assert!(!store.is_in_session());
    }

    #[test]
    fn test_pending_request_matching() {
        let create = PendingRequest::Create {
            class_id: "class-9".into(),
            workspace_id: "ws-1".into(),
            date: NaiveDate::from_ymd_opt(2024, 5, 1).unwrap(),
        };
        assert!(create.matches(&session("any", 1, 0)));
        let mut other = session("any", 1, 0);
        other.class_id = "class-10".into();
        assert!(!create.matches(&other));

        let join = PendingRequest::Join {
            session_id: "s1".into(),
            class_id: "class-9".into(),
        };
        assert!(join.matches(&session("s1", 1, 0)));
        assert!(!join.matches(&session("s2", 1, 0)));
    }

    #[tokio::test]
    async fn test_subscribers_see_changes() {
        let store = SessionStore::new();
        let mut rx = store.subscribe();
        store.install(session("s1", 3, 0));
        rx.changed().await.unwrap();
        assert_eq!(rx.borrow().session_id(), Some("s1"));
    }
}
