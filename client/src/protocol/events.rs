use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::frame::Frame;
use crate::model::{
    AttendanceRecord, AttendanceSession, AttendanceStats, ConnectedViewer, SessionId,
    SessionProgress,
};

/// Inbound event names, exactly as the backend emits them.
pub mod names {
    pub const SESSION_CREATED: &str = "attendance-session-created";
    pub const SESSION_JOINED: &str = "attendance-session-joined";
    pub const USER_JOINED: &str = "user-joined-session";
    pub const USER_LEFT: &str = "user-left-session";
    pub const STUDENT_MARKED: &str = "student-attendance-marked";
    pub const BULK_MARKED: &str = "bulk-attendance-marked";
    pub const SESSION_STATUS: &str = "session-status";
    pub const SESSION_CLOSED: &str = "session-closed";
    pub const STATS: &str = "attendance-stats";
    pub const MARK_SUCCESS: &str = "attendance-marked-success";
    pub const BULK_MARK_SUCCESS: &str = "bulk-attendance-success";
    pub const CLOSE_SUCCESS: &str = "session-close-success";
    pub const PERSISTED: &str = "session-persisted";
    pub const ERROR: &str = "attendance-error";
}

/// Every event name the reconciler listens for.
pub const INBOUND: [&str; 14] = [
    names::SESSION_CREATED,
    names::SESSION_JOINED,
    names::USER_JOINED,
    names::USER_LEFT,
    names::STUDENT_MARKED,
    names::BULK_MARKED,
    names::SESSION_STATUS,
    names::SESSION_CLOSED,
    names::STATS,
    names::MARK_SUCCESS,
    names::BULK_MARK_SUCCESS,
    names::CLOSE_SUCCESS,
    names::PERSISTED,
    names::ERROR,
];

/// An event pushed by the attendance backend.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerEvent {
    /// Acknowledges our create command with the freshly opened session.
    SessionCreated(AttendanceSession),
    /// Acknowledges our join command.
    SessionJoined(SessionJoined),
    /// Another user started viewing the session.
    UserJoined(PresenceChange),
    /// A viewer left the session.
    UserLeft(PresenceChange),
    /// Broadcast of a single student's mark.
    StudentMarked(StudentMarked),
    /// Broadcast of a bulk mark.
    BulkMarked(BulkMarked),
    /// Full resynchronization of the session.
    SessionStatus(SessionStatus),
    /// Someone closed the session (broadcast to every viewer).
    SessionClosed(SessionClosed),
    /// Response to a stats request.
    Stats(StatsReport),
    /// Acknowledges our single mark.
    MarkSuccess(ProgressAck),
    /// Acknowledges our bulk mark.
    BulkMarkSuccess(ProgressAck),
    /// Acknowledges our own close command.
    CloseSuccess(CloseAck),
    /// The session's records were durably committed.
    Persisted(ServerMessage),
    /// Domain error reported by the server.
    Error(ServerMessage),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionJoined {
    pub session: AttendanceSession,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceChange {
    pub user: ConnectedViewer,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<SessionId>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StudentMarked {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<SessionId>,
    #[serde(flatten)]
    pub record: AttendanceRecord,
    pub session_progress: SessionProgress,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BulkMarked {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<SessionId>,
    pub records: Vec<AttendanceRecord>,
    #[serde(default)]
    pub records_count: usize,
    #[serde(default)]
    pub marked_by: String,
    pub session_progress: SessionProgress,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionStatus {
    pub session: AttendanceSession,
    pub progress: SessionProgress,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionClosed {
    #[serde(default)]
    pub closed_by: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<SessionId>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatsReport {
    pub summary: AttendanceStats,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressAck {
    pub session_progress: SessionProgress,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<SessionId>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CloseAck {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<SessionId>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ServerMessage {
    #[serde(default)]
    pub message: String,
}

impl ServerEvent {
    /// Decode a payload for the named event. Returns `Ok(None)` for event names
    /// outside the attendance vocabulary.
    pub fn decode(event: &str, data: &Value) -> Result<Option<Self>, serde_json::Error> {
        // Payload-less events arrive with `null` data.
        let data = match data {
            Value::Null => Value::Object(Default::default()),
            other => other.clone(),
        };

        let decoded = match event {
            names::SESSION_CREATED => Self::SessionCreated(serde_json::from_value(data)?),
            names::SESSION_JOINED => Self::SessionJoined(serde_json::from_value(data)?),
            names::USER_JOINED => Self::UserJoined(serde_json::from_value(data)?),
            names::USER_LEFT => Self::UserLeft(serde_json::from_value(data)?),
            names::STUDENT_MARKED => Self::StudentMarked(serde_json::from_value(data)?),
            names::BULK_MARKED => Self::BulkMarked(serde_json::from_value(data)?),
            names::SESSION_STATUS => Self::SessionStatus(serde_json::from_value(data)?),
            names::SESSION_CLOSED => Self::SessionClosed(serde_json::from_value(data)?),
            names::STATS => Self::Stats(serde_json::from_value(data)?),
            names::MARK_SUCCESS => Self::MarkSuccess(serde_json::from_value(data)?),
            names::BULK_MARK_SUCCESS => Self::BulkMarkSuccess(serde_json::from_value(data)?),
            names::CLOSE_SUCCESS => Self::CloseSuccess(serde_json::from_value(data)?),
            names::PERSISTED => Self::Persisted(serde_json::from_value(data)?),
            names::ERROR => Self::Error(serde_json::from_value(data)?),
            _ => return Ok(None),
        };
        Ok(Some(decoded))
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::SessionCreated(_) => names::SESSION_CREATED,
            Self::SessionJoined(_) => names::SESSION_JOINED,
            Self::UserJoined(_) => names::USER_JOINED,
            Self::UserLeft(_) => names::USER_LEFT,
            Self::StudentMarked(_) => names::STUDENT_MARKED,
            Self::BulkMarked(_) => names::BULK_MARKED,
            Self::SessionStatus(_) => names::SESSION_STATUS,
            Self::SessionClosed(_) => names::SESSION_CLOSED,
            Self::Stats(_) => names::STATS,
            Self::MarkSuccess(_) => names::MARK_SUCCESS,
            Self::BulkMarkSuccess(_) => names::BULK_MARK_SUCCESS,
            Self::CloseSuccess(_) => names::CLOSE_SUCCESS,
            Self::Persisted(_) => names::PERSISTED,
            Self::Error(_) => names::ERROR,
        }
    }

    /// The session this event refers to, when the payload names one.
    pub fn session_id(&self) -> Option<&str> {
        match self {
            Self::SessionCreated(session) => Some(&session.session_id),
            Self::SessionJoined(joined) => Some(&joined.session.session_id),
            Self::SessionStatus(status) => Some(&status.session.session_id),
            Self::UserJoined(change) | Self::UserLeft(change) => change.session_id.as_deref(),
            Self::StudentMarked(marked) => marked.session_id.as_deref(),
            Self::BulkMarked(marked) => marked.session_id.as_deref(),
            Self::SessionClosed(closed) => closed.session_id.as_deref(),
            Self::MarkSuccess(ack) | Self::BulkMarkSuccess(ack) => ack.session_id.as_deref(),
            Self::CloseSuccess(ack) => ack.session_id.as_deref(),
            Self::Stats(_) | Self::Persisted(_) | Self::Error(_) => None,
        }
    }

    /// Encode back into a frame, as the server would send it.
    pub fn to_frame(&self) -> Result<Frame, serde_json::Error> {
        let data = match self {
            Self::SessionCreated(p) => serde_json::to_value(p)?,
            Self::SessionJoined(p) => serde_json::to_value(p)?,
            Self::UserJoined(p) | Self::UserLeft(p) => serde_json::to_value(p)?,
            Self::StudentMarked(p) => serde_json::to_value(p)?,
            Self::BulkMarked(p) => serde_json::to_value(p)?,
            Self::SessionStatus(p) => serde_json::to_value(p)?,
            Self::SessionClosed(p) => serde_json::to_value(p)?,
            Self::Stats(p) => serde_json::to_value(p)?,
            Self::MarkSuccess(p) | Self::BulkMarkSuccess(p) => serde_json::to_value(p)?,
            Self::CloseSuccess(p) => serde_json::to_value(p)?,
            Self::Persisted(p) | Self::Error(p) => serde_json::to_value(p)?,
        };
        Ok(Frame::new(self.name(), data))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::AttendanceStatus;
    use serde_json::json;

    #[test]
    fn test_unknown_event_is_ignored() {
        let decoded = ServerEvent::decode("typing-start", &json!({"who": "x"})).unwrap();
        assert!(decoded.is_none());
    }

    #[test]
    fn test_student_marked_flattens_record() {
        let data = json!({
            "studentId": "S1",
            "status": "present",
            "timestamp": "2024-05-01T08:00:00Z",
            "markedBy": "teacher@x.com",
            "sessionProgress": {"markedStudents": 1, "totalStudents": 30, "percentage": 3}
        });
        let event = ServerEvent::decode(names::STUDENT_MARKED, &data)
            .unwrap()
            .unwrap();
        match event {
            ServerEvent::StudentMarked(marked) => {
                assert_eq!(marked.record.student_id, "S1");
                assert_eq!(marked.record.status, AttendanceStatus::Present);
                assert_eq!(marked.session_progress, SessionProgress::compute(1, 30));
                assert!(marked.session_id.is_none());
            }
            other => panic!("Wrong variant: {other:?}"),
        }
    }

    #[test]
    fn test_payloadless_close_success() {
        let event = ServerEvent::decode(names::CLOSE_SUCCESS, &Value::Null)
            .unwrap()
            .unwrap();
        assert_eq!(event, ServerEvent::CloseSuccess(CloseAck::default()));
        assert_eq!(event.session_id(), None);
    }

    #[test]
    fn test_malformed_payload_is_an_error() {
        let result = ServerEvent::decode(names::USER_JOINED, &json!({"user": 42}));
        assert!(result.is_err());
    }

    #[test]
    fn test_joined_session_id_comes_from_nested_session() {
        let data = json!({
            "session": {
                "sessionId": "sess-7",
                "classId": "c1",
                "workspaceId": "w1",
                "date": "2024-05-01",
                "totalStudents": 2
            }
        });
        let event = ServerEvent::decode(names::SESSION_JOINED, &data)
            .unwrap()
            .unwrap();
        assert_eq!(event.session_id(), Some("sess-7"));
        assert_eq!(event.name(), names::SESSION_JOINED);
    }

    #[test]
    fn test_to_frame_uses_wire_name() {
        let event = ServerEvent::Error(ServerMessage {
            message: "Session not found".into(),
        });
        let frame = event.to_frame().unwrap();
        assert_eq!(frame.event, "attendance-error");
        assert_eq!(frame.data, json!({"message": "Session not found"}));
        let back = ServerEvent::decode(&frame.event, &frame.data).unwrap();
        assert_eq!(back, Some(event));
    }

    #[test]
    fn test_inbound_names_are_unique() {
        let mut sorted = INBOUND.to_vec();
        sorted.sort_unstable();
        sorted.dedup();
        assert_eq!(sorted.len(), INBOUND.len());
    }
}
