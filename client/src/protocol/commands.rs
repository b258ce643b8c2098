use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use super::frame::Frame;
use crate::model::{AttendanceStatus, SessionId, StudentId, calendar_date};

/// Outbound intent, serialized directly into the `{"event", "data"}` frame shape.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum ClientCommand {
    #[serde(rename = "create-attendance-session", rename_all = "camelCase")]
    CreateSession {
        class_id: String,
        workspace_id: String,
        #[serde(with = "calendar_date")]
        date: NaiveDate,
        total_students: u32,
    },

    #[serde(rename = "join-attendance-session", rename_all = "camelCase")]
    JoinSession {
        session_id: SessionId,
        class_id: String,
    },

    #[serde(rename = "leave-attendance-session", rename_all = "camelCase")]
    LeaveSession { session_id: SessionId },

    #[serde(rename = "mark-attendance", rename_all = "camelCase")]
    MarkAttendance {
        session_id: SessionId,
        student_id: StudentId,
        status: AttendanceStatus,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        notes: Option<String>,
    },

    #[serde(rename = "bulk-mark-attendance", rename_all = "camelCase")]
    BulkMarkAttendance {
        session_id: SessionId,
        records: Vec<MarkEntry>,
    },

    #[serde(rename = "get-session-status", rename_all = "camelCase")]
    GetSessionStatus { session_id: SessionId },

    #[serde(rename = "close-attendance-session", rename_all = "camelCase")]
    CloseSession { session_id: SessionId },

    #[serde(rename = "get-attendance-stats", rename_all = "camelCase")]
    GetStats {
        class_id: String,
        workspace_id: String,
        #[serde(with = "calendar_date")]
        date: NaiveDate,
    },
}

/// One entry of a bulk mark request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MarkEntry {
    pub student_id: StudentId,
    pub status: AttendanceStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
}

impl MarkEntry {
    pub fn new(student_id: impl Into<StudentId>, status: AttendanceStatus) -> Self {
        Self {
            student_id: student_id.into(),
            status,
            notes: None,
        }
    }

    #[must_use]
    pub fn with_notes(mut self, notes: impl Into<String>) -> Self {
        self.notes = Some(notes.into());
        self
    }
}

impl ClientCommand {
    pub fn name(&self) -> &'static str {
        match self {
            Self::CreateSession { .. } => "create-attendance-session",
            Self::JoinSession { .. } => "join-attendance-session",
            Self::LeaveSession { .. } => "leave-attendance-session",
            Self::MarkAttendance { .. } => "mark-attendance",
            Self::BulkMarkAttendance { .. } => "bulk-mark-attendance",
            Self::GetSessionStatus { .. } => "get-session-status",
            Self::CloseSession { .. } => "close-attendance-session",
            Self::GetStats { .. } => "get-attendance-stats",
        }
    }

    pub fn session_id(&self) -> Option<&str> {
        match self {
            Self::JoinSession { session_id, .. }
            | Self::LeaveSession { session_id }
            | Self::MarkAttendance { session_id, .. }
            | Self::BulkMarkAttendance { session_id, .. }
            | Self::GetSessionStatus { session_id }
            | Self::CloseSession { session_id } => Some(session_id),
            Self::CreateSession { .. } | Self::GetStats { .. } => None,
        }
    }

    pub fn to_frame(&self) -> Result<Frame, serde_json::Error> {
        serde_json::from_value(serde_json::to_value(self)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn may_first() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 5, 1).unwrap()
    }

    #[test]
    fn test_create_frame_fields() {
        let cmd = ClientCommand::CreateSession {
            class_id: "c1".into(),
            workspace_id: "w1".into(),
            date: may_first(),
            total_students: 30,
        };
        let frame = cmd.to_frame().unwrap();
        assert_eq!(frame.event, cmd.name());
        assert_eq!(
            frame.data,
            json!({"classId": "c1", "workspaceId": "w1", "date": "2024-05-01", "totalStudents": 30})
        );
    }

    #[test]
    fn test_mark_frame_skips_missing_notes() {
        let cmd = ClientCommand::MarkAttendance {
            session_id: "s1".into(),
            student_id: "S1".into(),
            status: AttendanceStatus::Present,
            notes: None,
        };
        let frame = cmd.to_frame().unwrap();
        assert_eq!(frame.event, "mark-attendance");
        assert_eq!(
            frame.data,
            json!({"sessionId": "s1", "studentId": "S1", "status": "present"})
        );
    }

    #[test]
    fn test_bulk_frame_records() {
        let cmd = ClientCommand::BulkMarkAttendance {
            session_id: "s1".into(),
            records: vec![
                MarkEntry::new("S2", AttendanceStatus::Absent),
                MarkEntry::new("S3", AttendanceStatus::Late).with_notes("bus"),
            ],
        };
        let frame = cmd.to_frame().unwrap();
        assert_eq!(frame.data["records"][1]["notes"], json!("bus"));
        assert_eq!(frame.data["records"][0]["studentId"], json!("S2"));
        assert_eq!(cmd.session_id(), Some("s1"));
    }

    #[test]
    fn test_stats_has_no_session() {
        let cmd = ClientCommand::GetStats {
            class_id: "c1".into(),
            workspace_id: "w1".into(),
            date: may_first(),
        };
        assert_eq!(cmd.session_id(), None);
        assert_eq!(cmd.to_frame().unwrap().event, "get-attendance-stats");
    }

    #[test]
    fn test_name_matches_serde_tag_for_every_variant() {
        let commands = vec![
            ClientCommand::JoinSession {
                session_id: "s".into(),
                class_id: "c".into(),
            },
            ClientCommand::LeaveSession {
                session_id: "s".into(),
            },
            ClientCommand::GetSessionStatus {
                session_id: "s".into(),
            },
            ClientCommand::CloseSession {
                session_id: "s".into(),
            },
        ];
        for cmd in commands {
            let frame = cmd.to_frame().unwrap();
            assert_eq!(frame.event, cmd.name());
            assert_eq!(frame.data["sessionId"], json!("s"));
        }
    }
}
