use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

/// Server-assigned, opaque session identifier.
pub type SessionId = String;

/// Student identifier, unique within a session's record map.
pub type StudentId = String;

/// Status vocabulary of the live marking session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AttendanceStatus {
    Present,
    Absent,
    Late,
}

impl AttendanceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Present => "present",
            Self::Absent => "absent",
            Self::Late => "late",
        }
    }
}

impl fmt::Display for AttendanceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AttendanceStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "present" | "p" => Ok(Self::Present),
            "absent" | "a" => Ok(Self::Absent),
            "late" | "l" => Ok(Self::Late),
            other => Err(format!(
                "Unknown attendance status '{other}' (expected present, absent or late)"
            )),
        }
    }
}

/// Status vocabulary of historical attendance reports.
///
/// Kept apart from [`AttendanceStatus`]: every live status widens into a report
/// status, but half-day, holiday and leave have no live counterpart.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ReportStatus {
    Present,
    Absent,
    Late,
    HalfDay,
    Holiday,
    Leave,
}

impl From<AttendanceStatus> for ReportStatus {
    fn from(status: AttendanceStatus) -> Self {
        match status {
            AttendanceStatus::Present => Self::Present,
            AttendanceStatus::Absent => Self::Absent,
            AttendanceStatus::Late => Self::Late,
        }
    }
}

impl TryFrom<ReportStatus> for AttendanceStatus {
    type Error = String;

    fn try_from(status: ReportStatus) -> Result<Self, Self::Error> {
        match status {
            ReportStatus::Present => Ok(Self::Present),
            ReportStatus::Absent => Ok(Self::Absent),
            ReportStatus::Late => Ok(Self::Late),
            other => Err(format!(
                "Report status {other:?} cannot be used in a live session"
            )),
        }
    }
}

/// One student's mark within a session. Replaced wholesale on every update.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttendanceRecord {
    /// May be omitted inside a keyed record map; filled from the key on install.
    #[serde(default)]
    pub student_id: StudentId,
    pub status: AttendanceStatus,
    pub timestamp: DateTime<Utc>,
    pub marked_by: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
}

/// One class's attendance-taking activity for one calendar date.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttendanceSession {
    pub session_id: SessionId,
    pub class_id: String,
    pub workspace_id: String,
    #[serde(with = "calendar_date")]
    pub date: NaiveDate,
    pub total_students: u32,
    #[serde(default)]
    pub marked_students: u32,
    #[serde(default = "default_active")]
    pub is_active: bool,
    #[serde(default)]
    pub attendance_records: HashMap<StudentId, AttendanceRecord>,
}

fn default_active() -> bool {
    true
}

/// Ratio of marked to total students, as computed by the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionProgress {
    pub marked_students: u32,
    pub total_students: u32,
    #[serde(deserialize_with = "rounded_percentage")]
    pub percentage: u32,
}

impl SessionProgress {
    pub fn compute(marked_students: u32, total_students: u32) -> Self {
        Self {
            marked_students,
            total_students,
            percentage: percentage(marked_students, total_students),
        }
    }
}

/// A user currently observing the session. Unique by email.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConnectedViewer {
    pub email: String,
    #[serde(default)]
    pub role: String,
}

/// On-demand summary for a (class, workspace, date) tuple.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttendanceStats {
    pub total_students: u32,
    #[serde(default)]
    pub present_count: u32,
    #[serde(default)]
    pub absent_count: u32,
    #[serde(default)]
    pub late_count: u32,
    #[serde(default, deserialize_with = "rounded_percentage")]
    pub percentage: u32,
}

/// `round(part / total * 100)` with halves rounded up; 0 when `total` is 0.
pub fn percentage(part: u32, total: u32) -> u32 {
    if total == 0 {
        return 0;
    }
    let part = u64::from(part);
    let total = u64::from(total);
    ((part * 200 + total) / (total * 2)) as u32
}

/// Servers may report a fractional percentage; keep integer semantics locally.
fn rounded_percentage<'de, D>(deserializer: D) -> Result<u32, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let value = f64::deserialize(deserializer)?;
    if !value.is_finite() || value < 0.0 {
        return Ok(0);
    }
    Ok(value.round() as u32)
}

/// `YYYY-MM-DD` on the wire. Full RFC 3339 timestamps are accepted on input
/// and truncated to their date part.
pub mod calendar_date {
    use chrono::NaiveDate;
    use serde::{Deserialize, Deserializer, Serializer};

    const FORMAT: &str = "%Y-%m-%d";

    pub fn serialize<S: Serializer>(date: &NaiveDate, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&date.format(FORMAT).to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<NaiveDate, D::Error> {
        let raw = String::deserialize(deserializer)?;
        parse(&raw).map_err(serde::de::Error::custom)
    }

    pub fn parse(raw: &str) -> Result<NaiveDate, String> {
        let head = raw.trim().get(..10).unwrap_or(raw.trim());
        NaiveDate::parse_from_str(head, FORMAT).map_err(|e| format!("Invalid date '{raw}': {e}"))
    }
}
