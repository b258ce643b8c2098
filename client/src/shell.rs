//! Line commands read by `rollcall watch`.

use crate::model::AttendanceStatus;
use crate::protocol::MarkEntry;

pub const HELP: &str = "\
commands:
  mark <student> <present|absent|late> [notes...]
  bulk <student>:<status> [<student>:<status> ...]
  refresh | close | leave | viewers | progress | quit";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShellCommand {
    Mark {
        student_id: String,
        status: AttendanceStatus,
        notes: Option<String>,
    },
    Bulk(Vec<MarkEntry>),
    Refresh,
    Close,
    Leave,
    Viewers,
    Progress,
    Help,
    Quit,
}

impl ShellCommand {
    pub fn parse(line: &str) -> Result<Self, String> {
        let mut words = line.split_whitespace();
        let Some(verb) = words.next() else {
            return Err("empty command".into());
        };
        match verb.to_ascii_lowercase().as_str() {
            "mark" | "m" => {
                let student_id = words.next().ok_or("usage: mark <student> <status> [notes]")?;
                let status = words
                    .next()
                    .ok_or("usage: mark <student> <status> [notes]")?
                    .parse()?;
                let notes = words.collect::<Vec<_>>().join(" ");
                Ok(Self::Mark {
                    student_id: student_id.to_string(),
                    status,
                    notes: Some(notes).filter(|n| !n.is_empty()),
                })
            }
            "bulk" | "b" => {
                let entries = words.map(parse_entry).collect::<Result<Vec<_>, _>>()?;
                if entries.is_empty() {
                    return Err("usage: bulk <student>:<status> ...".into());
                }
                Ok(Self::Bulk(entries))
            }
            "refresh" | "r" => Ok(Self::Refresh),
            "close" => Ok(Self::Close),
            "leave" => Ok(Self::Leave),
            "viewers" | "who" => Ok(Self::Viewers),
            "progress" | "p" => Ok(Self::Progress),
            "help" | "?" => Ok(Self::Help),
            "quit" | "exit" | "q" => Ok(Self::Quit),
            other => Err(format!("unknown command: {}", other)),
        }
    }
}

fn parse_entry(word: &str) -> Result<MarkEntry, String> {
    let (student_id, status) = word
        .split_once(':')
        .ok_or_else(|| format!("expected <student>:<status>, got {}", word))?;
    if student_id.is_empty() {
        return Err(format!("missing student id in {}", word));
    }
    Ok(MarkEntry::new(student_id, status.parse()?))
}
