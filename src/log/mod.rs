//! Structured transition log — JSON lines per day.
//!
//! Every level transition, suggestion, bypass, and hijack decision is
//! appended to a `.jsonl` audit log. Each line is a self-contained JSON
//! object with a timestamp, making the log easy to grep, stream, and
//! post-process.

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{Context, Result};
use chrono::Utc;
use serde::Serialize;
use tracing::debug;

/// A structured event in the transition log.
#[derive(Debug, Clone, Serialize)]
pub struct LogEntry {
    /// RFC 3339 timestamp.
    pub timestamp: String,
    /// The event type and its data.
    #[serde(flatten)]
    pub event: LogEvent,
}

/// All event types that can appear in the transition log.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", content = "data")]
#[serde(rename_all = "snake_case")]
pub enum LogEvent {
    /// An enforcement session was opened.
    SessionStarted { user_id: String, level: u8 },
    /// The session level changed.
    LevelChanged {
        user_id: String,
        from: u8,
        to: u8,
        reason: String,
    },
    /// An adaptive suggestion was surfaced to the user.
    SuggestionRaised {
        user_id: String,
        current_level: u8,
        suggested_level: u8,
        delta: i8,
    },
    /// The user accepted a pending suggestion.
    SuggestionAccepted { user_id: String, level: u8 },
    /// The user declined a pending suggestion.
    SuggestionDeclined { user_id: String },
    /// A post-hyperfocus support check-in was scheduled.
    HyperfocusSupportScheduled { user_id: String },
    /// An emergency bypass was granted.
    BypassGranted {
        user_id: String,
        from: u8,
        to: u8,
        expires_at: String,
        reason: String,
    },
    /// A bypass expired and the level was restored.
    BypassReverted { user_id: String, restored_level: u8 },
    /// Hijack activation was requested and awaits confirmation.
    HijackRequested { user_id: String, level: u8 },
    /// Hijack mode engaged.
    HijackActivated {
        user_id: String,
        level: u8,
        allowed_apps: Vec<String>,
    },
    /// Hijack confirmation was declined; level pinned to the Insist cap.
    HijackDeclined { user_id: String },
    /// Hijack mode released.
    HijackDeactivated { user_id: String },
    /// The user tried to leave an allowed application during hijack.
    EscapeAttempt { user_id: String, count: u32 },
    /// The session completed — plan written.
    SessionCompleted { user_id: String, final_level: u8 },
    /// All sessions cleared at the daily boundary.
    DailyReset { cleared: usize },
    /// One sweep pass finished.
    SweepCompleted {
        sessions: usize,
        escalated: usize,
        reverted: usize,
    },
}

/// Writer for JSON lines transition logs.
pub struct TransitionLog {
    writer: Mutex<BufWriter<File>>,
    path: PathBuf,
}

impl TransitionLog {
    /// Create a new transition log, writing to the given path.
    ///
    /// Creates the file (and parent directories) if they don't exist.
    /// Appends to an existing file.
    pub fn new(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create log directory: {}", parent.display()))?;
        }

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("failed to open log file: {}", path.display()))?;

        Ok(Self {
            writer: Mutex::new(BufWriter::new(file)),
            path: path.to_path_buf(),
        })
    }

    /// Log an event.
    pub fn log(&self, event: LogEvent) -> Result<()> {
        let entry = LogEntry {
            timestamp: Utc::now().to_rfc3339(),
            event,
        };

        let json = serde_json::to_string(&entry).context("failed to serialize log entry")?;

        debug!(event = %json, "transition log");

        let mut writer = self.writer.lock().unwrap();
        writeln!(writer, "{json}").context("failed to write log entry")?;
        writer.flush().context("failed to flush log")?;

        Ok(())
    }

    /// Get the path to the log file.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn log_writes_one_json_object_per_line() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("transitions.jsonl");
        let log = TransitionLog::new(&path).unwrap();

        log.log(LogEvent::SessionStarted {
            user_id: "ada".to_string(),
            level: 2,
        })
        .unwrap();
        log.log(LogEvent::LevelChanged {
            user_id: "ada".to_string(),
            from: 2,
            to: 3,
            reason: "time_elapsed".to_string(),
        })
        .unwrap();

        let contents = fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 2);
        for line in lines {
            let value: serde_json::Value = serde_json::from_str(line).unwrap();
            assert!(value.get("timestamp").is_some());
            assert!(value.get("event").is_some());
        }
    }

    #[test]
    fn log_appends_to_existing_file() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("transitions.jsonl");

        {
            let log = TransitionLog::new(&path).unwrap();
            log.log(LogEvent::DailyReset { cleared: 1 }).unwrap();
        }
        {
            let log = TransitionLog::new(&path).unwrap();
            log.log(LogEvent::DailyReset { cleared: 2 }).unwrap();
        }

        let contents = fs::read_to_string(&path).unwrap();
        assert_eq!(contents.lines().count(), 2);
    }

    #[test]
    fn events_serialize_with_snake_case_tags() {
        let event = LogEvent::HijackActivated {
            user_id: "ada".to_string(),
            level: 9,
            allowed_apps: vec!["planner".to_string()],
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"event\":\"hijack_activated\""));
        assert!(json.contains("\"allowed_apps\":[\"planner\"]"));
    }
}
