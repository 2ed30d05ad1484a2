//! Append-only NDJSON journal of decisions, one line per invocation.

use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::core::types::LoopMode;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JournalEvent {
    pub timestamp: DateTime<Utc>,
    pub session_id: String,
    pub iteration: u32,
    /// Mode on entry to the invocation.
    pub mode_before: LoopMode,
    pub mode: LoopMode,
    /// `block` or `allow_stop`.
    pub decision: String,
    pub reason: String,
    #[serde(default)]
    pub backoff_seconds: u64,
    #[serde(default)]
    pub validation_round: u8,
    #[serde(default)]
    pub validation_score: Option<f64>,
    #[serde(default)]
    pub completion_confidence: f64,
    #[serde(default)]
    pub idle_count: u32,
    #[serde(default)]
    pub adapter: Option<String>,
}

pub fn append_event(path: &Path, event: &JournalEvent) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("create journal dir {}", parent.display()))?;
    }
    let mut line = serde_json::to_string(event)?;
    line.push('\n');
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("open journal {}", path.display()))?;
    file.write_all(line.as_bytes())
        .with_context(|| format!("append journal {}", path.display()))
}

/// Last `limit` events, oldest first. Malformed lines are skipped.
pub fn read_recent(path: &Path, limit: usize) -> Result<Vec<JournalEvent>> {
    let contents = match fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => return Err(err).with_context(|| format!("read journal {}", path.display())),
    };
    let mut events: Vec<JournalEvent> = Vec::new();
    for (idx, line) in contents.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str(line) {
            Ok(event) => events.push(event),
            Err(err) => warn!(line = idx + 1, err = %err, "skipping malformed journal line"),
        }
    }
    let start = events.len().saturating_sub(limit);
    Ok(events.split_off(start))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(iteration: u32, decision: &str) -> JournalEvent {
        JournalEvent {
            timestamp: Utc::now(),
            session_id: "s".to_string(),
            iteration,
            mode_before: LoopMode::Implementation,
            mode: LoopMode::Implementation,
            decision: decision.to_string(),
            reason: "r".to_string(),
            backoff_seconds: 0,
            validation_round: 0,
            validation_score: None,
            completion_confidence: 0.0,
            idle_count: 0,
            adapter: Some("universal".to_string()),
        }
    }

    #[test]
    fn appends_and_reads_tail() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("nested").join("s.events.jsonl");
        for i in 0..5 {
            append_event(&path, &event(i, "block")).expect("append");
        }
        fs::OpenOptions::new()
            .append(true)
            .open(&path)
            .expect("open")
            .write_all(b"{broken\n")
            .expect("write");
        append_event(&path, &event(5, "allow_stop")).expect("append");

        let tail = read_recent(&path, 2).expect("read");
        assert_eq!(tail.len(), 2);
        assert_eq!(tail[0].iteration, 4);
        assert_eq!(tail[1].decision, "allow_stop");
    }

    #[test]
    fn missing_journal_is_empty() {
        let temp = tempfile::tempdir().expect("tempdir");
        assert!(read_recent(&temp.path().join("none.jsonl"), 10).expect("read").is_empty());
    }
}
