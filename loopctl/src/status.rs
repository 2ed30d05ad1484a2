//! `loopctl status`: one-screen summary of a session's persisted state.

use std::fmt::Write as _;
use std::path::Path;

use anyhow::{Result, anyhow};
use chrono::{DateTime, Utc};

use crate::core::gate::elapsed_hours;
use crate::io::journal::{JournalEvent, read_recent};
use crate::io::paths::SessionPaths;
use crate::io::state_store::{LoopState, list_project_states, load_state};

/// Journal events shown under the summary.
pub const RECENT_EVENTS: usize = 5;

/// Persisted state plus the tail of the decision journal.
#[derive(Debug, Clone)]
pub struct SessionStatus {
    pub state: LoopState,
    pub elapsed_hours: f64,
    pub recent_events: Vec<JournalEvent>,
}

/// Load the status of one session. Missing or corrupt state is an error.
pub fn session_status(paths: &SessionPaths, now: DateTime<Utc>) -> Result<SessionStatus> {
    let state = load_state(&paths.state_path)?.ok_or_else(|| {
        anyhow!(
            "no state for session {} in {}",
            paths.session_id,
            paths.state_dir.display()
        )
    })?;
    let recent_events = read_recent(&paths.journal_path, RECENT_EVENTS)?;
    Ok(SessionStatus {
        elapsed_hours: elapsed_hours(state.start_time, now),
        state,
        recent_events,
    })
}

/// Session keys (`<hash>-<session>`) with state stored for `project_hash`.
pub fn project_sessions(state_dir: &Path, project_hash: &str) -> Result<Vec<String>> {
    Ok(list_project_states(state_dir, project_hash)?
        .iter()
        .filter_map(|path| path.file_stem().and_then(|s| s.to_str()).map(str::to_string))
        .collect())
}

pub fn render_status(status: &SessionStatus) -> String {
    let s = &status.state;
    let mut out = String::new();
    let _ = writeln!(out, "session:     {}", s.session_id);
    let _ = writeln!(out, "project:     {}", s.project_path);
    let _ = writeln!(out, "mode:        {}", s.mode.as_str());
    let _ = writeln!(
        out,
        "iteration:   {} (max {})",
        s.iteration, s.config_limits.max_iterations
    );
    let _ = writeln!(
        out,
        "elapsed:     {:.2}h (max {:.2}h)",
        status.elapsed_hours, s.config_limits.max_hours
    );
    let history: Vec<String> = s
        .validation_score_history
        .iter()
        .map(|score| format!("{score:.2}"))
        .collect();
    let _ = writeln!(
        out,
        "validation:  round {} scores [{}]",
        s.validation_round,
        history.join(", ")
    );
    let _ = writeln!(out, "completion:  {:.2}", s.completion_confidence);
    let _ = writeln!(out, "idle:        {} (backoff {}s)", s.idle_count, s.backoff_seconds);
    let _ = writeln!(out, "adapter:     {}", s.adapter.as_deref().unwrap_or("-"));
    let _ = writeln!(out, "last reason: {}", s.last_reason.as_deref().unwrap_or("-"));
    if !status.recent_events.is_empty() {
        let _ = writeln!(out, "recent decisions:");
        for event in &status.recent_events {
            let _ = writeln!(
                out,
                "  {} #{} {} -> {} {}: {}",
                event.timestamp.format("%Y-%m-%d %H:%M:%S"),
                event.iteration,
                event.mode_before.as_str(),
                event.mode.as_str(),
                event.decision,
                event.reason
            );
        }
    }
    out
}
