//! Per-session state persistence.
//!
//! State is written atomically (per-process temp file + rename) and validated
//! against the embedded v1 schema on load. Files that fail to parse or validate
//! are preserved next to the state file and a fresh session starts.

use std::collections::VecDeque;
use std::fmt;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use anyhow::{Context, Result, anyhow};
use chrono::{DateTime, Utc};
use jsonschema::{Draft, Validator};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use crate::core::gate::LoopLimits;
use crate::core::types::{CompletionSignal, LoopMode, MetricsEntry, ValidationRound};
use crate::io::config::Guidance;
use crate::io::paths::SessionPaths;

pub const STATE_SCHEMA_VERSION: u32 = 1;

const STATE_SCHEMA: &str = include_str!("../../schemas/loop_state.v1.schema.json");

static STATE_VALIDATOR: LazyLock<Validator> = LazyLock::new(|| {
    let schema: Value = serde_json::from_str(STATE_SCHEMA).expect("state schema is valid json");
    jsonschema::options()
        .with_draft(Draft::Draft202012)
        .build(&schema)
        .expect("state schema compiles")
});

/// Persisted state for one (project, session) pair.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LoopState {
    pub schema_version: u32,
    pub session_id: String,
    pub project_path_hash: String,
    #[serde(default)]
    pub project_path: String,
    pub mode: LoopMode,
    /// Number of blocking decisions issued so far.
    pub iteration: u32,
    pub start_time: DateTime<Utc>,
    #[serde(default)]
    pub last_iteration_time: Option<DateTime<Utc>>,
    /// Last validation round run (0 = none yet in this visit).
    #[serde(default)]
    pub validation_round: u8,
    #[serde(default)]
    pub validation_score_history: Vec<f64>,
    #[serde(default)]
    pub last_validation: Option<ValidationRound>,
    #[serde(default)]
    pub validation_findings: Vec<String>,
    #[serde(default)]
    pub idle_count: u32,
    #[serde(default)]
    pub backoff_seconds: u64,
    #[serde(default)]
    pub completion_signals: Vec<CompletionSignal>,
    #[serde(default)]
    pub completion_confidence: f64,
    #[serde(default)]
    pub metrics_history: Vec<MetricsEntry>,
    /// Limits captured when the session started.
    #[serde(default)]
    pub config_limits: LoopLimits,
    #[serde(default)]
    pub recent_outputs: VecDeque<String>,
    #[serde(default)]
    pub work_fingerprint: Option<String>,
    #[serde(default)]
    pub guidance: Guidance,
    #[serde(default)]
    pub adapter: Option<String>,
    #[serde(default)]
    pub last_reason: Option<String>,
}

impl LoopState {
    /// Fresh IMPLEMENTATION state for a new session.
    pub fn new(
        paths: &SessionPaths,
        limits: LoopLimits,
        guidance: Guidance,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            schema_version: STATE_SCHEMA_VERSION,
            session_id: paths.session_id.clone(),
            project_path_hash: paths.project_hash.clone(),
            project_path: paths.project_dir.display().to_string(),
            mode: LoopMode::Implementation,
            iteration: 0,
            start_time: now,
            last_iteration_time: None,
            validation_round: 0,
            validation_score_history: Vec::new(),
            last_validation: None,
            validation_findings: Vec::new(),
            idle_count: 0,
            backoff_seconds: 0,
            completion_signals: Vec::new(),
            completion_confidence: 0.0,
            metrics_history: Vec::new(),
            config_limits: limits,
            recent_outputs: VecDeque::new(),
            work_fingerprint: None,
            guidance,
            adapter: None,
            last_reason: None,
        }
    }

    /// Switch mode. Entering or leaving VALIDATION resets the round counter.
    pub fn enter_mode(&mut self, mode: LoopMode) {
        if self.mode != mode {
            self.validation_round = 0;
        }
        self.mode = mode;
    }
}

/// Why a state file could not be loaded.
#[derive(Debug)]
pub enum LoadStateError {
    /// Present but unusable (bad JSON, schema violation, wrong shape).
    Corrupt { path: PathBuf, message: String },
    /// The file could not be read at all.
    Io(anyhow::Error),
}

impl fmt::Display for LoadStateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LoadStateError::Corrupt { path, message } => {
                write!(f, "corrupt state {}: {message}", path.display())
            }
            LoadStateError::Io(err) => write!(f, "{err:#}"),
        }
    }
}

impl std::error::Error for LoadStateError {}

/// Load state; `Ok(None)` when no state file exists.
pub fn load_state(path: &Path) -> std::result::Result<Option<LoopState>, LoadStateError> {
    debug!(path = %path.display(), "loading state");
    let contents = match fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
        Err(err) => {
            return Err(LoadStateError::Io(
                anyhow!(err).context(format!("read state {}", path.display())),
            ));
        }
    };
    let corrupt = |message: String| LoadStateError::Corrupt {
        path: path.to_path_buf(),
        message,
    };

    let value: Value = serde_json::from_str(&contents).map_err(|err| corrupt(err.to_string()))?;
    let messages: Vec<String> = STATE_VALIDATOR
        .iter_errors(&value)
        .map(|err| err.to_string())
        .collect();
    if !messages.is_empty() {
        return Err(corrupt(format!(
            "schema validation failed: {}",
            messages.join("; ")
        )));
    }
    let state: LoopState =
        serde_json::from_value(value).map_err(|err| corrupt(err.to_string()))?;
    debug!(
        mode = state.mode.as_str(),
        iteration = state.iteration,
        "state loaded"
    );
    Ok(Some(state))
}

/// Load existing state or build a fresh one with `init`.
///
/// Corrupt files are moved aside to `<key>.corrupt-<timestamp>.json`. A file written for a
/// different session or project is moved aside to `<key>.foreign-<timestamp>.json`.
pub fn load_or_init(
    paths: &SessionPaths,
    now: DateTime<Utc>,
    init: impl FnOnce() -> LoopState,
) -> Result<LoopState> {
    let path = paths.state_path.as_path();
    match load_state(path) {
        Ok(Some(state))
            if state.session_id == paths.session_id
                && state.project_path_hash == paths.project_hash =>
        {
            Ok(state)
        }
        Ok(Some(state)) => {
            let preserved = preserve_aside(path, "foreign", now)?;
            warn!(
                path = %path.display(),
                preserved = ?preserved,
                stored_session = %state.session_id,
                "state file belongs to another session, starting fresh"
            );
            Ok(init())
        }
        Ok(None) => {
            debug!(path = %path.display(), "no state yet, starting session");
            Ok(init())
        }
        Err(LoadStateError::Corrupt { path, message }) => {
            let preserved = preserve_aside(&path, "corrupt", now)?;
            warn!(
                path = %path.display(),
                preserved = ?preserved,
                err = %message,
                "state file corrupt, starting fresh"
            );
            Ok(init())
        }
        Err(LoadStateError::Io(err)) => Err(err),
    }
}

/// Atomically write state (temp file + rename).
pub fn write_state(path: &Path, state: &LoopState) -> Result<()> {
    debug!(
        path = %path.display(),
        mode = state.mode.as_str(),
        iteration = state.iteration,
        "writing state"
    );
    let mut buf = serde_json::to_string_pretty(state)?;
    buf.push('\n');
    write_atomic(path, &buf)
}

/// Move the state file to `<key>.archived-<timestamp>.json`, if it exists.
pub fn archive_state(path: &Path, now: DateTime<Utc>) -> Result<Option<PathBuf>> {
    preserve_aside(path, "archived", now)
}

/// State files stored for a project (any session), sorted by name.
pub fn list_project_states(state_dir: &Path, project_hash: &str) -> Result<Vec<PathBuf>> {
    let entries = match fs::read_dir(state_dir) {
        Ok(entries) => entries,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => {
            return Err(err).with_context(|| format!("read state dir {}", state_dir.display()));
        }
    };
    let prefix = format!("{project_hash}-");
    let mut out = Vec::new();
    for entry in entries {
        let path = entry
            .with_context(|| format!("read entry in {}", state_dir.display()))?
            .path();
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        if name.starts_with(&prefix) && is_live_state_name(name) {
            out.push(path);
        }
    }
    out.sort();
    Ok(out)
}

fn is_live_state_name(name: &str) -> bool {
    name.ends_with(".json")
        && !name.contains(".corrupt-")
        && !name.contains(".archived-")
        && !name.contains(".foreign-")
}

fn preserve_aside(path: &Path, label: &str, now: DateTime<Utc>) -> Result<Option<PathBuf>> {
    if !path.exists() {
        return Ok(None);
    }
    let target = aside_path(path, label, now)?;
    fs::rename(path, &target).with_context(|| {
        format!(
            "move state {} to {}",
            path.display(),
            target.display()
        )
    })?;
    Ok(Some(target))
}

fn aside_path(path: &Path, label: &str, now: DateTime<Utc>) -> Result<PathBuf> {
    let stem = path
        .file_stem()
        .and_then(|s| s.to_str())
        .with_context(|| format!("state path has no file name {}", path.display()))?;
    let stamp = now.format("%Y%m%dT%H%M%S%.3fZ");
    Ok(path.with_file_name(format!("{stem}.{label}-{stamp}.json")))
}

fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("state path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    // One temp file per process so concurrent sessions never share it.
    let tmp_path = path.with_extension(format!("json.{}.tmp", std::process::id()));
    fs::write(&tmp_path, contents)
        .with_context(|| format!("write temp state {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace state {}", path.display()))?;
    Ok(())
}
