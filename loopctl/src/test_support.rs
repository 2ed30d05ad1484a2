//! Test helpers: scripted check runners and adapters, fixtures, request builders.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{Result, anyhow};
use chrono::{DateTime, Duration, Utc};
use tempfile::TempDir;

use crate::adapters::DomainAdapter;
use crate::core::types::{CheckResult, CheckStatus, ConvergenceResult, MetricsEntry};
use crate::hook::HookRequest;
use crate::io::checks::{CheckRequest, CheckRunner, CheckSpec};

/// Check runner that returns a fixed pass rate per check name (1.0 if unlisted).
#[derive(Debug, Default)]
pub struct ScriptedChecks {
    pass_rates: HashMap<String, f64>,
    findings: HashMap<String, Vec<String>>,
    calls: Mutex<Vec<(String, u8)>>,
}

impl ScriptedChecks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_pass_rate(mut self, name: &str, rate: f64) -> Self {
        self.pass_rates.insert(name.to_string(), rate);
        self
    }

    pub fn with_finding(mut self, name: &str, finding: &str) -> Self {
        self.findings
            .entry(name.to_string())
            .or_default()
            .push(finding.to_string());
        self
    }

    /// `(check name, round)` for every run so far.
    pub fn calls(&self) -> Vec<(String, u8)> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }
}

impl CheckRunner for ScriptedChecks {
    fn run(&self, spec: &CheckSpec, request: &CheckRequest) -> Result<CheckResult> {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push((spec.name.clone(), request.round));
        }
        Ok(CheckResult {
            name: spec.name.clone(),
            round: request.round,
            weight: spec.weight,
            status: CheckStatus::Completed {
                pass_rate: self.pass_rates.get(&spec.name).copied().unwrap_or(1.0),
            },
            findings: self.findings.get(&spec.name).cloned().unwrap_or_default(),
            duration_ms: 0,
        })
    }
}

/// Adapter with a canned convergence verdict.
#[derive(Debug, Clone)]
pub struct ScriptedAdapter {
    pub name: String,
    pub detects: bool,
    pub verdict: ConvergenceResult,
    pub metrics: Vec<MetricsEntry>,
    /// Fail `check_convergence` with an error instead of answering.
    pub fail: bool,
    /// Panic in `check_convergence` instead of answering.
    pub panic: bool,
}

impl ScriptedAdapter {
    pub fn new(name: &str, should_continue: bool, confidence: f64, reason: &str) -> Self {
        Self {
            name: name.to_string(),
            detects: true,
            verdict: ConvergenceResult {
                should_continue,
                reason: reason.to_string(),
                confidence,
            },
            metrics: Vec::new(),
            fail: false,
            panic: false,
        }
    }

    pub fn failing(name: &str) -> Self {
        Self {
            fail: true,
            ..Self::new(name, false, 1.0, "unreachable")
        }
    }

    pub fn panicking(name: &str) -> Self {
        Self {
            panic: true,
            ..Self::new(name, false, 1.0, "unreachable")
        }
    }
}

impl DomainAdapter for ScriptedAdapter {
    fn name(&self) -> &str {
        &self.name
    }

    fn session_mode(&self) -> &str {
        "scripted"
    }

    fn detect(&self, _project_dir: &Path) -> Result<bool> {
        Ok(self.detects)
    }

    fn metrics_history(&self, _project_dir: &Path) -> Result<Vec<MetricsEntry>> {
        Ok(self.metrics.clone())
    }

    fn check_convergence(&self, _history: &[MetricsEntry]) -> Result<ConvergenceResult> {
        if self.panic {
            panic!("scripted adapter panic");
        }
        if self.fail {
            return Err(anyhow!("scripted adapter failure"));
        }
        Ok(self.verdict.clone())
    }
}

/// A project directory and a separate state directory.
pub struct Sandbox {
    _temp: TempDir,
    pub project: PathBuf,
    pub state_dir: PathBuf,
}

impl Sandbox {
    pub fn new() -> Self {
        let temp = tempfile::tempdir().expect("tempdir");
        let project = temp.path().join("project");
        let state_dir = temp.path().join("state");
        fs::create_dir_all(&project).expect("create project dir");
        Self {
            project,
            state_dir,
            _temp: temp,
        }
    }

    /// Another project directory under the same root (a second worktree).
    pub fn sibling_project(&self, name: &str) -> PathBuf {
        let dir = self.project.with_file_name(name);
        fs::create_dir_all(&dir).expect("create sibling project");
        dir
    }

    pub fn write(&self, rel: &str, contents: &str) -> PathBuf {
        let path = self.project.join(rel);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).expect("create parent");
        }
        fs::write(&path, contents).expect("write fixture");
        path
    }

    /// Write `.loopctl/config.toml`.
    pub fn config(&self, toml: &str) {
        self.write(".loopctl/config.toml", toml);
    }

    pub fn kill(&self) {
        self.write(".loopctl/STOP", "");
    }

    /// Transcript (outside the project) whose last assistant message is `text`.
    pub fn transcript(&self, text: &str) -> PathBuf {
        let path = self.state_dir.with_file_name("transcript.jsonl");
        let line = serde_json::json!({
            "type": "assistant",
            "message": { "content": [{ "type": "text", "text": text }] }
        });
        fs::write(&path, format!("{line}\n")).expect("write transcript");
        path
    }

    pub fn request(&self, session: &str) -> HookRequest {
        request_for(&self.project, session, &self.state_dir, Utc::now())
    }
}

impl Default for Sandbox {
    fn default() -> Self {
        Self::new()
    }
}

pub fn request_for(
    project: &Path,
    session: &str,
    state_dir: &Path,
    now: DateTime<Utc>,
) -> HookRequest {
    HookRequest {
        project_dir: project.to_path_buf(),
        session_id: session.to_string(),
        artifact: None,
        transcript: None,
        state_dir: state_dir.to_path_buf(),
        global_config: None,
        now,
    }
}

/// Same request, `minutes` later.
pub fn later(request: &HookRequest, minutes: i64) -> HookRequest {
    HookRequest {
        now: request.now + Duration::minutes(minutes),
        ..request.clone()
    }
}

/// Markdown checklist with `done` checked and `open` unchecked items.
pub fn checklist(done: usize, open: usize) -> String {
    let mut out = String::from("# Task\n\n");
    for i in 0..done {
        out.push_str(&format!("- [x] step {i}\n"));
    }
    for i in 0..open {
        out.push_str(&format!("- [ ] pending {i}\n"));
    }
    out
}
