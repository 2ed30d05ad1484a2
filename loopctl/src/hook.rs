//! Orchestration for a single `loopctl hook` invocation.
//!
//! Every invocation is a fresh process: load state, gather signals, decide,
//! persist, and emit. Only this module changes `LoopState::mode`.

use std::collections::{HashSet, VecDeque};
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::Result;
use chrono::{DateTime, Utc};
use tracing::{debug, info, instrument, warn};

use crate::adapters::{AdapterRegistry, DomainAdapter, guarded_convergence, guarded_metrics};
use crate::core::arbiter::{GenericDecision, OverrideStrength, arbitrate};
use crate::core::completion::{is_complete, scan_artifact};
use crate::core::gate::{GateInput, GateVerdict, evaluate_gate};
use crate::core::idle::observe_iteration;
use crate::core::similarity::{DiffRatio, is_stagnant, push_summary};
use crate::core::transition::{Transition, TransitionSignals, decide_transition};
use crate::core::types::{CompletionReport, ConvergenceResult, Decision, LoopMode, MetricsEntry};
use crate::core::validation::{collect_findings, next_round};
use crate::io::checks::CheckRunner;
use crate::io::config::{ControllerConfig, LoopDetectionConfig, load_layered_config};
use crate::io::discovery::{DiscoveryInput, Opportunity, discover_opportunities};
use crate::io::journal::{JournalEvent, append_event};
use crate::io::kill_switch::active_kill_switch;
use crate::io::paths::SessionPaths;
use crate::io::prompt::{
    CheckLine, DEFAULT_PROMPT_BUDGET_BYTES, MetricsRow, PromptContext, render_prompt,
};
use crate::io::state_store::{LoopState, archive_state, load_or_init, load_state, write_state};
use crate::io::transcript::last_assistant_text;
use crate::io::work_probe::{fingerprint, work_observed};
use crate::validation::{RoundContext, ValidationSettings, run_round};

/// Artifacts looked up (relative to the project) when none is configured.
pub const ARTIFACT_CANDIDATES: [&str; 3] = ["TASK.md", "PLAN.md", ".loopctl/task.md"];

/// Inputs supplied by the host for one invocation.
#[derive(Debug, Clone)]
pub struct HookRequest {
    pub project_dir: PathBuf,
    pub session_id: String,
    /// Explicit task artifact; relative paths resolve against the project.
    pub artifact: Option<PathBuf>,
    /// Host transcript (JSONL) used for repetition detection.
    pub transcript: Option<PathBuf>,
    pub state_dir: PathBuf,
    pub global_config: Option<PathBuf>,
    pub now: DateTime<Utc>,
}

/// Result of one invocation.
#[derive(Debug, Clone)]
pub struct HookOutcome {
    pub decision: Decision,
    /// Mode after the invocation.
    pub mode: LoopMode,
    /// Iteration count after the invocation.
    pub iteration: u32,
    pub state_path: PathBuf,
}

/// Run one invocation with the built-in adapters.
pub fn run_hook<C: CheckRunner + Sync>(request: &HookRequest, checks: &C) -> Result<HookOutcome> {
    run_hook_with_adapters(request, checks, AdapterRegistry::from_config)
}

/// Run one invocation with a caller-built adapter registry.
#[instrument(skip_all, fields(session = %request.session_id))]
pub fn run_hook_with_adapters<C, F>(
    request: &HookRequest,
    checks: &C,
    build_registry: F,
) -> Result<HookOutcome>
where
    C: CheckRunner + Sync,
    F: FnOnce(&ControllerConfig) -> AdapterRegistry,
{
    let now = request.now;
    let paths = SessionPaths::new(&request.project_dir, &request.session_id, &request.state_dir)?;

    if let Some(marker) = active_kill_switch(&paths) {
        return Ok(stop_for_kill_switch(&paths, &marker, now));
    }

    let cfg = load_layered_config(request.global_config.as_deref(), &paths.project_config_path);
    let mut state = load_or_init(&paths, now, || {
        LoopState::new(&paths, cfg.effective_limits(), cfg.guidance.clone(), now)
    })?;
    let mode_before = state.mode;
    state.config_limits = cfg.effective_limits();
    state.guidance = cfg.guidance.clone();

    if state.mode == LoopMode::Terminated {
        let decision = Decision::AllowStop {
            reason: "loop already terminated".to_string(),
        };
        return Ok(finish(&paths, state, mode_before, decision, now, false));
    }

    let verdict = evaluate_gate(&GateInput {
        kill_switch: false,
        start_time: state.start_time,
        now,
        iteration: state.iteration,
        limits: &state.config_limits,
    });
    let floor_active = match verdict {
        GateVerdict::Killed => {
            // Unreachable with kill_switch=false; handled like a limit.
            return Ok(terminate(&paths, state, mode_before, "kill switch".to_string(), now));
        }
        GateVerdict::LimitReached { reason } => {
            info!(reason = %reason, "limit reached");
            return Ok(terminate(&paths, state, mode_before, reason, now));
        }
        GateVerdict::FloorActive { reason } => {
            debug!(reason = %reason, "minimum work floor active");
            true
        }
        GateVerdict::Proceed => false,
    };

    let artifact = resolve_artifact(request, &cfg, &paths.project_dir);
    let report = scan_artifact_file(artifact.as_deref(), &paths.project_dir, &cfg);
    let complete = is_complete(&report, &cfg.completion);
    state.completion_signals = report.signals.clone();
    state.completion_confidence = report.confidence;

    let registry = build_registry(&cfg);
    let mut adapter = registry.select(&paths.project_dir);
    let history = match guarded_metrics(adapter, &paths.project_dir) {
        Some(history) => history,
        None => {
            adapter = fall_back(&registry, adapter);
            guarded_metrics(adapter, &paths.project_dir).unwrap_or_default()
        }
    };
    let ingested = ingest_metrics(&mut state.metrics_history, history);

    let work =
        observe_work(&mut state, &paths.project_dir, artifact.as_deref(), &cfg) || ingested > 0;
    let idle = observe_iteration(state.idle_count, work, state.mode, cfg.idle.force_after);
    state.idle_count = idle.idle_count;
    state.backoff_seconds = idle.backoff_seconds;

    let stagnant = observe_output(
        &mut state.recent_outputs,
        request.transcript.as_deref(),
        &cfg.loop_detection,
    );

    let transition = decide_transition(&TransitionSignals {
        mode: state.mode,
        complete,
        open_items: report.open_items,
        work_observed: work,
        force_exploration: idle.force_exploration,
        stagnant,
        floor_active,
    });
    let mut stop_repetition = false;
    let mut reason = match transition {
        Transition::Stay => None,
        Transition::Enter { mode, reason } => {
            info!(
                from = state.mode.as_str(),
                to = mode.as_str(),
                reason = %reason,
                "mode transition"
            );
            state.enter_mode(mode);
            Some(reason)
        }
        Transition::StopRepetition => {
            stop_repetition = true;
            Some("repetition detected".to_string())
        }
    };

    if state.mode == LoopMode::Validation {
        let round_reason = advance_validation(&mut state, checks, &paths, &cfg);
        reason = Some(match reason {
            Some(entered) => format!("{entered}; {round_reason}"),
            None => round_reason,
        });
    }

    let generic = GenericDecision {
        should_continue: !stop_repetition,
        leans_stop: stop_repetition
            || (complete && state.mode == LoopMode::Exploration && !floor_active),
        reason: reason.unwrap_or_else(|| default_reason(&state, &report, floor_active)),
    };
    let convergence = match guarded_convergence(adapter, &state.metrics_history) {
        Some(convergence) => convergence,
        None => {
            adapter = fall_back(&registry, adapter);
            guarded_convergence(adapter, &state.metrics_history)
                .unwrap_or_else(|| ConvergenceResult::no_opinion("fallback adapter failed"))
        }
    };
    let arbitration = arbitrate(&generic, &convergence);
    if arbitration.strength != OverrideStrength::NoOpinion {
        debug!(
            adapter = adapter.name(),
            strength = ?arbitration.strength,
            should_continue = arbitration.should_continue,
            "adapter opinion applied"
        );
    }
    state.adapter = Some(adapter.name().to_string());

    if !arbitration.should_continue {
        info!(reason = %arbitration.reason, "allowing stop");
        state.enter_mode(LoopMode::Terminated);
        let decision = Decision::AllowStop {
            reason: arbitration.reason,
        };
        return Ok(finish(&paths, state, mode_before, decision, now, true));
    }

    let prompt = build_prompt(
        &state,
        adapter,
        &arbitration.reason,
        &report,
        artifact.as_deref(),
        &paths,
        &cfg,
    );
    state.iteration = state.iteration.saturating_add(1);
    state.last_iteration_time = Some(now);
    let decision = Decision::Block {
        prompt,
        backoff_seconds: state.backoff_seconds,
    };
    state.last_reason = Some(arbitration.reason);
    Ok(finish(&paths, state, mode_before, decision, now, true))
}

/// Replace a failed adapter with the universal one for the rest of the invocation.
fn fall_back<'a>(
    registry: &'a AdapterRegistry,
    failed: &dyn DomainAdapter,
) -> &'a dyn DomainAdapter {
    let fallback = registry.fallback();
    warn!(
        adapter = failed.name(),
        fallback = fallback.name(),
        "adapter failed, falling back"
    );
    fallback
}

fn stop_for_kill_switch(paths: &SessionPaths, marker: &Path, now: DateTime<Utc>) -> HookOutcome {
    let previous = load_state(&paths.state_path).ok().flatten();
    match archive_state(&paths.state_path, now) {
        Ok(Some(archived)) => info!(archived = %archived.display(), "state archived"),
        Ok(None) => {}
        Err(err) => warn!(err = %format!("{err:#}"), "failed to archive state"),
    }
    let reason = format!("kill switch present ({})", marker.display());
    let (mode_before, iteration) = previous
        .as_ref()
        .map_or((LoopMode::Terminated, 0), |s| (s.mode, s.iteration));
    record(
        paths,
        &JournalEvent {
            timestamp: now,
            session_id: paths.session_id.clone(),
            iteration,
            mode_before,
            mode: LoopMode::Terminated,
            decision: "allow_stop".to_string(),
            reason: reason.clone(),
            backoff_seconds: 0,
            validation_round: 0,
            validation_score: None,
            completion_confidence: previous.as_ref().map_or(0.0, |s| s.completion_confidence),
            idle_count: previous.as_ref().map_or(0, |s| s.idle_count),
            adapter: previous.and_then(|s| s.adapter),
        },
    );
    HookOutcome {
        decision: Decision::AllowStop { reason },
        mode: LoopMode::Terminated,
        iteration,
        state_path: paths.state_path.clone(),
    }
}

fn terminate(
    paths: &SessionPaths,
    mut state: LoopState,
    mode_before: LoopMode,
    reason: String,
    now: DateTime<Utc>,
) -> HookOutcome {
    state.enter_mode(LoopMode::Terminated);
    let decision = Decision::AllowStop { reason };
    finish(paths, state, mode_before, decision, now, true)
}

/// Persist (optionally), journal, and package the outcome.
fn finish(
    paths: &SessionPaths,
    mut state: LoopState,
    mode_before: LoopMode,
    decision: Decision,
    now: DateTime<Utc>,
    persist: bool,
) -> HookOutcome {
    let (label, reason) = match &decision {
        Decision::AllowStop { reason } => ("allow_stop", reason.clone()),
        Decision::Block { .. } => (
            "block",
            state.last_reason.clone().unwrap_or_default(),
        ),
    };
    if !decision.is_block() {
        state.last_reason = Some(reason.clone());
    }
    if persist && let Err(err) = write_state(&paths.state_path, &state) {
        // The decision still stands; the next invocation starts from the last good state.
        warn!(err = %format!("{err:#}"), "failed to persist state");
    }
    record(
        paths,
        &JournalEvent {
            timestamp: now,
            session_id: state.session_id.clone(),
            iteration: state.iteration,
            mode_before,
            mode: state.mode,
            decision: label.to_string(),
            reason,
            backoff_seconds: if decision.is_block() { state.backoff_seconds } else { 0 },
            validation_round: state.validation_round,
            validation_score: state.last_validation.as_ref().map(|r| r.aggregate_score),
            completion_confidence: state.completion_confidence,
            idle_count: state.idle_count,
            adapter: state.adapter.clone(),
        },
    );
    HookOutcome {
        decision,
        mode: state.mode,
        iteration: state.iteration,
        state_path: paths.state_path.clone(),
    }
}

fn record(paths: &SessionPaths, event: &JournalEvent) {
    if let Err(err) = append_event(&paths.journal_path, event) {
        warn!(err = %format!("{err:#}"), "failed to append journal");
    }
}

/// Explicit artifact, then the configured one, then the first well-known file present.
pub fn resolve_artifact(
    request: &HookRequest,
    cfg: &ControllerConfig,
    project_dir: &Path,
) -> Option<PathBuf> {
    let anchor = |path: &Path| {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            project_dir.join(path)
        }
    };
    if let Some(path) = request.artifact.as_deref().or(cfg.artifact.as_deref()) {
        return Some(anchor(path));
    }
    ARTIFACT_CANDIDATES
        .iter()
        .map(|name| project_dir.join(name))
        .find(|path| path.is_file())
}

fn scan_artifact_file(
    artifact: Option<&Path>,
    project_dir: &Path,
    cfg: &ControllerConfig,
) -> CompletionReport {
    let Some(path) = artifact else {
        debug!("no task artifact found");
        return CompletionReport::default();
    };
    let label = path
        .strip_prefix(project_dir)
        .unwrap_or(path)
        .display()
        .to_string();
    match fs::read_to_string(path) {
        Ok(text) => scan_artifact(&label, &text, &cfg.completion),
        Err(err) => {
            debug!(path = %path.display(), err = %err, "task artifact unreadable");
            CompletionReport::default()
        }
    }
}

/// Append entries with unseen identifiers. Returns how many were added.
pub fn ingest_metrics(history: &mut Vec<MetricsEntry>, fresh: Vec<MetricsEntry>) -> usize {
    let mut known: HashSet<String> = history.iter().map(|e| e.identifier.clone()).collect();
    let before = history.len();
    for entry in fresh {
        if known.insert(entry.identifier.clone()) {
            history.push(entry);
        }
    }
    let added = history.len() - before;
    if added > 0 {
        debug!(added, "metrics ingested");
    }
    added
}

fn observe_work(
    state: &mut LoopState,
    project_dir: &Path,
    artifact: Option<&Path>,
    cfg: &ControllerConfig,
) -> bool {
    match fingerprint(project_dir, artifact, cfg.discovery.max_files) {
        Ok(current) => {
            let observed = work_observed(state.work_fingerprint.as_deref(), &current);
            state.work_fingerprint = Some(current);
            observed
        }
        Err(err) => {
            // Unknown counts as productive so a probe failure never forces exploration.
            warn!(err = %format!("{err:#}"), "work fingerprint failed");
            true
        }
    }
}

/// Record the latest output summary and report stagnation. The buffer resets once it fires.
fn observe_output(
    buffer: &mut VecDeque<String>,
    transcript: Option<&Path>,
    cfg: &LoopDetectionConfig,
) -> bool {
    let Some(path) = transcript else {
        return false;
    };
    match last_assistant_text(path) {
        Ok(Some(text)) => push_summary(buffer, &text, cfg.window),
        Ok(None) => return false,
        Err(err) => {
            warn!(err = %format!("{err:#}"), "transcript unavailable");
            return false;
        }
    }
    let stagnant = is_stagnant(&DiffRatio, buffer, cfg.window, cfg.threshold);
    if stagnant {
        info!(window = cfg.window, "repetition detected");
        buffer.clear();
    }
    stagnant
}

/// Run the next validation round and move to EXPLORATION once exhausted.
fn advance_validation<C: CheckRunner + Sync>(
    state: &mut LoopState,
    checks: &C,
    paths: &SessionPaths,
    cfg: &ControllerConfig,
) -> String {
    let round_number = next_round(state.validation_round);
    let round = run_round(
        checks,
        &cfg.validation.checks,
        round_number,
        &RoundContext {
            project_dir: &paths.project_dir,
            session_id: &paths.session_id,
            previous: state.last_validation.as_ref(),
        },
        &ValidationSettings::from_config(cfg),
    );
    state.validation_round = round_number;
    state.validation_score_history.push(round.aggregate_score);
    state.validation_findings = collect_findings(&round);
    let exhausted = round.exhausted;
    let score = round.aggregate_score;
    state.last_validation = Some(round);

    if exhausted {
        info!(round = round_number, score, "validation exhausted");
        state.enter_mode(LoopMode::Exploration);
        format!("validation exhausted after round {round_number} (score {score:.2})")
    } else {
        format!("validation round {round_number} scored {score:.2}")
    }
}

fn default_reason(state: &LoopState, report: &CompletionReport, floor_active: bool) -> String {
    let base = match state.mode {
        LoopMode::Implementation => format!(
            "task not complete (confidence {:.2}, {} open items)",
            report.confidence, report.open_items
        ),
        LoopMode::Validation => "validation in progress".to_string(),
        LoopMode::Exploration => "exploring further improvements".to_string(),
        LoopMode::Terminated => "loop terminated".to_string(),
    };
    if floor_active {
        format!("{base}; minimum work floor active")
    } else {
        base
    }
}

fn build_prompt(
    state: &LoopState,
    adapter: &dyn DomainAdapter,
    reason: &str,
    report: &CompletionReport,
    artifact: Option<&Path>,
    paths: &SessionPaths,
    cfg: &ControllerConfig,
) -> String {
    let opportunities = if state.mode == LoopMode::Exploration {
        discover_opportunities(&DiscoveryInput {
            project_dir: &paths.project_dir,
            open_items: &report.open_item_texts,
            findings: &state.validation_findings,
            max_items: cfg.discovery.max_items,
            max_files: cfg.discovery.max_files,
        })
        .iter()
        .map(Opportunity::describe)
        .collect()
    } else {
        Vec::new()
    };
    let last_round = state.last_validation.as_ref();
    let ctx = PromptContext {
        mode: state.mode,
        iteration: state.iteration.saturating_add(1),
        validation_round: state.validation_round,
        adapter: adapter.name().to_string(),
        session_mode: adapter.session_mode().to_string(),
        reason: reason.to_string(),
        artifact: artifact.map(|p| {
            p.strip_prefix(&paths.project_dir)
                .unwrap_or(p)
                .display()
                .to_string()
        }),
        backoff_seconds: state.backoff_seconds,
        open_items: report.open_item_texts.clone(),
        findings: state.validation_findings.clone(),
        validation_score: last_round.map(|r| format!("{:.2}", r.aggregate_score)),
        checks: last_round
            .map(|r| r.checks.iter().map(CheckLine::from_result).collect())
            .unwrap_or_default(),
        opportunities,
        metrics: MetricsRow::recent(&state.metrics_history),
        forbidden: state.guidance.forbidden.clone(),
        encouraged: state.guidance.encouraged.clone(),
    };
    let templates = paths.templates_dir.is_dir().then_some(paths.templates_dir.as_path());
    render_prompt(templates, &ctx, DEFAULT_PROMPT_BUDGET_BYTES)
}
