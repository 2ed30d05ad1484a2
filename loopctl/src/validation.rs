//! Validation engine: runs one round of configured checks.
//!
//! Rounds 1 and 3 fan their checks out over a bounded worker pool. Round 2 runs
//! sequentially: its own checks plus re-runs of round-1 checks that did not
//! fully pass, each fed round 1's findings. A check that errors, panics, or
//! times out never aborts the round; it is recorded and excluded from the score.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::path::Path;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::Duration;

use tracing::{debug, info, instrument, warn};

use crate::core::types::{CheckResult, CheckStatus, ValidationRound};
use crate::core::validation::{
    RoundSchedule, checks_needing_reverification, collect_findings, finish_round, schedule_for,
};
use crate::io::checks::{CheckRequest, CheckRunner, CheckSpec};
use crate::io::config::ControllerConfig;

/// Engine knobs resolved from config.
#[derive(Debug, Clone)]
pub struct ValidationSettings {
    pub pass_threshold: f64,
    pub timeout: Duration,
    pub max_workers: usize,
    pub output_limit_bytes: usize,
}

impl ValidationSettings {
    pub fn from_config(cfg: &ControllerConfig) -> Self {
        Self {
            pass_threshold: cfg.validation.pass_threshold,
            timeout: Duration::from_secs(cfg.effective_limits().check_timeout_secs),
            max_workers: cfg.validation.max_workers.max(1),
            output_limit_bytes: cfg.validation.output_limit_bytes,
        }
    }
}

/// Where and for whom a round runs.
#[derive(Debug, Clone, Copy)]
pub struct RoundContext<'a> {
    pub project_dir: &'a Path,
    pub session_id: &'a str,
    /// The round completed before this one, if any.
    pub previous: Option<&'a ValidationRound>,
}

/// Checks to run in `round`, in configuration order.
pub fn plan_round<'a>(
    specs: &'a [CheckSpec],
    round: u8,
    previous: Option<&ValidationRound>,
) -> Vec<&'a CheckSpec> {
    let mut planned: Vec<&CheckSpec> = specs.iter().filter(|s| s.round == round).collect();
    if round == 2
        && let Some(prev) = previous.filter(|p| p.round_number == 1)
    {
        let retry = checks_needing_reverification(prev);
        for spec in specs.iter().filter(|s| s.round == 1) {
            if retry.contains(&spec.name) && !planned.iter().any(|p| p.name == spec.name) {
                planned.push(spec);
            }
        }
    }
    planned
}

/// Run `round` and return its aggregate.
#[instrument(skip_all, fields(round = round))]
pub fn run_round<C: CheckRunner + Sync>(
    runner: &C,
    specs: &[CheckSpec],
    round: u8,
    ctx: &RoundContext<'_>,
    settings: &ValidationSettings,
) -> ValidationRound {
    let planned = plan_round(specs, round, ctx.previous);
    let findings = match (round, ctx.previous) {
        (2, Some(prev)) => collect_findings(prev),
        _ => Vec::new(),
    };
    let request = CheckRequest {
        project_dir: ctx.project_dir.to_path_buf(),
        session_id: ctx.session_id.to_string(),
        round,
        timeout: settings.timeout,
        output_limit_bytes: settings.output_limit_bytes,
        findings,
    };
    debug!(checks = planned.len(), "running validation round");

    let results = match schedule_for(round) {
        RoundSchedule::Sequential => planned
            .iter()
            .map(|spec| run_guarded(runner, spec, &request))
            .collect(),
        RoundSchedule::Parallel => run_parallel(runner, &planned, &request, settings.max_workers),
    };

    let outcome = finish_round(round, results, settings.pass_threshold);
    info!(
        round,
        score = outcome.aggregate_score,
        exhausted = outcome.exhausted,
        "validation round finished"
    );
    outcome
}

fn run_parallel<C: CheckRunner + Sync>(
    runner: &C,
    specs: &[&CheckSpec],
    request: &CheckRequest,
    max_workers: usize,
) -> Vec<CheckResult> {
    let next = AtomicUsize::new(0);
    let slots: Vec<Mutex<Option<CheckResult>>> = specs.iter().map(|_| Mutex::new(None)).collect();
    let workers = max_workers.clamp(1, specs.len().max(1));

    let (next_ref, slots_ref) = (&next, &slots);
    thread::scope(|scope| {
        let mut handles = Vec::with_capacity(workers);
        for _ in 0..workers {
            handles.push(scope.spawn(move || {
                loop {
                    let idx = next_ref.fetch_add(1, Ordering::SeqCst);
                    let Some(spec) = specs.get(idx) else {
                        break;
                    };
                    let result = run_guarded(runner, spec, request);
                    if let Ok(mut slot) = slots_ref[idx].lock() {
                        *slot = Some(result);
                    }
                }
            }));
        }
        for handle in handles {
            if handle.join().is_err() {
                warn!("validation worker panicked");
            }
        }
    });

    slots
        .into_iter()
        .zip(specs)
        .map(|(slot, spec)| {
            slot.into_inner()
                .ok()
                .flatten()
                .unwrap_or_else(|| {
                    errored(spec, request.round, "check worker panicked".to_string())
                })
        })
        .collect()
}

fn run_guarded<C: CheckRunner>(
    runner: &C,
    spec: &CheckSpec,
    request: &CheckRequest,
) -> CheckResult {
    match catch_unwind(AssertUnwindSafe(|| runner.run(spec, request))) {
        Ok(Ok(result)) => result,
        Ok(Err(err)) => {
            warn!(check = %spec.name, err = %format!("{err:#}"), "check failed to run");
            errored(spec, request.round, format!("{err:#}"))
        }
        Err(_) => {
            warn!(check = %spec.name, "check panicked");
            errored(spec, request.round, "check panicked".to_string())
        }
    }
}

fn errored(spec: &CheckSpec, round: u8, message: String) -> CheckResult {
    CheckResult {
        name: spec.name.clone(),
        round,
        weight: spec.weight,
        status: CheckStatus::Errored { message },
        findings: Vec::new(),
        duration_ms: 0,
    }
}
