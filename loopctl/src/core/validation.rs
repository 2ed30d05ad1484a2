//! Validation round state machine and score aggregation.
//!
//! ROUND_0 → ROUND_1 → ROUND_2 → ROUND_3 → EXHAUSTED. Rounds 1 and 3 run their
//! checks concurrently; round 2 runs sequentially on round 1's findings.

use crate::core::types::{CheckResult, ValidationRound};

pub const FINAL_ROUND: u8 = 3;
pub const DEFAULT_PASS_THRESHOLD: f64 = 0.8;

/// How a round schedules its checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoundSchedule {
    Parallel,
    Sequential,
}

pub fn schedule_for(round: u8) -> RoundSchedule {
    if round == 2 {
        RoundSchedule::Sequential
    } else {
        RoundSchedule::Parallel
    }
}

/// Round to run next given the round already completed (0 when entering).
pub fn next_round(current: u8) -> u8 {
    current.saturating_add(1).min(FINAL_ROUND)
}

/// Weighted mean of pass rates across completed checks only.
///
/// Returns 0.0 when no check completed.
pub fn aggregate_score(checks: &[CheckResult]) -> f64 {
    let mut weighted = 0.0;
    let mut total_weight = 0.0;
    for check in checks {
        let Some(rate) = check.pass_rate() else {
            continue;
        };
        let weight = check.weight.max(0.0);
        weighted += rate.clamp(0.0, 1.0) * weight;
        total_weight += weight;
    }
    if total_weight <= 0.0 {
        return 0.0;
    }
    (weighted / total_weight).clamp(0.0, 1.0)
}

/// Exhausted when the score meets the threshold or the final round ran.
pub fn is_exhausted(round: u8, score: f64, pass_threshold: f64) -> bool {
    score >= pass_threshold || round >= FINAL_ROUND
}

/// Close a round: aggregate scores and decide exhaustion.
pub fn finish_round(round: u8, checks: Vec<CheckResult>, pass_threshold: f64) -> ValidationRound {
    let aggregate_score = aggregate_score(&checks);
    ValidationRound {
        round_number: round,
        exhausted: is_exhausted(round, aggregate_score, pass_threshold),
        aggregate_score,
        checks,
    }
}

/// Findings carried forward from a round, in check order.
pub fn collect_findings(round: &ValidationRound) -> Vec<String> {
    let mut findings = Vec::new();
    for check in &round.checks {
        for finding in &check.findings {
            findings.push(format!("[{}] {}", check.name, finding));
        }
    }
    findings
}

/// Names of checks in `round` that did not fully pass.
pub fn checks_needing_reverification(round: &ValidationRound) -> Vec<String> {
    round
        .checks
        .iter()
        .filter(|c| c.pass_rate().is_none_or(|rate| rate < 1.0))
        .map(|c| c.name.clone())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::CheckStatus;

    fn check(name: &str, weight: f64, status: CheckStatus) -> CheckResult {
        CheckResult {
            name: name.to_string(),
            round: 1,
            weight,
            status,
            findings: Vec::new(),
            duration_ms: 1,
        }
    }

    #[test]
    fn schedules_alternate_parallel_sequential_parallel() {
        assert_eq!(schedule_for(1), RoundSchedule::Parallel);
        assert_eq!(schedule_for(2), RoundSchedule::Sequential);
        assert_eq!(schedule_for(3), RoundSchedule::Parallel);
    }

    #[test]
    fn rounds_advance_and_saturate() {
        assert_eq!(next_round(0), 1);
        assert_eq!(next_round(2), 3);
        assert_eq!(next_round(3), 3);
    }

    #[test]
    fn timed_out_checks_do_not_contribute() {
        let checks = vec![
            check("lint", 1.0, CheckStatus::Completed { pass_rate: 1.0 }),
            check("links", 1.0, CheckStatus::TimedOut),
            check("secrets", 1.0, CheckStatus::Completed { pass_rate: 0.5 }),
            check(
                "broken",
                3.0,
                CheckStatus::Errored {
                    message: "spawn failed".to_string(),
                },
            ),
        ];
        assert_eq!(aggregate_score(&checks), 0.75);
    }

    #[test]
    fn weights_shift_the_mean() {
        let checks = vec![
            check("a", 3.0, CheckStatus::Completed { pass_rate: 1.0 }),
            check("b", 1.0, CheckStatus::Completed { pass_rate: 0.0 }),
        ];
        assert_eq!(aggregate_score(&checks), 0.75);
    }

    #[test]
    fn no_completed_checks_scores_zero() {
        assert_eq!(aggregate_score(&[]), 0.0);
        assert_eq!(aggregate_score(&[check("t", 1.0, CheckStatus::TimedOut)]), 0.0);
    }

    #[test]
    fn exhaustion_on_score_or_final_round() {
        assert!(is_exhausted(1, 0.8, DEFAULT_PASS_THRESHOLD));
        assert!(!is_exhausted(2, 0.79, DEFAULT_PASS_THRESHOLD));
        assert!(is_exhausted(3, 0.1, DEFAULT_PASS_THRESHOLD));
    }

    #[test]
    fn final_round_with_high_score_is_exhausted() {
        let round = finish_round(
            3,
            vec![check("audit", 1.0, CheckStatus::Completed { pass_rate: 0.85 })],
            DEFAULT_PASS_THRESHOLD,
        );
        assert!(round.exhausted);
        assert_eq!(round.aggregate_score, 0.85);
    }

    #[test]
    fn reverification_targets_imperfect_checks() {
        let round = finish_round(
            1,
            vec![
                check("lint", 1.0, CheckStatus::Completed { pass_rate: 1.0 }),
                check("links", 1.0, CheckStatus::Completed { pass_rate: 0.5 }),
                check("secrets", 1.0, CheckStatus::TimedOut),
            ],
            DEFAULT_PASS_THRESHOLD,
        );
        assert_eq!(
            checks_needing_reverification(&round),
            vec!["links".to_string(), "secrets".to_string()]
        );
    }
}
