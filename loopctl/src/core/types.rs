//! Shared deterministic types for controller core logic.
//!
//! These types define stable contracts between core components. They should not
//! depend on external state or I/O and must remain deterministic across runs.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Phase of the loop state machine. Only the orchestrator changes it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LoopMode {
    Implementation,
    Validation,
    Exploration,
    Terminated,
}

impl LoopMode {
    pub fn as_str(self) -> &'static str {
        match self {
            LoopMode::Implementation => "IMPLEMENTATION",
            LoopMode::Validation => "VALIDATION",
            LoopMode::Exploration => "EXPLORATION",
            LoopMode::Terminated => "TERMINATED",
        }
    }
}

/// Independent evidence that the task artifact is finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalKind {
    ExplicitMarker,
    StatusField,
    AllChecked,
    NoPendingItems,
    SemanticPhrase,
}

/// One detected completion signal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletionSignal {
    pub kind: SignalKind,
    /// Always within `[0, 1]`.
    pub confidence: f64,
    /// `path:line` of the first line that produced the signal.
    pub source_location: String,
}

/// Result of scanning the task artifact.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct CompletionReport {
    pub signals: Vec<CompletionSignal>,
    pub confidence: f64,
    /// Unchecked checklist items across all notations.
    pub open_items: usize,
    /// Text of unchecked items, in document order.
    pub open_item_texts: Vec<String>,
}

/// One metrics sample reported by a domain adapter. Appended, never mutated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricsEntry {
    pub timestamp: DateTime<Utc>,
    pub identifier: String,
    pub primary_metric: f64,
    #[serde(default)]
    pub secondary_metrics: BTreeMap<String, f64>,
}

/// Adapter opinion on whether the loop has converged.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConvergenceResult {
    pub should_continue: bool,
    pub reason: String,
    pub confidence: f64,
}

impl ConvergenceResult {
    /// An adapter without an opinion.
    pub fn no_opinion(reason: impl Into<String>) -> Self {
        Self {
            should_continue: true,
            reason: reason.into(),
            confidence: 0.0,
        }
    }
}

/// Outcome of a single validation check.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum CheckStatus {
    Completed { pass_rate: f64 },
    TimedOut,
    Errored { message: String },
}

/// Recorded result of a validation check.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckResult {
    pub name: String,
    pub round: u8,
    pub weight: f64,
    pub status: CheckStatus,
    #[serde(default)]
    pub findings: Vec<String>,
    pub duration_ms: u64,
}

impl CheckResult {
    pub fn pass_rate(&self) -> Option<f64> {
        match self.status {
            CheckStatus::Completed { pass_rate } => Some(pass_rate),
            _ => None,
        }
    }
}

/// Aggregate of one validation round.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationRound {
    pub round_number: u8,
    pub checks: Vec<CheckResult>,
    pub aggregate_score: f64,
    pub exhausted: bool,
}

/// Final per-invocation decision handed back to the host tool.
#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    AllowStop { reason: String },
    Block { prompt: String, backoff_seconds: u64 },
}

impl Decision {
    pub fn is_block(&self) -> bool {
        matches!(self, Decision::Block { .. })
    }

    /// JSON payload written to stdout: `{}` or a `block` object.
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Decision::AllowStop { .. } => serde_json::json!({}),
            Decision::Block {
                prompt,
                backoff_seconds,
            } => {
                let mut out = serde_json::json!({
                    "decision": "block",
                    "reason": prompt,
                });
                if *backoff_seconds > 0 {
                    out["backoff_seconds"] = serde_json::json!(backoff_seconds);
                }
                out
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allow_stop_serializes_to_empty_object() {
        let decision = Decision::AllowStop {
            reason: "done".to_string(),
        };
        assert_eq!(decision.to_json().to_string(), "{}");
    }

    #[test]
    fn block_omits_zero_backoff() {
        let decision = Decision::Block {
            prompt: "keep going".to_string(),
            backoff_seconds: 0,
        };
        let json = decision.to_json();
        assert_eq!(json["decision"], "block");
        assert_eq!(json["reason"], "keep going");
        assert!(json.get("backoff_seconds").is_none());
    }

    #[test]
    fn block_carries_backoff_hint() {
        let decision = Decision::Block {
            prompt: "wait".to_string(),
            backoff_seconds: 240,
        };
        assert_eq!(decision.to_json()["backoff_seconds"], 240);
    }

    #[test]
    fn mode_serializes_screaming_case() {
        let json = serde_json::to_string(&LoopMode::Exploration).expect("serialize");
        assert_eq!(json, "\"EXPLORATION\"");
    }
}
