//! Confidence-keyed combination of the generic decision with an adapter opinion.

use crate::core::types::ConvergenceResult;

const SUGGEST_CONFIDENCE: f64 = 0.5;
const HARD_CONFIDENCE: f64 = 1.0;

/// Decision produced by the generic pipeline before adapters weigh in.
#[derive(Debug, Clone, PartialEq)]
pub struct GenericDecision {
    pub should_continue: bool,
    /// The generic heuristics consider the work finished.
    pub leans_stop: bool,
    pub reason: String,
}

/// How strongly an adapter opinion is applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverrideStrength {
    NoOpinion,
    Suggest,
    Hard,
}

pub fn strength(confidence: f64) -> OverrideStrength {
    if confidence.is_nan() || confidence < SUGGEST_CONFIDENCE {
        OverrideStrength::NoOpinion
    } else if confidence < HARD_CONFIDENCE {
        OverrideStrength::Suggest
    } else {
        OverrideStrength::Hard
    }
}

/// Final continue/stop verdict after arbitration.
#[derive(Debug, Clone, PartialEq)]
pub struct Arbitration {
    pub should_continue: bool,
    pub reason: String,
    pub strength: OverrideStrength,
}

/// Combine `generic` with `adapter`.
///
/// - no opinion: the generic decision stands.
/// - suggestion: applied only when the generic decision already leans toward stopping.
/// - hard: the adapter's verdict replaces the generic decision.
pub fn arbitrate(generic: &GenericDecision, adapter: &ConvergenceResult) -> Arbitration {
    let strength = strength(adapter.confidence);
    match strength {
        OverrideStrength::NoOpinion => Arbitration {
            should_continue: generic.should_continue,
            reason: generic.reason.clone(),
            strength,
        },
        OverrideStrength::Suggest if generic.leans_stop => Arbitration {
            should_continue: adapter.should_continue,
            reason: adapter.reason.clone(),
            strength,
        },
        OverrideStrength::Suggest => Arbitration {
            should_continue: generic.should_continue,
            reason: generic.reason.clone(),
            strength,
        },
        OverrideStrength::Hard => Arbitration {
            should_continue: adapter.should_continue,
            reason: adapter.reason.clone(),
            strength,
        },
    }
}
