//! Mode transition rules.
//!
//! Components only emit signals; this module turns them into the next mode.
//! The orchestrator applies the result, which keeps every mode change in one place.

use crate::core::types::LoopMode;

/// Signals gathered for one invocation.
#[derive(Debug, Clone, PartialEq)]
pub struct TransitionSignals {
    pub mode: LoopMode,
    pub complete: bool,
    pub open_items: usize,
    pub work_observed: bool,
    pub force_exploration: bool,
    pub stagnant: bool,
    pub floor_active: bool,
}

/// What the orchestrator should do next.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transition {
    /// Keep the current mode.
    Stay,
    /// Enter a new mode (validation round resets to 0).
    Enter { mode: LoopMode, reason: String },
    /// Repetition in exploration: the loop should stop.
    StopRepetition,
}

pub fn decide_transition(signals: &TransitionSignals) -> Transition {
    match signals.mode {
        LoopMode::Terminated => Transition::Stay,
        LoopMode::Implementation => {
            if signals.stagnant {
                return enter(LoopMode::Exploration, "repetition detected");
            }
            if signals.force_exploration {
                return enter(LoopMode::Exploration, "idle iterations without real work");
            }
            if signals.complete {
                return enter(LoopMode::Validation, "completion signals detected");
            }
            Transition::Stay
        }
        LoopMode::Validation => {
            if signals.stagnant {
                return enter(LoopMode::Exploration, "repetition detected");
            }
            Transition::Stay
        }
        LoopMode::Exploration => {
            if signals.stagnant && !signals.floor_active {
                return Transition::StopRepetition;
            }
            if !signals.complete && signals.open_items > 0 && signals.work_observed {
                return enter(LoopMode::Implementation, "new open items in the task artifact");
            }
            Transition::Stay
        }
    }
}

fn enter(mode: LoopMode, reason: &str) -> Transition {
    Transition::Enter {
        mode,
        reason: reason.to_string(),
    }
}
