//! Kill switch and global limit gate.
//!
//! The gate is evaluated before any other component. It never mutates state.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Effective wall-clock and iteration limits for a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoopLimits {
    pub min_hours: f64,
    pub max_hours: f64,
    pub min_iterations: u32,
    pub max_iterations: u32,
    /// Per-check timeout used by the validation engine.
    pub check_timeout_secs: u64,
}

impl Default for LoopLimits {
    fn default() -> Self {
        Self {
            min_hours: 0.0,
            max_hours: 9.0,
            min_iterations: 0,
            max_iterations: 99,
            check_timeout_secs: 120,
        }
    }
}

/// Inputs to the gate for one invocation.
#[derive(Debug, Clone)]
pub struct GateInput<'a> {
    pub kill_switch: bool,
    pub start_time: DateTime<Utc>,
    pub now: DateTime<Utc>,
    pub iteration: u32,
    pub limits: &'a LoopLimits,
}

/// Verdict of the gate.
#[derive(Debug, Clone, PartialEq)]
pub enum GateVerdict {
    /// Kill switch present: stop unconditionally.
    Killed,
    /// A maximum limit was reached.
    LimitReached { reason: String },
    /// Minimum work floor not yet met: stopping is forbidden.
    FloorActive { reason: String },
    /// Defer to the rest of the pipeline.
    Proceed,
}

impl GateVerdict {
    pub fn allows_stop(&self) -> bool {
        matches!(self, GateVerdict::Killed | GateVerdict::LimitReached { .. })
    }
}

/// Hours elapsed between `start` and `now` (never negative).
pub fn elapsed_hours(start: DateTime<Utc>, now: DateTime<Utc>) -> f64 {
    let secs = (now - start).num_milliseconds().max(0) as f64 / 1000.0;
    secs / 3600.0
}

/// Evaluate the gate. Kill switch dominates, then max limits, then min floors.
pub fn evaluate_gate(input: &GateInput<'_>) -> GateVerdict {
    if input.kill_switch {
        return GateVerdict::Killed;
    }

    let hours = elapsed_hours(input.start_time, input.now);
    let limits = input.limits;
    if hours >= limits.max_hours {
        return GateVerdict::LimitReached {
            reason: format!(
                "maximum runtime reached ({hours:.2}h >= {:.2}h)",
                limits.max_hours
            ),
        };
    }
    if input.iteration >= limits.max_iterations {
        return GateVerdict::LimitReached {
            reason: format!(
                "maximum iterations reached ({} >= {})",
                input.iteration, limits.max_iterations
            ),
        };
    }

    if hours < limits.min_hours {
        return GateVerdict::FloorActive {
            reason: format!(
                "minimum runtime not met ({hours:.2}h < {:.2}h)",
                limits.min_hours
            ),
        };
    }
    if input.iteration < limits.min_iterations {
        return GateVerdict::FloorActive {
            reason: format!(
                "minimum iterations not met ({} < {})",
                input.iteration, limits.min_iterations
            ),
        };
    }

    GateVerdict::Proceed
}
