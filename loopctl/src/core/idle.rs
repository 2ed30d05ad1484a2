//! Stamina backoff for unproductive iterations.

use crate::core::types::LoopMode;

const BASE_BACKOFF_SECS: u64 = 30;
const MAX_BACKOFF_SECS: u64 = 300;

/// Consecutive idle iterations in IMPLEMENTATION that force EXPLORATION.
pub const DEFAULT_FORCE_AFTER: u32 = 3;

/// Advisory wait for `idle_count` consecutive idle iterations.
///
/// 0 → 0, then 30, 60, 120, 240, capped at 300.
pub fn backoff_seconds(idle_count: u32) -> u64 {
    if idle_count == 0 {
        return 0;
    }
    let exponent = (idle_count - 1).min(16);
    BASE_BACKOFF_SECS
        .saturating_mul(1u64 << exponent)
        .min(MAX_BACKOFF_SECS)
}

/// Result of feeding one iteration's work observation into the tracker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdleOutcome {
    pub idle_count: u32,
    pub backoff_seconds: u64,
    /// IMPLEMENTATION has idled long enough to force EXPLORATION.
    pub force_exploration: bool,
}

/// Update idle bookkeeping for one iteration.
pub fn observe_iteration(
    previous_idle: u32,
    work_observed: bool,
    mode: LoopMode,
    force_after: u32,
) -> IdleOutcome {
    if work_observed {
        return IdleOutcome {
            idle_count: 0,
            backoff_seconds: 0,
            force_exploration: false,
        };
    }

    let idle_count = previous_idle.saturating_add(1);
    let force_exploration =
        mode == LoopMode::Implementation && force_after > 0 && idle_count >= force_after;
    // A forced transition escalates the wait by one step.
    let backoff = if force_exploration {
        backoff_seconds(idle_count.saturating_add(1))
    } else {
        backoff_seconds(idle_count)
    };
    IdleOutcome {
        idle_count,
        backoff_seconds: backoff,
        force_exploration,
    }
}
