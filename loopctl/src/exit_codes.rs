//! Stable exit codes for loopctl commands.

/// Command succeeded. `hook` always exits with this once a decision is printed.
pub const OK: i32 = 0;
/// Invalid input: unknown session, corrupt state, bad arguments.
pub const INVALID: i32 = 1;
