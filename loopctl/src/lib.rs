//! Stop-hook loop controller for autonomous agent sessions.
//!
//! Every time an agent's turn is about to end, the host runs `loopctl hook`.
//! The controller decides whether to allow the stop or to block it with a
//! synthesized next instruction. Invocations share nothing but a per-session
//! state file. The crate keeps a strict separation:
//!
//! - **[`core`]**: Pure, deterministic decision logic (gate, completion scoring,
//!   backoff, repetition, validation scoring, arbitration, mode transitions).
//! - **[`io`]**: Side-effecting operations (state files, config, git, check
//!   subprocesses, templates, journal).
//! - **[`adapters`]**: Domain-specific convergence modules behind one trait.
//!
//! Orchestration modules ([`hook`], [`validation`], [`status`]) coordinate core
//! logic with I/O to implement CLI commands.

pub mod adapters;
pub mod core;
pub mod exit_codes;
pub mod hook;
pub mod io;
pub mod logging;
pub mod status;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
pub mod validation;
