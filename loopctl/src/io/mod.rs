//! Side-effecting helpers: filesystem, subprocesses, and templates.

pub mod checks;
pub mod config;
pub mod discovery;
pub mod git;
pub mod journal;
pub mod kill_switch;
pub mod paths;
pub mod process;
pub mod prompt;
pub mod state_store;
pub mod transcript;
pub mod work_probe;
