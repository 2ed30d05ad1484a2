//! Deterministic, pure logic shared by the controller core.
//!
//! Core modules must be free of I/O side effects. They operate on in-memory
//! data structures and return deterministic outputs suitable for tests.

pub mod arbiter;
pub mod classifier;
pub mod completion;
pub mod gate;
pub mod idle;
pub mod similarity;
pub mod transition;
pub mod types;
pub mod validation;
