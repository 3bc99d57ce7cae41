//! Bounded generate-and-verify loop for a single issue.
//!
//! - [`FixController`] - runs attempts until one passes or the budget runs out
//! - [`FailureHistory`] - append-only memory of failed attempts
//! - [`types`] - the values exchanged with generator, diagnoser and sandbox

pub mod controller;
pub mod history;
pub mod types;

pub use controller::{AttemptBudget, FixController};
pub use history::FailureHistory;
pub use types::{
    AbortCause, AttemptRecord, CandidatePatch, CodeExcerpt, LoopOutcome, LoopResult,
    ProblemStatement, VerificationOutcome, LAUNCH_FAILED_EXIT_CODE, TIMED_OUT_EXIT_CODE,
};
