//! Outcome classification and retry loop
//!
//! [`Orchestrator::submit`] sends one pass through the batcher and sorts
//! each item into success, dropped conflict, dead letter or retry.
//! [`Orchestrator::retrying_submit`] repeats passes with a doubling backoff
//! until nothing is left or shutdown is requested.

pub mod backoff;
pub mod dead_letter;
pub mod orchestrator;

pub use backoff::Backoff;
pub use dead_letter::{DeadLetterSink, FileDeadLetterSink};
pub use orchestrator::{
    Disposition, Orchestrator, RetryConfig, SubmitError, SubmitStats, SubmitStatsSnapshot,
    CONFLICT_CODE, DEAD_LETTER_CODES, SUCCESS_CODES,
};
