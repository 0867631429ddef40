//! `crosswalk-requery` — bounded-retry requery policy.
//!
//! Policy layer over `crosswalk-jobs`: keeps at most one pending requery
//! per subject and kind by merging overlapping schedule requests (largest
//! retry budget wins, earliest due time wins), and schedules follow-ups
//! until the goals are met or the budget runs out.

use thiserror::Error;

pub mod goals;
pub mod params;
pub mod scheduler;

pub use goals::{GoalEvaluator, StaticGoals};
pub use params::RequeryParams;
pub use scheduler::{RequeryRequest, RetryScheduler, RunAttempt, DEDUP_REASON};

use crosswalk_jobs::JobStoreError;

/// Error produced by the requery policy layer.
#[derive(Debug, Error)]
pub enum RequeryError {
    /// The underlying job store refused an operation.
    #[error(transparent)]
    Store(#[from] JobStoreError),

    /// A job's policy params could not be read back.
    #[error("invalid requery params: {0}")]
    Params(String),

    /// The external goal evaluator failed.
    #[error("goal evaluation failed: {0}")]
    Goal(String),
}
