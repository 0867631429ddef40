//! Goal evaluation boundary.
//!
//! Whether a finished requery run actually satisfied its domain goals
//! (records located, demographics matched, documents fetched) is decided by
//! an external collaborator behind this trait. The policy layer only asks
//! yes/no.

use async_trait::async_trait;

use crosswalk_core::JobId;
use crosswalk_jobs::Job;

use crate::RequeryError;

/// Decides whether a job's domain goals are already met.
#[async_trait]
pub trait GoalEvaluator: Send + Sync {
    async fn goals_met(&self, job: &Job<JobId>) -> Result<bool, RequeryError>;
}

/// Evaluator with a fixed answer, for wiring and tests.
#[derive(Debug, Clone, Copy)]
pub struct StaticGoals(pub bool);

#[async_trait]
impl GoalEvaluator for StaticGoals {
    async fn goals_met(&self, _job: &Job<JobId>) -> Result<bool, RequeryError> {
        Ok(self.0)
    }
}
