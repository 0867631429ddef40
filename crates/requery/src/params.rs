//! Retry-budget parameters carried in a job's internal policy params.

use serde::{Deserialize, Serialize};

use crosswalk_jobs::{Job, JobKey};

use crate::RequeryError;

/// Policy parameters of a requery job, round-tripped through `params_ops`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequeryParams {
    /// Remaining retry budget. The job whose budget reaches zero gets no
    /// follow-up.
    pub remaining_attempts: u32,
}

impl RequeryParams {
    pub fn new(remaining_attempts: u32) -> Self {
        Self { remaining_attempts }
    }

    /// Read the policy params back off a job row.
    pub fn from_job<K: JobKey>(job: &Job<K>) -> Result<Self, RequeryError> {
        serde_json::from_value(job.params_ops.clone())
            .map_err(|e| RequeryError::Params(format!("job {}: {e}", job.key)))
    }

    pub fn to_value(&self) -> serde_json::Value {
        serde_json::json!({ "remaining_attempts": self.remaining_attempts })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_params_ops() {
        let params = RequeryParams::new(4);
        let value = params.to_value();
        let back: RequeryParams = serde_json::from_value(value).unwrap();
        assert_eq!(back, params);
    }
}
