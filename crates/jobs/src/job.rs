//! Core job entity and progress types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crosswalk_core::{Entity, JobGroupId, RequestId, SubjectId, TenantId};

use crate::key::JobKey;
use crate::status::{self, InvalidTransition, JobStatus};

/// Outcome of one reported sub-unit of work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Successful,
    Failed,
}

/// A tracked unit of asynchronous work.
///
/// Generic over the identity shape `K` (surrogate id or workflow composite
/// key); tenant scope, lifecycle, counters and payloads are identical for
/// both. Rows are never hard-deleted; termination is a status value.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job<K> {
    /// Row identity (tenant-scoped).
    pub key: K,
    /// Tenant scope
    pub tenant_id: TenantId,
    /// Subject the work is about (e.g. a patient record)
    pub subject_id: SubjectId,
    /// Kind of work, for routing and lookups
    pub job_type: String,
    /// Clusters related job instances
    pub job_group: JobGroupId,
    /// Correlates to the external async operation
    pub request_id: RequestId,
    /// Current lifecycle status
    pub status: JobStatus,
    /// Free text set on failure/cancellation
    pub status_reason: Option<String>,
    /// Earliest time the job should run (advisory, read by an external poller)
    pub scheduled_at: Option<DateTime<Utc>>,
    /// Stamped on first entry into `Processing`
    pub started_at: Option<DateTime<Utc>>,
    /// Stamped on first entry into `Completed`
    pub finished_at: Option<DateTime<Utc>>,
    /// Stamped on first entry into `Cancelled`
    pub cancelled_at: Option<DateTime<Utc>>,
    /// Stamped on first entry into `Failed`
    pub failed_at: Option<DateTime<Utc>>,
    /// Expected number of sub-units; 0 until sized
    pub total: u32,
    /// Sub-units reported successful
    pub successful: u32,
    /// Sub-units reported failed
    pub failed: u32,
    /// Caller-supplied, tenant-visible parameters
    pub params_cx: serde_json::Value,
    /// Internal policy parameters (e.g. retry budget)
    pub params_ops: serde_json::Value,
    /// Result payload
    pub data: serde_json::Value,
    /// Opaque scratch space, replaced whole on write
    pub runtime_data: serde_json::Value,
    /// Callback target used by external schedulers
    pub run_url: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl<K: JobKey> Entity for Job<K> {
    type Id = K;

    fn id(&self) -> &K {
        &self.key
    }
}

/// Input for creating a job. Starts `Waiting` with unsized counters.
#[derive(Debug, Clone)]
pub struct NewJob<K> {
    pub key: K,
    pub tenant_id: TenantId,
    pub subject_id: SubjectId,
    pub job_type: String,
    pub job_group: JobGroupId,
    pub request_id: RequestId,
    pub scheduled_at: Option<DateTime<Utc>>,
    pub params_cx: serde_json::Value,
    pub params_ops: serde_json::Value,
    pub run_url: Option<String>,
}

impl<K: JobKey> NewJob<K> {
    pub fn new(
        key: K,
        tenant_id: TenantId,
        subject_id: SubjectId,
        job_type: impl Into<String>,
        job_group: JobGroupId,
        request_id: RequestId,
    ) -> Self {
        Self {
            key,
            tenant_id,
            subject_id,
            job_type: job_type.into(),
            job_group,
            request_id,
            scheduled_at: None,
            params_cx: serde_json::Value::Null,
            params_ops: serde_json::Value::Null,
            run_url: None,
        }
    }

    pub fn scheduled_at(mut self, at: DateTime<Utc>) -> Self {
        self.scheduled_at = Some(at);
        self
    }

    pub fn with_params_cx(mut self, params: serde_json::Value) -> Self {
        self.params_cx = params;
        self
    }

    pub fn with_params_ops(mut self, params: serde_json::Value) -> Self {
        self.params_ops = params;
        self
    }

    pub fn with_run_url(mut self, url: impl Into<String>) -> Self {
        self.run_url = Some(url.into());
        self
    }

    /// Materialize the row at creation time.
    pub fn into_job(self, now: DateTime<Utc>) -> Job<K> {
        Job {
            key: self.key,
            tenant_id: self.tenant_id,
            subject_id: self.subject_id,
            job_type: self.job_type,
            job_group: self.job_group,
            request_id: self.request_id,
            status: JobStatus::Waiting,
            status_reason: None,
            scheduled_at: self.scheduled_at,
            started_at: None,
            finished_at: None,
            cancelled_at: None,
            failed_at: None,
            total: 0,
            successful: 0,
            failed: 0,
            params_cx: self.params_cx,
            params_ops: self.params_ops,
            data: serde_json::Value::Null,
            runtime_data: serde_json::Value::Null,
            run_url: self.run_url,
            created_at: now,
            updated_at: now,
        }
    }
}

impl<K: JobKey> Job<K> {
    /// Counters are exhausted once a sized job has accounted for every
    /// sub-unit. Unsized jobs (`total == 0`) are never exhausted.
    pub fn is_exhausted(&self) -> bool {
        self.total > 0 && self.successful + self.failed >= self.total
    }

    /// Apply a status transition in place.
    ///
    /// Returns `true` when this call *entered* the requested status for the
    /// first time (the only case that stamps a timestamp and may fire a
    /// terminal hook). Re-applying the current terminal status is a no-op
    /// returning `false`. `force` skips edge validation but keeps the
    /// first-entry-only stamp and no-op semantics.
    pub fn apply_transition(
        &mut self,
        requested: JobStatus,
        reason: Option<&str>,
        now: DateTime<Utc>,
        force: bool,
    ) -> Result<bool, InvalidTransition> {
        if self.status == requested {
            if force || requested.is_terminal() {
                return Ok(false);
            }
            return Err(InvalidTransition {
                from: self.status,
                to: requested,
            });
        }
        if !force {
            status::validate(self.status, requested)?;
        }

        self.status = requested;
        if let Some(reason) = reason {
            self.status_reason = Some(reason.to_string());
        }
        let stamp = match requested {
            JobStatus::Waiting => None,
            JobStatus::Processing => Some(&mut self.started_at),
            JobStatus::Completed => Some(&mut self.finished_at),
            JobStatus::Failed => Some(&mut self.failed_at),
            JobStatus::Cancelled => Some(&mut self.cancelled_at),
        };
        if let Some(slot) = stamp {
            slot.get_or_insert(now);
        }
        self.updated_at = now;
        Ok(true)
    }

    /// Count one outcome against the progress counters.
    ///
    /// Returns `false` without touching the row when the job is no longer
    /// active or is already exhausted: a late report must never push the
    /// counters past `total` or resurrect a terminal job.
    pub fn record_outcome(&mut self, outcome: Outcome, now: DateTime<Utc>) -> bool {
        if !self.status.is_active() || self.is_exhausted() {
            return false;
        }
        match outcome {
            Outcome::Successful => self.successful += 1,
            Outcome::Failed => self.failed += 1,
        }
        self.updated_at = now;
        true
    }

    /// Size (or re-size) the job. Counters always reset together.
    pub fn reset_total(&mut self, total: u32, now: DateTime<Utc>) {
        self.total = total;
        self.successful = 0;
        self.failed = 0;
        self.updated_at = now;
    }

    /// Current counter view of this row.
    pub fn snapshot(&self, counted: bool) -> ProgressSnapshot {
        ProgressSnapshot {
            status: self.status,
            successful: self.successful,
            failed: self.failed,
            total: self.total,
            counted,
        }
    }
}

/// Counter view returned by a progress report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressSnapshot {
    pub status: JobStatus,
    pub successful: u32,
    pub failed: u32,
    pub total: u32,
    /// Whether this report was actually counted (false for late reports
    /// against a terminal or already-exhausted job).
    pub counted: bool,
}

impl ProgressSnapshot {
    pub fn is_exhausted(&self) -> bool {
        self.total > 0 && self.successful + self.failed >= self.total
    }
}

/// Per-status job counts for one tenant.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct JobStats {
    pub waiting: usize,
    pub processing: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
}

impl JobStats {
    pub fn count(&mut self, status: JobStatus) {
        self.add(status, 1);
    }

    pub fn add(&mut self, status: JobStatus, n: usize) {
        match status {
            JobStatus::Waiting => self.waiting += n,
            JobStatus::Processing => self.processing += n,
            JobStatus::Completed => self.completed += n,
            JobStatus::Failed => self.failed += n,
            JobStatus::Cancelled => self.cancelled += n,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crosswalk_core::JobId;

    fn test_job() -> Job<JobId> {
        NewJob::new(
            JobId::new(),
            TenantId::new(),
            SubjectId::new(),
            "network_requery",
            JobGroupId::new(),
            RequestId::new(),
        )
        .into_job(Utc::now())
    }

    #[test]
    fn new_job_starts_waiting_and_unsized() {
        let job = test_job();
        assert_eq!(job.status, JobStatus::Waiting);
        assert_eq!((job.total, job.successful, job.failed), (0, 0, 0));
        assert!(!job.is_exhausted());
    }

    #[test]
    fn first_terminal_entry_stamps_once() {
        let mut job = test_job();
        let t1 = Utc::now();
        let t2 = t1 + chrono::Duration::minutes(1);

        job.apply_transition(JobStatus::Processing, None, t1, false)
            .unwrap();
        assert_eq!(job.started_at, Some(t1));

        let entered = job
            .apply_transition(JobStatus::Completed, None, t1, false)
            .unwrap();
        assert!(entered);
        assert_eq!(job.finished_at, Some(t1));

        // Re-applying the terminal status is a no-op: same stamp, no entry.
        let entered = job
            .apply_transition(JobStatus::Completed, None, t2, false)
            .unwrap();
        assert!(!entered);
        assert_eq!(job.finished_at, Some(t1));
    }

    #[test]
    fn forced_transition_skips_validation_but_not_stamp_guard() {
        let mut job = test_job();
        let t1 = Utc::now();
        job.apply_transition(JobStatus::Completed, None, t1, false)
            .unwrap_err();

        let entered = job
            .apply_transition(JobStatus::Completed, None, t1, true)
            .unwrap();
        assert!(entered);
        assert_eq!(job.finished_at, Some(t1));

        // Forced back out and in again: the original stamp survives.
        let t2 = t1 + chrono::Duration::minutes(1);
        job.apply_transition(JobStatus::Processing, None, t2, true)
            .unwrap();
        job.apply_transition(JobStatus::Completed, None, t2, true)
            .unwrap();
        assert_eq!(job.finished_at, Some(t1));
    }

    #[test]
    fn outcome_counting_respects_exhaustion_and_terminal_status() {
        let mut job = test_job();
        let now = Utc::now();
        job.reset_total(2, now);

        assert!(job.record_outcome(Outcome::Successful, now));
        assert!(job.record_outcome(Outcome::Failed, now));
        assert!(job.is_exhausted());

        // Exhausted: further reports are not counted.
        assert!(!job.record_outcome(Outcome::Successful, now));
        assert_eq!((job.successful, job.failed), (1, 1));

        // Terminal: same.
        job.apply_transition(JobStatus::Processing, None, now, true)
            .unwrap();
        job.apply_transition(JobStatus::Cancelled, None, now, false)
            .unwrap();
        assert!(!job.record_outcome(Outcome::Failed, now));
    }

    #[test]
    fn reset_total_clears_counters_together() {
        let mut job = test_job();
        let now = Utc::now();
        job.reset_total(3, now);
        job.record_outcome(Outcome::Successful, now);
        job.record_outcome(Outcome::Failed, now);

        job.reset_total(5, now);
        assert_eq!((job.total, job.successful, job.failed), (5, 0, 0));
    }

    #[test]
    fn status_reason_set_on_cancel() {
        let mut job = test_job();
        let now = Utc::now();
        job.apply_transition(JobStatus::Cancelled, Some("superseded"), now, false)
            .unwrap();
        assert_eq!(job.status_reason.as_deref(), Some("superseded"));
        assert_eq!(job.cancelled_at, Some(now));
    }
}
