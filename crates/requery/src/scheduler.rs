//! Bounded-retry requery scheduling.
//!
//! Guarantees at most one pending requery per subject and kind, no matter
//! how many concurrent triggers fire. Overlapping requests are merged into a
//! single surviving job: the largest retry budget wins, the earliest due
//! time wins, and every superseded job is cancelled before it ever runs.

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use crosswalk_core::{JobGroupId, JobId, RequestId, SubjectId, TenantId};
use crosswalk_jobs::{
    Job, JobLifecycleManager, JobStatus, JobStore, JobStoreError, NewJob, TerminalOptions,
};

use crate::goals::GoalEvaluator;
use crate::params::RequeryParams;
use crate::RequeryError;

/// Status reason written on jobs retired by deduplication.
pub const DEDUP_REASON: &str = "Deduplicated into a new job";

/// A request to schedule (or re-schedule) a requery for a subject.
#[derive(Debug, Clone)]
pub struct RequeryRequest {
    pub tenant_id: TenantId,
    pub subject_id: SubjectId,
    pub job_type: String,
    pub job_group: JobGroupId,
    /// Proposed retry budget; merged with any pending job's budget.
    pub remaining_attempts: u32,
    /// Proposed due time; merged with any pending job's due time.
    pub scheduled_at: DateTime<Utc>,
    pub params_cx: serde_json::Value,
    pub run_url: Option<String>,
}

impl RequeryRequest {
    pub fn new(
        tenant_id: TenantId,
        subject_id: SubjectId,
        job_type: impl Into<String>,
        job_group: JobGroupId,
        remaining_attempts: u32,
        scheduled_at: DateTime<Utc>,
    ) -> Self {
        Self {
            tenant_id,
            subject_id,
            job_type: job_type.into(),
            job_group,
            remaining_attempts,
            scheduled_at,
            params_cx: serde_json::Value::Null,
            run_url: None,
        }
    }

    pub fn with_params_cx(mut self, params: serde_json::Value) -> Self {
        self.params_cx = params;
        self
    }

    pub fn with_run_url(mut self, url: impl Into<String>) -> Self {
        self.run_url = Some(url.into());
        self
    }
}

/// How the finished run attempt went, from the runner's point of view.
///
/// Only an attempt that actually ran consumes retry budget; an
/// infrastructure failure (run never happened) leaves it untouched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunAttempt {
    Succeeded,
    InfrastructureFailure,
}

/// Dedup-and-merge scheduler for bounded-retry requeries.
pub struct RetryScheduler<S> {
    lifecycle: JobLifecycleManager<S>,
}

impl<S> Clone for RetryScheduler<S> {
    fn clone(&self) -> Self {
        Self {
            lifecycle: self.lifecycle.clone(),
        }
    }
}

impl<S: JobStore<JobId>> RetryScheduler<S> {
    pub fn new(lifecycle: JobLifecycleManager<S>) -> Self {
        Self { lifecycle }
    }

    pub fn lifecycle(&self) -> &JobLifecycleManager<S> {
        &self.lifecycle
    }

    /// Schedule a requery, deduplicating against pending jobs.
    ///
    /// Every `Waiting` job of the same (tenant, subject, type, group) is
    /// folded into the new one (`remaining_attempts = max`,
    /// `scheduled_at = min`) and then cancelled with [`DEDUP_REASON`].
    /// Exactly one pending job survives.
    pub async fn schedule(&self, request: RequeryRequest) -> Result<Job<JobId>, RequeryError> {
        let pending = self
            .lifecycle
            .store()
            .find_group(
                request.tenant_id,
                request.subject_id,
                &request.job_type,
                request.job_group,
                &[JobStatus::Waiting],
            )
            .await
            .map_err(RequeryError::from)?;

        let mut remaining_attempts = request.remaining_attempts;
        let mut scheduled_at = request.scheduled_at;
        for job in &pending {
            let params = RequeryParams::from_job(job)?;
            remaining_attempts = remaining_attempts.max(params.remaining_attempts);
            if let Some(due) = job.scheduled_at {
                scheduled_at = scheduled_at.min(due);
            }
        }

        for job in &pending {
            match self
                .lifecycle
                .cancel(
                    request.tenant_id,
                    &job.key,
                    TerminalOptions::default().with_reason(DEDUP_REASON),
                )
                .await
            {
                Ok(_) => {
                    debug!(job = %job.key, "pending requery deduplicated");
                }
                // The job left Waiting between lookup and cancel; its state
                // is already carried forward in the merge above.
                Err(JobStoreError::InvalidTransition(t)) => {
                    warn!(job = %job.key, transition = %t, "pending requery moved before dedup");
                }
                Err(err) => return Err(err.into()),
            }
        }

        let mut new_job = NewJob::new(
            JobId::new(),
            request.tenant_id,
            request.subject_id,
            request.job_type,
            request.job_group,
            RequestId::new(),
        )
        .scheduled_at(scheduled_at)
        .with_params_cx(request.params_cx)
        .with_params_ops(RequeryParams::new(remaining_attempts).to_value());
        if let Some(url) = request.run_url {
            new_job = new_job.with_run_url(url);
        }

        let job = self.lifecycle.create(new_job, false).await?;
        info!(
            job = %job.key,
            tenant = %job.tenant_id,
            subject = %job.subject_id,
            remaining_attempts,
            merged = pending.len(),
            "requery scheduled"
        );
        Ok(job)
    }

    /// Decide what happens after a run of `finished` completed.
    ///
    /// Stops (returns `None`) when the goals are already met or the retry
    /// budget is exhausted. Otherwise schedules exactly one follow-up via
    /// the same merge algorithm, consuming budget only for attempts that
    /// actually ran.
    pub async fn follow_up(
        &self,
        tenant_id: TenantId,
        finished: &JobId,
        attempt: RunAttempt,
        next_due: DateTime<Utc>,
        evaluator: &dyn GoalEvaluator,
    ) -> Result<Option<Job<JobId>>, RequeryError> {
        let job = self.lifecycle.get(tenant_id, finished).await?;
        let params = RequeryParams::from_job(&job)?;

        if evaluator.goals_met(&job).await? {
            info!(job = %job.key, "requery goals met; no follow-up");
            return Ok(None);
        }
        if params.remaining_attempts == 0 {
            info!(job = %job.key, "retry budget exhausted; no follow-up");
            return Ok(None);
        }

        let remaining_attempts = match attempt {
            RunAttempt::Succeeded => params.remaining_attempts - 1,
            RunAttempt::InfrastructureFailure => params.remaining_attempts,
        };

        let mut request = RequeryRequest::new(
            tenant_id,
            job.subject_id,
            job.job_type.clone(),
            job.job_group,
            remaining_attempts,
            next_due,
        )
        .with_params_cx(job.params_cx.clone());
        if let Some(url) = job.run_url.clone() {
            request = request.with_run_url(url);
        }

        self.schedule(request).await.map(Some)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use chrono::{Duration, Utc};

    use crosswalk_core::{Clock, FixedClock};
    use crosswalk_jobs::InMemoryJobStore;

    use crate::goals::StaticGoals;

    type Store = InMemoryJobStore<JobId>;

    struct Fixture {
        scheduler: RetryScheduler<Store>,
        clock: Arc<FixedClock>,
        tenant: TenantId,
        subject: SubjectId,
        group: JobGroupId,
    }

    fn fixture() -> Fixture {
        let clock = Arc::new(FixedClock::new(Utc::now()));
        let lifecycle = JobLifecycleManager::new(Store::arc(), clock.clone());
        Fixture {
            scheduler: RetryScheduler::new(lifecycle),
            clock,
            tenant: TenantId::new(),
            subject: SubjectId::new(),
            group: JobGroupId::new(),
        }
    }

    impl Fixture {
        fn request(&self, remaining: u32, due_in: Duration) -> RequeryRequest {
            RequeryRequest::new(
                self.tenant,
                self.subject,
                "network_requery",
                self.group,
                remaining,
                self.clock.now() + due_in,
            )
        }

        /// Drive a pending job through to `Completed`, as the external
        /// runner would before `follow_up` is consulted.
        async fn run_to_completion(&self, key: &JobId) {
            let lifecycle = self.scheduler.lifecycle();
            lifecycle.initialize(self.tenant, key, false).await.unwrap();
            lifecycle
                .complete(self.tenant, key, Default::default())
                .await
                .unwrap();
        }

        async fn pending(&self) -> Vec<Job<JobId>> {
            self.scheduler
                .lifecycle()
                .store()
                .find_group(
                    self.tenant,
                    self.subject,
                    "network_requery",
                    self.group,
                    &[JobStatus::Waiting],
                )
                .await
                .unwrap()
        }
    }

    #[tokio::test]
    async fn merges_budget_and_due_time_into_one_survivor() {
        let f = fixture();
        let t = f.clock.now();

        // Existing pending retry: smaller budget, later due time.
        let old = f
            .scheduler
            .schedule(f.request(2, Duration::minutes(30)))
            .await
            .unwrap();

        // New trigger proposes a bigger budget and an earlier due time.
        let merged = f
            .scheduler
            .schedule(f.request(3, Duration::minutes(5)))
            .await
            .unwrap();

        let pending = f.pending().await;
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].key, merged.key);
        assert_eq!(pending[0].scheduled_at, Some(t + Duration::minutes(5)));
        assert_eq!(
            RequeryParams::from_job(&pending[0]).unwrap().remaining_attempts,
            3
        );

        let old = f.scheduler.lifecycle().get(f.tenant, &old.key).await.unwrap();
        assert_eq!(old.status, JobStatus::Cancelled);
        assert_eq!(old.status_reason.as_deref(), Some(DEDUP_REASON));
    }

    #[tokio::test]
    async fn keeps_existing_budget_and_due_time_when_more_favorable() {
        let f = fixture();
        let t = f.clock.now();

        f.scheduler
            .schedule(f.request(5, Duration::minutes(5)))
            .await
            .unwrap();
        f.scheduler
            .schedule(f.request(1, Duration::minutes(30)))
            .await
            .unwrap();

        let pending = f.pending().await;
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].scheduled_at, Some(t + Duration::minutes(5)));
        assert_eq!(
            RequeryParams::from_job(&pending[0]).unwrap().remaining_attempts,
            5
        );
    }

    #[tokio::test]
    async fn repeated_triggers_leave_exactly_one_pending_job() {
        let f = fixture();
        for i in 0..5 {
            f.scheduler
                .schedule(f.request(i, Duration::minutes(10 + i as i64)))
                .await
                .unwrap();
        }
        assert_eq!(f.pending().await.len(), 1);
    }

    #[tokio::test]
    async fn follow_up_stops_when_goals_met() {
        let f = fixture();
        let job = f
            .scheduler
            .schedule(f.request(3, Duration::minutes(5)))
            .await
            .unwrap();
        f.run_to_completion(&job.key).await;

        let next = f
            .scheduler
            .follow_up(
                f.tenant,
                &job.key,
                RunAttempt::Succeeded,
                f.clock.now() + Duration::hours(1),
                &StaticGoals(true),
            )
            .await
            .unwrap();
        assert!(next.is_none());
    }

    #[tokio::test]
    async fn follow_up_stops_when_budget_exhausted() {
        let f = fixture();
        let job = f
            .scheduler
            .schedule(f.request(0, Duration::minutes(5)))
            .await
            .unwrap();
        f.run_to_completion(&job.key).await;

        let next = f
            .scheduler
            .follow_up(
                f.tenant,
                &job.key,
                RunAttempt::Succeeded,
                f.clock.now() + Duration::hours(1),
                &StaticGoals(false),
            )
            .await
            .unwrap();
        assert!(next.is_none());
    }

    #[tokio::test]
    async fn successful_attempt_consumes_budget() {
        let f = fixture();
        let job = f
            .scheduler
            .schedule(f.request(3, Duration::minutes(5)))
            .await
            .unwrap();
        f.run_to_completion(&job.key).await;

        let next = f
            .scheduler
            .follow_up(
                f.tenant,
                &job.key,
                RunAttempt::Succeeded,
                f.clock.now() + Duration::hours(1),
                &StaticGoals(false),
            )
            .await
            .unwrap()
            .expect("follow-up scheduled");

        assert_eq!(RequeryParams::from_job(&next).unwrap().remaining_attempts, 2);
        assert_eq!(next.scheduled_at, Some(f.clock.now() + Duration::hours(1)));
    }

    #[tokio::test]
    async fn infrastructure_failure_preserves_budget() {
        let f = fixture();
        let job = f
            .scheduler
            .schedule(f.request(3, Duration::minutes(5)))
            .await
            .unwrap();
        f.run_to_completion(&job.key).await;

        let next = f
            .scheduler
            .follow_up(
                f.tenant,
                &job.key,
                RunAttempt::InfrastructureFailure,
                f.clock.now() + Duration::hours(1),
                &StaticGoals(false),
            )
            .await
            .unwrap()
            .expect("follow-up scheduled");

        assert_eq!(RequeryParams::from_job(&next).unwrap().remaining_attempts, 3);
    }
}
