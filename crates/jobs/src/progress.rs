//! Concurrency-safe progress reporting.
//!
//! Many workers report outcomes against the same job with no coordination
//! between them. Each report is one atomic storage increment; the caller
//! whose increment exhausts the counters drives completion through the
//! lifecycle manager, whose compare-and-set decides the single winner.

use tracing::debug;

use crosswalk_core::TenantId;

use crate::job::{Outcome, ProgressSnapshot};
use crate::key::JobKey;
use crate::lifecycle::{JobLifecycleManager, TerminalHook, TerminalOptions};
use crate::status::JobStatus;
use crate::store::{JobStore, JobStoreError};

/// Aggregates worker outcomes into a job's counters and completes the job
/// when every sub-unit is accounted for.
pub struct ProgressTracker<K, S> {
    lifecycle: JobLifecycleManager<S>,
    on_complete: Option<TerminalHook<K>>,
}

impl<K, S> Clone for ProgressTracker<K, S> {
    fn clone(&self) -> Self {
        Self {
            lifecycle: self.lifecycle.clone(),
            on_complete: self.on_complete.clone(),
        }
    }
}

impl<K: JobKey, S: JobStore<K>> ProgressTracker<K, S> {
    pub fn new(lifecycle: JobLifecycleManager<S>) -> Self {
        Self {
            lifecycle,
            on_complete: None,
        }
    }

    /// Hook fired exactly once when a report completes the job.
    pub fn with_completion_hook(mut self, hook: TerminalHook<K>) -> Self {
        self.on_complete = Some(hook);
        self
    }

    /// Count one outcome. If this report exhausts a sized job, drive the
    /// transition to `Completed`.
    ///
    /// Late reports against a terminal or already-exhausted job come back
    /// with `counted == false` and change nothing. Losing a completion race
    /// (another reporter or a concurrent cancel got there first) is not an
    /// error for the reporting worker.
    pub async fn report(
        &self,
        tenant_id: TenantId,
        key: &K,
        outcome: Outcome,
    ) -> Result<ProgressSnapshot, JobStoreError> {
        let at = self.lifecycle.clock().now();
        let snapshot = self
            .lifecycle
            .store()
            .report_outcome(tenant_id, key, outcome, at)
            .await?;

        if snapshot.counted && snapshot.is_exhausted() && snapshot.status != JobStatus::Completed {
            self.drive_completion(tenant_id, key, snapshot.status).await?;
        }
        Ok(snapshot)
    }

    async fn drive_completion(
        &self,
        tenant_id: TenantId,
        key: &K,
        observed: JobStatus,
    ) -> Result<(), JobStoreError> {
        // A job exhausted before anything initialized it still has to pass
        // through Processing; the store's transition guard resolves races.
        if observed == JobStatus::Waiting {
            match self.lifecycle.initialize(tenant_id, key, false).await {
                Ok(_) | Err(JobStoreError::InvalidTransition(_)) => {}
                Err(err) => return Err(err),
            }
        }

        let mut options = TerminalOptions::default();
        if let Some(hook) = &self.on_complete {
            options = options.with_hook(hook.clone());
        }
        match self.lifecycle.complete(tenant_id, key, options).await {
            Ok(_) => Ok(()),
            Err(JobStoreError::InvalidTransition(t)) => {
                debug!(job = %key, transition = %t, "lost completion race");
                Ok(())
            }
            Err(err) => Err(err),
        }
    }
}
