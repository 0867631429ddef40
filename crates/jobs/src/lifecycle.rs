//! Job lifecycle orchestration.
//!
//! Create / initialize / complete / fail / cancel, with idempotent lifecycle
//! stamps and an exactly-once terminal hook. The manager is storage-agnostic:
//! the winning-writer guarantee comes from the store's compare-and-set
//! transition, not from any lock held here.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use tracing::{debug, error, info};

use crosswalk_core::{Clock, JobGroupId, SubjectId, SystemClock, TenantId};

use crate::job::{Job, JobStats, NewJob};
use crate::key::JobKey;
use crate::status::JobStatus;
use crate::store::{JobStore, JobStoreError, TransitionRequest};

/// Hook invoked exactly once, synchronously, on the first entry into a
/// terminal status. Runs on the winning caller's thread of control.
pub type TerminalHook<K> = Arc<dyn Fn(&Job<K>) -> anyhow::Result<()> + Send + Sync>;

/// Options for a terminal transition.
pub struct TerminalOptions<K> {
    pub reason: Option<String>,
    /// Trusted bypass of transition validation. Dangerous; never expose to
    /// untrusted callers.
    pub force: bool,
    pub on_terminal: Option<TerminalHook<K>>,
}

impl<K> Default for TerminalOptions<K> {
    fn default() -> Self {
        Self {
            reason: None,
            force: false,
            on_terminal: None,
        }
    }
}

impl<K> TerminalOptions<K> {
    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    pub fn forced(mut self) -> Self {
        self.force = true;
        self
    }

    pub fn with_hook(mut self, hook: TerminalHook<K>) -> Self {
        self.on_terminal = Some(hook);
        self
    }
}

impl<K> Clone for TerminalOptions<K> {
    fn clone(&self) -> Self {
        Self {
            reason: self.reason.clone(),
            force: self.force,
            on_terminal: self.on_terminal.clone(),
        }
    }
}

/// Orchestrates job lifecycle transitions over a [`JobStore`].
pub struct JobLifecycleManager<S> {
    store: Arc<S>,
    clock: Arc<dyn Clock>,
}

impl<S> Clone for JobLifecycleManager<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            clock: Arc::clone(&self.clock),
        }
    }
}

impl<S> JobLifecycleManager<S> {
    pub fn new(store: Arc<S>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    pub fn with_system_clock(store: Arc<S>) -> Self {
        Self::new(store, Arc::new(SystemClock))
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn clock(&self) -> &dyn Clock {
        &*self.clock
    }

    /// Persist a new job in `Waiting`.
    ///
    /// With `limited_to_one_running_job`, creation is refused with `Conflict`
    /// (naming the conflicting job) while any job of the same
    /// (tenant, subject, type, group) is still active.
    pub async fn create<K: JobKey>(
        &self,
        new_job: NewJob<K>,
        limited_to_one_running_job: bool,
    ) -> Result<Job<K>, JobStoreError>
    where
        S: JobStore<K>,
    {
        if limited_to_one_running_job {
            let active = self
                .store
                .find_group(
                    new_job.tenant_id,
                    new_job.subject_id,
                    &new_job.job_type,
                    new_job.job_group,
                    &[JobStatus::Waiting, JobStatus::Processing],
                )
                .await?;
            if let Some(existing) = active.first() {
                return Err(JobStoreError::Conflict(format!(
                    "an active job already exists in group {}: {}",
                    new_job.job_group, existing.key
                )));
            }
        }

        let job = new_job.into_job(self.clock.now());
        let job = self.store.insert(job).await?;
        info!(job = %job.key, tenant = %job.tenant_id, job_type = %job.job_type, "job created");
        Ok(job)
    }

    /// Transition to `Processing`, stamping `started_at` on first entry.
    pub async fn initialize<K: JobKey>(
        &self,
        tenant_id: TenantId,
        key: &K,
        force: bool,
    ) -> Result<Job<K>, JobStoreError>
    where
        S: JobStore<K>,
    {
        let mut request = TransitionRequest::new(JobStatus::Processing, self.clock.now());
        if force {
            request = request.forced();
        }
        let outcome = self.store.apply_transition(tenant_id, key, request).await?;
        debug!(job = %outcome.job.key, "job initialized");
        Ok(outcome.job)
    }

    /// Terminal transition to `Completed`.
    pub async fn complete<K: JobKey>(
        &self,
        tenant_id: TenantId,
        key: &K,
        options: TerminalOptions<K>,
    ) -> Result<Job<K>, JobStoreError>
    where
        S: JobStore<K>,
    {
        self.terminal(tenant_id, key, JobStatus::Completed, options)
            .await
    }

    /// Terminal transition to `Failed`.
    pub async fn fail<K: JobKey>(
        &self,
        tenant_id: TenantId,
        key: &K,
        options: TerminalOptions<K>,
    ) -> Result<Job<K>, JobStoreError>
    where
        S: JobStore<K>,
    {
        self.terminal(tenant_id, key, JobStatus::Failed, options)
            .await
    }

    /// Terminal transition to `Cancelled`.
    pub async fn cancel<K: JobKey>(
        &self,
        tenant_id: TenantId,
        key: &K,
        options: TerminalOptions<K>,
    ) -> Result<Job<K>, JobStoreError>
    where
        S: JobStore<K>,
    {
        self.terminal(tenant_id, key, JobStatus::Cancelled, options)
            .await
    }

    async fn terminal<K: JobKey>(
        &self,
        tenant_id: TenantId,
        key: &K,
        to: JobStatus,
        options: TerminalOptions<K>,
    ) -> Result<Job<K>, JobStoreError>
    where
        S: JobStore<K>,
    {
        let mut request = TransitionRequest::new(to, self.clock.now());
        if let Some(reason) = options.reason {
            request = request.with_reason(reason);
        }
        if options.force {
            request = request.forced();
        }

        let outcome = self.store.apply_transition(tenant_id, key, request).await?;
        if outcome.entered {
            info!(job = %outcome.job.key, status = %to, "job reached terminal status");
            if let Some(hook) = &options.on_terminal {
                fire_terminal_hook(&outcome.job, hook);
            }
        } else {
            debug!(job = %outcome.job.key, status = %to, "terminal status re-applied; no-op");
        }
        Ok(outcome.job)
    }

    /// Fetch one job.
    pub async fn get<K: JobKey>(
        &self,
        tenant_id: TenantId,
        key: &K,
    ) -> Result<Job<K>, JobStoreError>
    where
        S: JobStore<K>,
    {
        self.store.get(tenant_id, key).await
    }

    /// Size (or re-size) the job; see [`JobStore::set_total`].
    pub async fn set_total<K: JobKey>(
        &self,
        tenant_id: TenantId,
        key: &K,
        total: u32,
        force: bool,
    ) -> Result<Job<K>, JobStoreError>
    where
        S: JobStore<K>,
    {
        self.store
            .set_total(tenant_id, key, total, force, self.clock.now())
            .await
    }

    /// Replace the opaque runtime scratch space whole.
    pub async fn replace_runtime_data<K: JobKey>(
        &self,
        tenant_id: TenantId,
        key: &K,
        data: serde_json::Value,
    ) -> Result<Job<K>, JobStoreError>
    where
        S: JobStore<K>,
    {
        self.store
            .replace_runtime_data(tenant_id, key, data, self.clock.now())
            .await
    }

    /// Most recently created job in a group, optionally filtered by status.
    pub async fn find_latest<K: JobKey>(
        &self,
        tenant_id: TenantId,
        subject_id: SubjectId,
        job_type: &str,
        job_group: JobGroupId,
        statuses: Option<&[JobStatus]>,
    ) -> Result<Option<Job<K>>, JobStoreError>
    where
        S: JobStore<K>,
    {
        self.store
            .find_latest(tenant_id, subject_id, job_type, job_group, statuses)
            .await
    }

    /// Per-status job counts for one tenant.
    pub async fn stats<K: JobKey>(&self, tenant_id: TenantId) -> Result<JobStats, JobStoreError>
    where
        S: JobStore<K>,
    {
        JobStore::<K>::stats(&*self.store, tenant_id).await
    }
}

/// Run a terminal hook behind an explicit error boundary.
///
/// The status write is already durable by the time the hook runs; a failing
/// or panicking hook is reported on the observability channel and never
/// surfaces on the transition's own error path.
fn fire_terminal_hook<K: JobKey>(job: &Job<K>, hook: &TerminalHook<K>) {
    match catch_unwind(AssertUnwindSafe(|| hook(job))) {
        Ok(Ok(())) => {}
        Ok(Err(err)) => {
            error!(job = %job.key, status = %job.status, error = %err, "terminal hook failed");
        }
        Err(_) => {
            error!(job = %job.key, status = %job.status, "terminal hook panicked");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use chrono::{Duration, Utc};

    use crosswalk_core::{FixedClock, JobId, RequestId};

    use crate::memory::InMemoryJobStore;

    type Store = InMemoryJobStore<JobId>;

    fn manager() -> (JobLifecycleManager<Store>, Arc<FixedClock>) {
        let clock = Arc::new(FixedClock::new(Utc::now()));
        let manager = JobLifecycleManager::new(Store::arc(), clock.clone());
        (manager, clock)
    }

    fn new_job(tenant: TenantId) -> NewJob<JobId> {
        NewJob::new(
            JobId::new(),
            tenant,
            SubjectId::new(),
            "network_requery",
            JobGroupId::new(),
            RequestId::new(),
        )
    }

    #[tokio::test]
    async fn create_then_initialize_stamps_started_at() {
        let (manager, clock) = manager();
        let tenant = TenantId::new();
        let job = manager.create(new_job(tenant), false).await.unwrap();
        assert_eq!(job.status, JobStatus::Waiting);
        assert_eq!(job.created_at, clock.now());

        clock.advance(Duration::seconds(10));
        let job = manager.initialize(tenant, &job.key, false).await.unwrap();
        assert_eq!(job.status, JobStatus::Processing);
        assert_eq!(job.started_at, Some(clock.now()));

        // A second initialize is not a declared edge.
        assert!(matches!(
            manager.initialize(tenant, &job.key, false).await,
            Err(JobStoreError::InvalidTransition(_))
        ));
    }

    #[tokio::test]
    async fn one_running_job_guard_names_the_conflicting_job() {
        let (manager, _) = manager();
        let tenant = TenantId::new();
        let template = new_job(tenant);

        let first = manager.create(template.clone(), true).await.unwrap();

        let mut second = template;
        second.key = JobId::new();
        second.request_id = RequestId::new();
        let err = manager.create(second, true).await.unwrap_err();
        match err {
            JobStoreError::Conflict(msg) => assert!(msg.contains(&first.key.to_string())),
            other => panic!("expected Conflict, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn complete_is_idempotent_and_fires_hook_once() {
        let (manager, clock) = manager();
        let tenant = TenantId::new();
        let job = manager.create(new_job(tenant), false).await.unwrap();
        manager.initialize(tenant, &job.key, false).await.unwrap();

        let fired = Arc::new(AtomicUsize::new(0));
        let hook: TerminalHook<JobId> = {
            let fired = fired.clone();
            Arc::new(move |_job| {
                fired.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
        };

        let first_finish = clock.now();
        let completed = manager
            .complete(
                tenant,
                &job.key,
                TerminalOptions::default().with_hook(hook.clone()),
            )
            .await
            .unwrap();
        assert_eq!(completed.finished_at, Some(first_finish));

        clock.advance(Duration::minutes(1));
        let again = manager
            .complete(
                tenant,
                &job.key,
                TerminalOptions::default().with_hook(hook),
            )
            .await
            .unwrap();

        assert_eq!(again.finished_at, Some(first_finish));
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failing_hook_does_not_disturb_the_transition() {
        let (manager, _) = manager();
        let tenant = TenantId::new();
        let job = manager.create(new_job(tenant), false).await.unwrap();
        manager.initialize(tenant, &job.key, false).await.unwrap();

        let hook: TerminalHook<JobId> =
            Arc::new(|_job| Err(anyhow::anyhow!("downstream notification refused")));
        let failed = manager
            .fail(
                tenant,
                &job.key,
                TerminalOptions::default()
                    .with_reason("partner system unreachable")
                    .with_hook(hook),
            )
            .await
            .unwrap();

        assert_eq!(failed.status, JobStatus::Failed);
        assert_eq!(
            failed.status_reason.as_deref(),
            Some("partner system unreachable")
        );
        assert!(failed.failed_at.is_some());
    }

    #[tokio::test]
    async fn panicking_hook_does_not_disturb_the_transition() {
        let (manager, _) = manager();
        let tenant = TenantId::new();
        let job = manager.create(new_job(tenant), false).await.unwrap();

        let hook: TerminalHook<JobId> = Arc::new(|_job| panic!("hook exploded"));
        let cancelled = manager
            .cancel(tenant, &job.key, TerminalOptions::default().with_hook(hook))
            .await
            .unwrap();

        assert_eq!(cancelled.status, JobStatus::Cancelled);
        let stored = manager.get(tenant, &job.key).await.unwrap();
        assert_eq!(stored.status, JobStatus::Cancelled);
    }

    #[tokio::test]
    async fn cancelled_job_rejects_completion() {
        let (manager, _) = manager();
        let tenant = TenantId::new();
        let job = manager.create(new_job(tenant), false).await.unwrap();
        manager
            .cancel(tenant, &job.key, TerminalOptions::default())
            .await
            .unwrap();

        assert!(matches!(
            manager
                .complete(tenant, &job.key, TerminalOptions::default())
                .await,
            Err(JobStoreError::InvalidTransition(_))
        ));

        // Unless a trusted caller forces it.
        let forced = manager
            .complete(tenant, &job.key, TerminalOptions::default().forced())
            .await
            .unwrap();
        assert_eq!(forced.status, JobStatus::Completed);
    }

    #[tokio::test]
    async fn unknown_job_is_not_found() {
        let (manager, _) = manager();
        let tenant = TenantId::new();
        assert!(matches!(
            manager.get(tenant, &JobId::new()).await,
            Err(JobStoreError::NotFound { .. })
        ));
    }
}
