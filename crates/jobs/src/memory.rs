//! In-memory job store for tests and development.
//!
//! Every mutation runs inside one `RwLock` write critical section, which is
//! what makes the increment and the transition compare-and-set atomic for
//! in-process callers. The durable equivalent lives in `crosswalk-infra`.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crosswalk_core::{JobGroupId, SubjectId, TenantId};

use crate::job::{Job, JobStats, Outcome, ProgressSnapshot};
use crate::key::JobKey;
use crate::status::JobStatus;
use crate::store::{JobStore, JobStoreError, TransitionOutcome, TransitionRequest};

/// In-memory, tenant-scoped job store.
#[derive(Debug)]
pub struct InMemoryJobStore<K> {
    jobs: RwLock<HashMap<(TenantId, K), Job<K>>>,
}

impl<K: JobKey> InMemoryJobStore<K> {
    pub fn new() -> Self {
        Self {
            jobs: RwLock::new(HashMap::new()),
        }
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }
}

impl<K: JobKey> Default for InMemoryJobStore<K> {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl<K: JobKey> JobStore<K> for InMemoryJobStore<K> {
    async fn insert(&self, job: Job<K>) -> Result<Job<K>, JobStoreError> {
        let mut jobs = self.jobs.write().unwrap();
        let slot = (job.tenant_id, job.key.clone());
        if jobs.contains_key(&slot) {
            return Err(JobStoreError::Conflict(format!(
                "job already exists: {}",
                job.key
            )));
        }
        jobs.insert(slot, job.clone());
        Ok(job)
    }

    async fn get(&self, tenant_id: TenantId, key: &K) -> Result<Job<K>, JobStoreError> {
        let jobs = self.jobs.read().unwrap();
        jobs.get(&(tenant_id, key.clone()))
            .cloned()
            .ok_or_else(|| JobStoreError::not_found(tenant_id, key))
    }

    async fn apply_transition(
        &self,
        tenant_id: TenantId,
        key: &K,
        request: TransitionRequest,
    ) -> Result<TransitionOutcome<K>, JobStoreError> {
        let mut jobs = self.jobs.write().unwrap();
        let job = jobs
            .get_mut(&(tenant_id, key.clone()))
            .ok_or_else(|| JobStoreError::not_found(tenant_id, key))?;

        let entered = job.apply_transition(
            request.to,
            request.reason.as_deref(),
            request.at,
            request.force,
        )?;
        Ok(TransitionOutcome {
            job: job.clone(),
            entered,
        })
    }

    async fn report_outcome(
        &self,
        tenant_id: TenantId,
        key: &K,
        outcome: Outcome,
        at: DateTime<Utc>,
    ) -> Result<ProgressSnapshot, JobStoreError> {
        let mut jobs = self.jobs.write().unwrap();
        let job = jobs
            .get_mut(&(tenant_id, key.clone()))
            .ok_or_else(|| JobStoreError::not_found(tenant_id, key))?;

        let counted = job.record_outcome(outcome, at);
        Ok(job.snapshot(counted))
    }

    async fn set_total(
        &self,
        tenant_id: TenantId,
        key: &K,
        total: u32,
        force: bool,
        at: DateTime<Utc>,
    ) -> Result<Job<K>, JobStoreError> {
        let mut jobs = self.jobs.write().unwrap();
        let job = jobs
            .get_mut(&(tenant_id, key.clone()))
            .ok_or_else(|| JobStoreError::not_found(tenant_id, key))?;

        if job.total > 0 && job.status.is_active() && !force {
            return Err(JobStoreError::Conflict(format!(
                "job {} is active with total {} already set; refusing to invalidate in-flight counts",
                job.key, job.total
            )));
        }
        job.reset_total(total, at);
        Ok(job.clone())
    }

    async fn replace_runtime_data(
        &self,
        tenant_id: TenantId,
        key: &K,
        data: serde_json::Value,
        at: DateTime<Utc>,
    ) -> Result<Job<K>, JobStoreError> {
        let mut jobs = self.jobs.write().unwrap();
        let job = jobs
            .get_mut(&(tenant_id, key.clone()))
            .ok_or_else(|| JobStoreError::not_found(tenant_id, key))?;

        job.runtime_data = data;
        job.updated_at = at;
        Ok(job.clone())
    }

    async fn find_group(
        &self,
        tenant_id: TenantId,
        subject_id: SubjectId,
        job_type: &str,
        job_group: JobGroupId,
        statuses: &[JobStatus],
    ) -> Result<Vec<Job<K>>, JobStoreError> {
        let jobs = self.jobs.read().unwrap();
        let mut result: Vec<_> = jobs
            .values()
            .filter(|j| {
                j.tenant_id == tenant_id
                    && j.subject_id == subject_id
                    && j.job_type == job_type
                    && j.job_group == job_group
                    && statuses.contains(&j.status)
            })
            .cloned()
            .collect();

        result.sort_by_key(|j| j.created_at);
        Ok(result)
    }

    async fn find_latest(
        &self,
        tenant_id: TenantId,
        subject_id: SubjectId,
        job_type: &str,
        job_group: JobGroupId,
        statuses: Option<&[JobStatus]>,
    ) -> Result<Option<Job<K>>, JobStoreError> {
        let jobs = self.jobs.read().unwrap();
        let latest = jobs
            .values()
            .filter(|j| {
                j.tenant_id == tenant_id
                    && j.subject_id == subject_id
                    && j.job_type == job_type
                    && j.job_group == job_group
                    && statuses.map_or(true, |s| s.contains(&j.status))
            })
            .max_by_key(|j| j.created_at)
            .cloned();
        Ok(latest)
    }

    async fn stats(&self, tenant_id: TenantId) -> Result<JobStats, JobStoreError> {
        let jobs = self.jobs.read().unwrap();
        let mut stats = JobStats::default();
        for job in jobs.values() {
            if job.tenant_id == tenant_id {
                stats.count(job.status);
            }
        }
        Ok(stats)
    }
}
