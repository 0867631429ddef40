//! Persistence abstraction for jobs.
//!
//! Correctness under concurrent, multi-process writers lives here: the
//! outcome increment and the status transition are each one atomic
//! read-modify-write at the storage layer, never an application-level
//! read-then-write. Implementations: [`crate::memory::InMemoryJobStore`]
//! (dev/tests) and the Postgres store in `crosswalk-infra`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use crosswalk_core::{JobGroupId, SubjectId, TenantId};

use crate::job::{Job, JobStats, Outcome, ProgressSnapshot};
use crate::key::JobKey;
use crate::status::{InvalidTransition, JobStatus};

/// Error produced by job store operations.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum JobStoreError {
    /// No job for the given tenant + identity.
    #[error("job not found: tenant {tenant_id}, key {key}")]
    NotFound { tenant_id: TenantId, key: String },

    /// Requested status unreachable from the current one.
    #[error(transparent)]
    InvalidTransition(#[from] InvalidTransition),

    /// Creation blocked by an existing active job, or a refused total reset.
    #[error("conflict: {0}")]
    Conflict(String),

    /// An atomic update affected no row it should have: a storage defect,
    /// not a business outcome. Surfaced to the observability channel by
    /// callers, never silently swallowed.
    #[error("integrity failure: {0}")]
    IntegrityFailure(String),

    /// Payload (de)serialization failed.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Underlying storage failed (pool, network, SQL).
    #[error("storage error: {0}")]
    Storage(String),
}

impl JobStoreError {
    pub fn not_found<K: JobKey>(tenant_id: TenantId, key: &K) -> Self {
        Self::NotFound {
            tenant_id,
            key: key.to_string(),
        }
    }
}

/// A requested status change, stamped by the caller's clock.
#[derive(Debug, Clone)]
pub struct TransitionRequest {
    pub to: JobStatus,
    pub reason: Option<String>,
    /// Timestamp to stamp on first entry (injected for determinism).
    pub at: DateTime<Utc>,
    /// Trusted bypass of edge validation. Dangerous; internal tooling only.
    pub force: bool,
}

impl TransitionRequest {
    pub fn new(to: JobStatus, at: DateTime<Utc>) -> Self {
        Self {
            to,
            reason: None,
            at,
            force: false,
        }
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    pub fn forced(mut self) -> Self {
        self.force = true;
        self
    }
}

/// Result of applying a transition.
#[derive(Debug, Clone)]
pub struct TransitionOutcome<K> {
    pub job: Job<K>,
    /// True only when this call entered the status for the first time:
    /// the winning writer under concurrency, and the only caller that may
    /// fire a terminal hook.
    pub entered: bool,
}

/// Tenant-scoped job persistence.
///
/// Implementations must:
/// - include the tenant in every lookup and update predicate
/// - make `report_outcome` a single atomic increment-and-return
/// - make `apply_transition` a compare-and-set against the legal source
///   statuses, so exactly one of several racing writers observes `entered`
#[async_trait]
pub trait JobStore<K: JobKey>: Send + Sync {
    /// Persist a new job row.
    async fn insert(&self, job: Job<K>) -> Result<Job<K>, JobStoreError>;

    /// Fetch one job.
    async fn get(&self, tenant_id: TenantId, key: &K) -> Result<Job<K>, JobStoreError>;

    /// Atomically apply a status transition (see [`TransitionOutcome`]).
    async fn apply_transition(
        &self,
        tenant_id: TenantId,
        key: &K,
        request: TransitionRequest,
    ) -> Result<TransitionOutcome<K>, JobStoreError>;

    /// Atomically count one outcome and return the resulting counter view.
    ///
    /// Late reports (terminal or exhausted job) return the unchanged row
    /// with `counted == false`.
    async fn report_outcome(
        &self,
        tenant_id: TenantId,
        key: &K,
        outcome: Outcome,
        at: DateTime<Utc>,
    ) -> Result<ProgressSnapshot, JobStoreError>;

    /// Size (or re-size) the job, resetting both counters to zero.
    ///
    /// Rejected with `Conflict` when the job is already sized (`total > 0`)
    /// and still active, unless `force` is set.
    async fn set_total(
        &self,
        tenant_id: TenantId,
        key: &K,
        total: u32,
        force: bool,
        at: DateTime<Utc>,
    ) -> Result<Job<K>, JobStoreError>;

    /// Replace the opaque runtime scratch space whole.
    async fn replace_runtime_data(
        &self,
        tenant_id: TenantId,
        key: &K,
        data: serde_json::Value,
        at: DateTime<Utc>,
    ) -> Result<Job<K>, JobStoreError>;

    /// All jobs in a group matching one of `statuses`, oldest first.
    async fn find_group(
        &self,
        tenant_id: TenantId,
        subject_id: SubjectId,
        job_type: &str,
        job_group: JobGroupId,
        statuses: &[JobStatus],
    ) -> Result<Vec<Job<K>>, JobStoreError>;

    /// Most recently created job in a group, optionally filtered by status.
    async fn find_latest(
        &self,
        tenant_id: TenantId,
        subject_id: SubjectId,
        job_type: &str,
        job_group: JobGroupId,
        statuses: Option<&[JobStatus]>,
    ) -> Result<Option<Job<K>>, JobStoreError>;

    /// Per-status job counts for one tenant.
    async fn stats(&self, tenant_id: TenantId) -> Result<JobStats, JobStoreError>;
}
