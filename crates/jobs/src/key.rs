//! Job identity shapes.
//!
//! The engine is generic over how a job row is addressed. Two shapes exist in
//! production: a surrogate id, and a composite business key for workflow-style
//! jobs. Everything else (state machine, counters, lifecycle) is shared.

use serde::{Deserialize, Serialize};

use crosswalk_core::{FacilityId, JobId, RequestId, SubjectId};

/// Identity of a job row, scoped by tenant at every store call.
pub trait JobKey:
    Clone
    + Eq
    + core::hash::Hash
    + core::fmt::Debug
    + core::fmt::Display
    + Send
    + Sync
    + 'static
{
}

/// Surrogate-keyed jobs address rows by `JobId`.
impl JobKey for JobId {}

/// Composite business key for workflow jobs.
///
/// Identifies one workflow instance per subject (and optional facility) and
/// external request, without a surrogate id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WorkflowKey {
    pub subject_id: SubjectId,
    pub facility_id: Option<FacilityId>,
    pub workflow_kind: String,
    pub request_id: RequestId,
}

impl WorkflowKey {
    pub fn new(
        subject_id: SubjectId,
        workflow_kind: impl Into<String>,
        request_id: RequestId,
    ) -> Self {
        Self {
            subject_id,
            facility_id: None,
            workflow_kind: workflow_kind.into(),
            request_id,
        }
    }

    pub fn with_facility(mut self, facility_id: FacilityId) -> Self {
        self.facility_id = Some(facility_id);
        self
    }
}

impl core::fmt::Display for WorkflowKey {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self.facility_id {
            Some(facility) => write!(
                f,
                "{}/{}@{}/{}",
                self.workflow_kind, self.subject_id, facility, self.request_id
            ),
            None => write!(
                f,
                "{}/{}/{}",
                self.workflow_kind, self.subject_id, self.request_id
            ),
        }
    }
}

impl JobKey for WorkflowKey {}
