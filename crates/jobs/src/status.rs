//! Job status state machine.
//!
//! One closed enum and one transition table, the single source of truth for
//! which lifecycle edges are legal. Callers holding a trusted force flag may
//! bypass validation entirely (admin tooling only).

use core::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Lifecycle status of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Created, not yet picked up.
    Waiting,
    /// Actively being worked on.
    Processing,
    /// All work accounted for.
    Completed,
    /// Terminated with an error.
    Failed,
    /// Terminated by caller or dedup.
    Cancelled,
}

/// A transition rejected by the state machine.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("invalid status transition: {from} -> {to}")]
pub struct InvalidTransition {
    pub from: JobStatus,
    pub to: JobStatus,
}

impl JobStatus {
    /// Terminal statuses accept no further transitions (except idempotent
    /// re-application of themselves).
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }

    /// A job in an active status still accepts progress reports.
    pub fn is_active(&self) -> bool {
        matches!(self, JobStatus::Waiting | JobStatus::Processing)
    }

    /// Stable string form used in storage and logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Waiting => "waiting",
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }

    /// Every status value, in declaration order.
    pub const ALL: [JobStatus; 5] = [
        JobStatus::Waiting,
        JobStatus::Processing,
        JobStatus::Completed,
        JobStatus::Failed,
        JobStatus::Cancelled,
    ];

    /// Statuses a legal (unforced) transition into `self` may start from.
    ///
    /// `Waiting` is the initial status; nothing transitions into it.
    pub fn legal_sources(&self) -> &'static [JobStatus] {
        match self {
            JobStatus::Waiting => &[],
            JobStatus::Processing => &[JobStatus::Waiting],
            JobStatus::Completed => &[JobStatus::Processing],
            // A scheduled job can fail before it ever starts (submission to
            // the partner system rejected), so Waiting -> Failed is legal.
            JobStatus::Failed => &[JobStatus::Waiting, JobStatus::Processing],
            // Waiting -> Cancelled is how dedup retires a not-yet-run retry.
            JobStatus::Cancelled => &[JobStatus::Waiting, JobStatus::Processing],
        }
    }
}

impl core::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "waiting" => Ok(JobStatus::Waiting),
            "processing" => Ok(JobStatus::Processing),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            "cancelled" => Ok(JobStatus::Cancelled),
            other => Err(format!("unknown job status: {other}")),
        }
    }
}

/// Validate a requested status transition.
///
/// Returns the requested status when the edge is legal. Re-applying a
/// terminal status to itself is accepted (callers treat it as a no-op rather
/// than an entry). Everything else is rejected; a trusted force flag at the
/// call site skips this function entirely.
pub fn validate(current: JobStatus, requested: JobStatus) -> Result<JobStatus, InvalidTransition> {
    if current == requested && current.is_terminal() {
        return Ok(requested);
    }
    if requested.legal_sources().contains(&current) {
        return Ok(requested);
    }
    Err(InvalidTransition {
        from: current,
        to: requested,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn legal_edges() -> Vec<(JobStatus, JobStatus)> {
        use JobStatus::*;
        vec![
            (Waiting, Processing),
            (Waiting, Cancelled),
            (Waiting, Failed),
            (Processing, Completed),
            (Processing, Failed),
            (Processing, Cancelled),
            // Idempotent terminal re-application.
            (Completed, Completed),
            (Failed, Failed),
            (Cancelled, Cancelled),
        ]
    }

    #[test]
    fn accepts_every_declared_edge() {
        for (from, to) in legal_edges() {
            assert_eq!(validate(from, to), Ok(to), "{from} -> {to}");
        }
    }

    #[test]
    fn rejects_everything_else() {
        let legal = legal_edges();
        for from in JobStatus::ALL {
            for to in JobStatus::ALL {
                if legal.contains(&(from, to)) {
                    continue;
                }
                assert_eq!(
                    validate(from, to),
                    Err(InvalidTransition { from, to }),
                    "{from} -> {to} should be rejected"
                );
            }
        }
    }

    #[test]
    fn terminal_statuses_are_sticky() {
        for terminal in [JobStatus::Completed, JobStatus::Failed, JobStatus::Cancelled] {
            assert!(terminal.is_terminal());
            for to in JobStatus::ALL {
                if to == terminal {
                    continue;
                }
                assert!(validate(terminal, to).is_err());
            }
        }
    }

    fn arb_status() -> impl Strategy<Value = JobStatus> {
        prop::sample::select(JobStatus::ALL.to_vec())
    }

    proptest! {
        /// The table and the predicates agree: an accepted transition either
        /// lands on a declared edge or re-applies a terminal status.
        #[test]
        fn validate_matches_table(from in arb_status(), to in arb_status()) {
            let accepted = validate(from, to).is_ok();
            let declared = to.legal_sources().contains(&from)
                || (from == to && from.is_terminal());
            prop_assert_eq!(accepted, declared);
        }

        /// Round-trips through the storage string form.
        #[test]
        fn as_str_round_trips(status in arb_status()) {
            prop_assert_eq!(status.as_str().parse::<JobStatus>(), Ok(status));
        }
    }
}
