//! Typed error hierarchy for the G3 engine.
//!
//! - `StageError`: failures reported by an external stage call
//! - `StoreError`: invariant violations rejected by the job/artifact store
//! - `JobError`: the reason the orchestrator stopped driving a job
//! - `InvalidRequest`: a submission rejected before any job exists
//!
//! A failing validation is not an error. It is recorded as a failing
//! `ValidationResult` and drives the repair loop.

use std::time::Duration;

use thiserror::Error;
use uuid::Uuid;

use crate::engine::models::JobStatus;

/// Errors returned by contract, generation, repair and sandbox calls.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StageError {
    #[error("transient stage failure: {0}")]
    Transient(String),

    #[error("stage call timed out after {0:?}")]
    Timeout(Duration),

    #[error("contract violation: {0}")]
    ContractViolation(String),

    #[error("stage failed: {0}")]
    Fatal(String),
}

impl StageError {
    /// Transient failures and timeouts are retried at the same round.
    pub fn is_retryable(&self) -> bool {
        matches!(self, StageError::Transient(_) | StageError::Timeout(_))
    }
}

/// Invariant violations detected by the store.
///
/// Database methods return `anyhow::Result`; these are wrapped into the
/// `anyhow::Error` so callers can `downcast_ref::<StoreError>()`.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("Job {0} not found")]
    JobNotFound(Uuid),

    #[error("Artifact {0} not found")]
    ArtifactNotFound(Uuid),

    #[error("Status conflict on job {job_id}: expected {expected}, found {actual}")]
    StatusConflict {
        job_id: Uuid,
        expected: JobStatus,
        actual: JobStatus,
    },

    /// A non-terminal write was refused because cancellation was recorded
    /// before it could commit.
    #[error("Cancellation requested for job {0}")]
    CancelRequested(Uuid),

    #[error("Invalid transition {from} -> {to}")]
    InvalidTransition { from: JobStatus, to: JobStatus },

    #[error("Contract for job {0} is locked")]
    ContractLocked(Uuid),

    #[error("Round for job {job_id} cannot move from {current} to {requested}")]
    RoundRegression {
        job_id: Uuid,
        current: u32,
        requested: u32,
    },

    #[error("Round {requested} exceeds max rounds {max_rounds} for job {job_id}")]
    RoundBudget {
        job_id: Uuid,
        requested: u32,
        max_rounds: u32,
    },

    #[error("Artifact {0} has already been superseded")]
    SupersededParent(Uuid),
}

/// A submission the orchestrator refuses to create a job for.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("invalid request: {0}")]
pub struct InvalidRequest(pub String);

/// Why the orchestrator stopped driving a job.
#[derive(Debug, Error)]
pub enum JobError {
    #[error("contract violation: {0}")]
    ContractViolation(String),

    #[error("round budget of {rounds} exceeded; still failing: {summary}")]
    RoundBudgetExceeded { rounds: u32, summary: String },

    #[error("{stage} stage failed: {source}")]
    StageFailed {
        stage: &'static str,
        #[source]
        source: StageError,
    },

    #[error("job exceeded its wall-clock budget")]
    TimedOut,

    #[error("job cancelled")]
    Cancelled,

    #[error("status changed underneath the orchestrator: expected {expected}, found {actual}")]
    StatusConflict {
        expected: JobStatus,
        actual: JobStatus,
    },

    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

impl JobError {
    /// Terminal status this error drives the job into, or `None` when the
    /// orchestrator must not write anything (another writer won the race).
    pub fn terminal_status(&self) -> Option<JobStatus> {
        match self {
            JobError::ContractViolation(_)
            | JobError::RoundBudgetExceeded { .. }
            | JobError::StageFailed { .. }
            | JobError::Store(_) => Some(JobStatus::Failed),
            JobError::TimedOut => Some(JobStatus::TimedOut),
            JobError::Cancelled => Some(JobStatus::Cancelled),
            JobError::StatusConflict { .. } => None,
        }
    }

    /// Map a stage failure onto the job-level error taxonomy.
    pub fn from_stage(stage: &'static str, err: StageError) -> Self {
        match err {
            StageError::ContractViolation(msg) => JobError::ContractViolation(msg),
            other => JobError::StageFailed {
                stage,
                source: other,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stage_error_retryable_classification() {
        assert!(StageError::Transient("connection reset".into()).is_retryable());
        assert!(StageError::Timeout(Duration::from_secs(5)).is_retryable());
        assert!(!StageError::ContractViolation("missing unit".into()).is_retryable());
        assert!(!StageError::Fatal("bad request".into()).is_retryable());
    }

    #[test]
    fn stage_error_timeout_message_includes_duration() {
        let err = StageError::Timeout(Duration::from_secs(30));
        assert!(err.to_string().contains("30s"));
    }

    #[test]
    fn store_error_status_conflict_is_matchable_through_anyhow() {
        let id = Uuid::new_v4();
        let err: anyhow::Error = StoreError::StatusConflict {
            job_id: id,
            expected: JobStatus::Validating,
            actual: JobStatus::TimedOut,
        }
        .into();
        match err.downcast_ref::<StoreError>() {
            Some(StoreError::StatusConflict { actual, .. }) => {
                assert_eq!(*actual, JobStatus::TimedOut)
            }
            other => panic!("Expected StatusConflict, got {:?}", other),
        }
    }

    #[test]
    fn job_error_terminal_status_mapping() {
        assert_eq!(
            JobError::ContractViolation("x".into()).terminal_status(),
            Some(JobStatus::Failed)
        );
        assert_eq!(
            JobError::RoundBudgetExceeded {
                rounds: 2,
                summary: "src/A.java".into()
            }
            .terminal_status(),
            Some(JobStatus::Failed)
        );
        assert_eq!(JobError::TimedOut.terminal_status(), Some(JobStatus::TimedOut));
        assert_eq!(JobError::Cancelled.terminal_status(), Some(JobStatus::Cancelled));
        assert_eq!(
            JobError::StatusConflict {
                expected: JobStatus::Generating,
                actual: JobStatus::Cancelled
            }
            .terminal_status(),
            None
        );
        assert_eq!(
            JobError::Store(anyhow::anyhow!("no locked contract")).terminal_status(),
            Some(JobStatus::Failed)
        );
    }

    #[test]
    fn job_error_from_stage_keeps_contract_violation_distinct() {
        let err = JobError::from_stage("generation", StageError::ContractViolation("extra file".into()));
        assert!(matches!(err, JobError::ContractViolation(ref m) if m == "extra file"));

        let err = JobError::from_stage("sandbox", StageError::Timeout(Duration::from_secs(1)));
        match err {
            JobError::StageFailed { stage, source } => {
                assert_eq!(stage, "sandbox");
                assert!(source.is_retryable());
            }
            other => panic!("Expected StageFailed, got {:?}", other),
        }
    }

    #[test]
    fn round_budget_message_carries_summary() {
        let err = JobError::RoundBudgetExceeded {
            rounds: 3,
            summary: "src/main/java/UserService.java".into(),
        };
        let msg = err.to_string();
        assert!(msg.contains("3"));
        assert!(msg.contains("UserService.java"));
    }
}
