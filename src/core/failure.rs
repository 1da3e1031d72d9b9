//! Failure taxonomy for job processing
//!
//! Every step of the pipeline reports failure as a value. The queue layer
//! only looks at [`FailureKind`] to choose between acknowledging and
//! requeueing a delivery.

use std::fmt;

use thiserror::Error;

use crate::backend::BackendError;
use crate::cache::CacheError;
use crate::runner::RunError;

/// Classification of a job failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// Missing job fields or submission file
    Validation,
    /// Backend or object storage failure
    Dependency,
    /// Evaluation program failed, timed out, or printed no score
    Execution,
    /// Anything outside the handled paths
    Unexpected,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FailureKind::Validation => "validation",
            FailureKind::Dependency => "dependency",
            FailureKind::Execution => "execution",
            FailureKind::Unexpected => "unexpected",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Error)]
pub enum JobError {
    #[error("invalid job: {0}")]
    Validation(String),
    #[error(transparent)]
    Cache(#[from] CacheError),
    #[error("failed to create submission: {0}")]
    Submission(#[source] BackendError),
    #[error(transparent)]
    Evaluation(#[from] RunError),
    #[error("unexpected error: {0}")]
    Unexpected(String),
}

impl JobError {
    pub fn kind(&self) -> FailureKind {
        match self {
            JobError::Validation(_) => FailureKind::Validation,
            JobError::Cache(_) | JobError::Submission(_) => FailureKind::Dependency,
            JobError::Evaluation(_) => FailureKind::Execution,
            JobError::Unexpected(_) => FailureKind::Unexpected,
        }
    }

    /// Whether the failure went through a handled path
    pub fn is_handled(&self) -> bool {
        self.kind() != FailureKind::Unexpected
    }
}

/// What the consumer tells the broker about a delivery
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Remove the message from the queue
    Ack,
    /// Negatively acknowledge and put the message back on the queue
    Requeue,
}

impl Disposition {
    /// Handled failures are terminal for a message; only unexpected ones requeue.
    pub fn for_result<T>(result: &Result<T, JobError>) -> Self {
        match result {
            Ok(_) => Disposition::Ack,
            Err(e) if e.is_handled() => Disposition::Ack,
            Err(_) => Disposition::Requeue,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_kind_mapping() {
        assert_eq!(
            JobError::Validation("missing filePath".into()).kind(),
            FailureKind::Validation
        );
        assert_eq!(
            JobError::Evaluation(RunError::TimedOut(Duration::from_secs(300))).kind(),
            FailureKind::Execution
        );
        assert_eq!(
            JobError::Submission(BackendError::MissingField("downloadUrl")).kind(),
            FailureKind::Dependency
        );
        assert_eq!(
            JobError::Unexpected("panic".into()).kind(),
            FailureKind::Unexpected
        );
    }

    #[test]
    fn test_disposition_for_result() {
        let ok: Result<(), JobError> = Ok(());
        assert_eq!(Disposition::for_result(&ok), Disposition::Ack);

        let handled: Result<(), JobError> =
            Err(JobError::Evaluation(RunError::EmptyOutput));
        assert_eq!(Disposition::for_result(&handled), Disposition::Ack);

        let unexpected: Result<(), JobError> = Err(JobError::Unexpected("boom".into()));
        assert_eq!(Disposition::for_result(&unexpected), Disposition::Requeue);
    }

    #[test]
    fn test_failure_kind_display() {
        assert_eq!(FailureKind::Validation.to_string(), "validation");
        assert_eq!(FailureKind::Unexpected.to_string(), "unexpected");
    }
}
