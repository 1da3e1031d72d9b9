//! Runner module - evaluation program execution
//!
//! - `TrustedRunner`: spawns an instructor-supplied program directly under a
//!   wall-clock timeout and captures its output
//! - `EvaluationRunner`: runs the evaluator against a submission and turns
//!   the captured output into a score
//!
//! The runner module does NOT download evaluators or talk to the backend.

pub mod trusted;

use std::path::Path;
use std::time::Duration;

use thiserror::Error;
use tracing::{error, info};

use crate::core::utils::preview;

pub use trusted::TrustedRunner;

#[derive(Debug, Error)]
pub enum RunError {
    #[error("failed to start {path}: {source}")]
    Spawn {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to wait for evaluation program: {0}")]
    Wait(#[source] std::io::Error),
    #[error("evaluation timed out after {}s", .0.as_secs())]
    TimedOut(Duration),
    #[error("evaluation failed ({status})")]
    NonZeroExit { status: RunStatus },
    #[error("evaluation printed no output")]
    EmptyOutput,
    #[error("invalid score: {0:?}")]
    InvalidScore(String),
}

/// Execution status (raw, no score interpretation)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    /// Program exited normally with given exit code
    Exited(i32),
    /// Killed by signal
    Signaled(i32),
    /// Wall-clock limit reached, process group killed
    TimedOut,
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunStatus::Exited(code) => write!(f, "exit code: {}", code),
            RunStatus::Signaled(sig) => write!(f, "killed by signal {}", sig),
            RunStatus::TimedOut => write!(f, "timed out"),
        }
    }
}

/// Outcome of running a program
#[derive(Debug)]
pub struct RunOutcome {
    pub status: RunStatus,
    pub stdout: String,
    pub stderr: String,
    pub elapsed: Duration,
}

/// A successful evaluation
#[derive(Debug, Clone)]
pub struct Evaluation {
    pub score: f64,
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

/// Extract the score from the last line of standard output
pub fn parse_score(stdout: &str) -> Result<f64, RunError> {
    let last_line = stdout
        .trim()
        .lines()
        .next_back()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .ok_or(RunError::EmptyOutput)?;

    match last_line.parse::<f64>() {
        Ok(score) if score.is_finite() => Ok(score),
        _ => Err(RunError::InvalidScore(last_line.to_string())),
    }
}

/// Runs evaluation programs: `<evaluator> <submission file>`
pub struct EvaluationRunner {
    runner: TrustedRunner,
}

impl EvaluationRunner {
    pub fn new(timeout: Duration) -> Self {
        Self {
            runner: TrustedRunner::new(timeout),
        }
    }

    pub async fn run(&self, executable: &Path, submission: &Path) -> Result<Evaluation, RunError> {
        let outcome = self
            .runner
            .execute(executable, &[submission.as_os_str()])
            .await?;

        match outcome.status {
            RunStatus::Exited(0) => {}
            RunStatus::TimedOut => return Err(RunError::TimedOut(self.runner.timeout())),
            status => {
                error!("Evaluation failed ({})", status);
                error!("Output: {}", preview(&outcome.stdout));
                error!("Stderr: {}", preview(&outcome.stderr));
                return Err(RunError::NonZeroExit { status });
            }
        }

        let score = parse_score(&outcome.stdout).inspect_err(|e| {
            error!("{}; output: {}", e, preview(&outcome.stdout));
        })?;
        info!(
            "Evaluation finished in {}ms, score: {}",
            outcome.elapsed.as_millis(),
            score
        );

        Ok(Evaluation {
            score,
            exit_code: 0,
            stdout: outcome.stdout,
            stderr: outcome.stderr,
        })
    }
}
