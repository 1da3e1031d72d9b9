//! Evaluation job processing
//!
//! Each step gates the next: validation, submission file check, evaluator
//! download, evaluation, attempt lookup, submission creation. Nothing is
//! recorded unless every earlier step succeeded.
//!
//! Attempt numbers are computed as read-then-write against the backend.
//! That is only sound while a single worker consumes the queue; running
//! several workers requires the backend to assign attempt numbers itself.

use std::path::Path;

use async_trait::async_trait;
use tracing::{debug, error, info};

use crate::backend::{BackendClient, BackendError, NewSubmission};
use crate::cache::BinaryCache;
use crate::config::WorkerConfig;
use crate::core::utils::preview;
use crate::core::JobError;
use crate::jobs::JobMessage;
use crate::queue::JobHandler;
use crate::runner::EvaluationRunner;

pub struct JobProcessor {
    backend: BackendClient,
    cache: BinaryCache,
    runner: EvaluationRunner,
}

impl JobProcessor {
    pub fn new(backend: BackendClient, cache: BinaryCache, runner: EvaluationRunner) -> Self {
        Self {
            backend,
            cache,
            runner,
        }
    }

    pub fn from_config(config: &WorkerConfig) -> Result<Self, BackendError> {
        let backend = BackendClient::new(&config.backend)?;
        let cache = BinaryCache::new(backend.clone(), &config.cache_dir, config.line_endings);
        let runner = EvaluationRunner::new(config.eval_timeout);
        Ok(Self::new(backend, cache, runner))
    }

    /// Process a single evaluation job, returning the recorded submission
    pub async fn process(&self, message: &JobMessage) -> Result<NewSubmission, JobError> {
        info!("{}", "=".repeat(50));
        info!(
            "Workshop: {:?}, Assignment: {:?}",
            message.workshop_id, message.assignment_id
        );
        info!(
            "Participant: {} (ID: {:?})",
            message.participant_email.as_deref().unwrap_or("unknown"),
            message.participant_id
        );
        info!("File: {:?}", message.file_path);

        let job = message.validate()?;

        if !file_exists(&job.file_path).await {
            return Err(JobError::Validation(format!(
                "file not found: {}",
                job.file_path.display()
            )));
        }

        info!("Downloading evaluation binary...");
        let binary = self
            .cache
            .fetch(job.assignment_id, &job.s3_eval_binary_key)
            .await?;
        info!(
            "Evaluator ready at {:?} ({} bytes, sha256={}, normalized={})",
            binary.path, binary.size, binary.sha256, binary.normalized
        );

        info!("Running evaluation...");
        let evaluation = self.runner.run(&binary.path, &job.file_path).await?;
        info!("Score: {}", evaluation.score);
        debug!(
            "Evaluation exit code {}, stdout: {}, stderr: {}",
            evaluation.exit_code,
            preview(&evaluation.stdout),
            preview(&evaluation.stderr)
        );

        let latest_attempt = self
            .backend
            .get_latest_attempt_number(job.participant_id, job.assignment_id)
            .await;
        let submission = NewSubmission {
            participant_id: job.participant_id,
            assignment_id: job.assignment_id,
            score: evaluation.score,
            attempt_number: latest_attempt.saturating_add(1),
        };
        info!("Attempt number: {}", submission.attempt_number);

        info!("Creating submission record...");
        self.backend
            .create_submission(&submission)
            .await
            .map_err(JobError::Submission)?;
        info!(
            "✓ Submission created: workshop {:?}, assignment {}, participant {} ({}), attempt {}, score {}",
            job.workshop_id,
            submission.assignment_id,
            job.participant_email,
            submission.participant_id,
            submission.attempt_number,
            submission.score
        );

        Ok(submission)
    }
}

#[async_trait]
impl JobHandler for JobProcessor {
    async fn handle(&self, message: JobMessage) -> Result<(), JobError> {
        self.process(&message).await.map(|_| ()).inspect_err(|e| {
            error!("Error: {}", e);
        })
    }
}

async fn file_exists(path: &Path) -> bool {
    matches!(tokio::fs::try_exists(path).await, Ok(true))
}
