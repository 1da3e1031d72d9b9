pub mod evaluation;

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::core::JobError;

pub use evaluation::JobProcessor;

/// Job payload as published on the evaluation queue
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobMessage {
    pub workshop_id: Option<i64>,
    pub assignment_id: Option<i64>,
    pub participant_id: Option<i64>,
    /// Informational only
    pub participant_email: Option<String>,
    /// Submission file already placed on the local filesystem
    pub file_path: Option<String>,
    pub s3_eval_binary_key: Option<String>,
}

/// A job with every required field present
#[derive(Debug, Clone, PartialEq)]
pub struct EvaluationJob {
    pub workshop_id: Option<i64>,
    pub assignment_id: i64,
    pub participant_id: i64,
    pub participant_email: String,
    pub file_path: PathBuf,
    pub s3_eval_binary_key: String,
}

impl JobMessage {
    /// Decode a raw queue payload
    pub fn decode(payload: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(payload)
    }

    /// Check required fields. Zero ids and blank strings count as missing.
    pub fn validate(&self) -> Result<EvaluationJob, JobError> {
        let id = |v: Option<i64>| v.filter(|id| *id != 0);

        let assignment_id = id(self.assignment_id);
        let participant_id = id(self.participant_id);
        let file_path = non_blank(&self.file_path);
        let s3_key = non_blank(&self.s3_eval_binary_key);

        let mut missing = Vec::new();
        if assignment_id.is_none() {
            missing.push("assignmentId");
        }
        if participant_id.is_none() {
            missing.push("participantId");
        }
        if file_path.is_none() {
            missing.push("filePath");
        }
        if s3_key.is_none() {
            missing.push("s3EvalBinaryKey");
        }

        match (assignment_id, participant_id, file_path, s3_key) {
            (Some(assignment_id), Some(participant_id), Some(file_path), Some(s3_key)) => {
                Ok(EvaluationJob {
                    workshop_id: self.workshop_id,
                    assignment_id,
                    participant_id,
                    participant_email: self
                        .participant_email
                        .clone()
                        .unwrap_or_else(|| "unknown".into()),
                    file_path: PathBuf::from(file_path),
                    s3_eval_binary_key: s3_key.to_string(),
                })
            }
            _ => Err(JobError::Validation(format!(
                "missing required fields: {}",
                missing.join(", ")
            ))),
        }
    }
}

/// Blank values count as missing. Present values pass through untrimmed.
fn non_blank(value: &Option<String>) -> Option<&str> {
    value.as_deref().filter(|s| !s.trim().is_empty())
}
