//! Backend API client
//!
//! Typed wrapper over the three backend endpoints the worker needs:
//! presigned download URLs, submission listing and submission creation.

use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use crate::config::BackendConfig;

/// Page size used when listing existing submissions
const SUBMISSION_PAGE_LIMIT: u32 = 100;

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("backend returned {status}: {body}")]
    Status { status: StatusCode, body: String },
    #[error("response is missing `{0}`")]
    MissingField(&'static str),
    #[error("API token is not a valid header value")]
    InvalidToken,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct DownloadUrlRequest<'a> {
    s3_key: &'a str,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DownloadUrlResponse {
    download_url: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SubmissionList {
    #[serde(default)]
    data: Vec<SubmissionSummary>,
}

/// Existing submission as returned by the listing endpoint
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmissionSummary {
    #[serde(default)]
    pub attempt_number: Option<u32>,
}

/// Body of a new submission record
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NewSubmission {
    pub participant_id: i64,
    pub assignment_id: i64,
    pub score: f64,
    pub attempt_number: u32,
}

/// Highest attempt number among existing submissions (0 when there are none)
pub fn max_attempt_number(submissions: &[SubmissionSummary]) -> u32 {
    submissions
        .iter()
        .map(|s| s.attempt_number.unwrap_or(0))
        .max()
        .unwrap_or(0)
}

/// Authenticated backend client
#[derive(Clone)]
pub struct BackendClient {
    client: reqwest::Client,
    api_base: String,
}

impl BackendClient {
    pub fn new(config: &BackendConfig) -> Result<Self, BackendError> {
        let mut headers = HeaderMap::new();
        let mut bearer = HeaderValue::from_str(&format!("Bearer {}", config.api_token))
            .map_err(|_| BackendError::InvalidToken)?;
        bearer.set_sensitive(true);
        headers.insert(AUTHORIZATION, bearer);
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

        let client = reqwest::Client::builder()
            .default_headers(headers)
            .build()?;

        Ok(Self {
            client,
            api_base: format!("{}/api/v1", config.base_uri.trim_end_matches('/')),
        })
    }

    /// Ask the backend for a short-lived presigned URL for a storage key
    pub async fn get_download_url(&self, s3_key: &str) -> Result<String, BackendError> {
        let response = self
            .client
            .post(format!("{}/storage/download-url", self.api_base))
            .json(&DownloadUrlRequest { s3_key })
            .send()
            .await?;
        let response = ensure_success(response).await?;

        let body: DownloadUrlResponse = response.json().await?;
        body.download_url
            .filter(|url| !url.is_empty())
            .ok_or(BackendError::MissingField("downloadUrl"))
    }

    /// Highest recorded attempt number for a participant's assignment.
    ///
    /// Lookup failures are logged and treated as "no attempts yet".
    pub async fn get_latest_attempt_number(&self, participant_id: i64, assignment_id: i64) -> u32 {
        match self.list_submissions(participant_id, assignment_id).await {
            Ok(submissions) => {
                debug!(
                    "Found {} existing submissions for participant {} assignment {}",
                    submissions.len(),
                    participant_id,
                    assignment_id
                );
                max_attempt_number(&submissions)
            }
            Err(e) => {
                warn!(
                    "Failed to look up attempt number for participant {} assignment {}: {}",
                    participant_id, assignment_id, e
                );
                0
            }
        }
    }

    async fn list_submissions(
        &self,
        participant_id: i64,
        assignment_id: i64,
    ) -> Result<Vec<SubmissionSummary>, BackendError> {
        let response = self
            .client
            .get(format!("{}/submissions", self.api_base))
            .query(&[
                ("participantId", participant_id.to_string()),
                ("assignmentId", assignment_id.to_string()),
                ("limit", SUBMISSION_PAGE_LIMIT.to_string()),
            ])
            .send()
            .await?;
        let response = ensure_success(response).await?;

        let list: SubmissionList = response.json().await?;
        Ok(list.data)
    }

    /// Record a submission. Only 200 and 201 count as success.
    pub async fn create_submission(&self, submission: &NewSubmission) -> Result<(), BackendError> {
        let response = self
            .client
            .post(format!("{}/submissions", self.api_base))
            .json(submission)
            .send()
            .await?;

        match response.status() {
            StatusCode::OK | StatusCode::CREATED => Ok(()),
            status => Err(BackendError::Status {
                status,
                body: response.text().await.unwrap_or_default(),
            }),
        }
    }
}

async fn ensure_success(response: reqwest::Response) -> Result<reqwest::Response, BackendError> {
    let status = response.status();
    if status.is_success() {
        Ok(response)
    } else {
        Err(BackendError::Status {
            status,
            body: response.text().await.unwrap_or_default(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_json, header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client_for(server: &MockServer) -> BackendClient {
        BackendClient::new(&BackendConfig {
            base_uri: server.uri(),
            api_token: "test-token".into(),
        })
        .unwrap()
    }

    #[test]
    fn test_max_attempt_number() {
        let subs: Vec<SubmissionSummary> = [Some(1), Some(2), Some(4)]
            .into_iter()
            .map(|attempt_number| SubmissionSummary { attempt_number })
            .collect();
        assert_eq!(max_attempt_number(&subs), 4);
        assert_eq!(max_attempt_number(&[]), 0);
        assert_eq!(
            max_attempt_number(&[SubmissionSummary {
                attempt_number: None
            }]),
            0
        );
    }

    #[tokio::test]
    async fn test_get_download_url() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/v1/storage/download-url"))
            .and(header("authorization", "Bearer test-token"))
            .and(header("content-type", "application/json"))
            .and(body_json(serde_json::json!({ "s3Key": "evals/a.bin" })))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!({ "downloadUrl": "https://s3/obj" })),
            )
            .expect(1)
            .mount(&server)
            .await;

        let url = client_for(&server)
            .get_download_url("evals/a.bin")
            .await
            .unwrap();
        assert_eq!(url, "https://s3/obj");
    }

    #[tokio::test]
    async fn test_get_download_url_not_found() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/v1/storage/download-url"))
            .respond_with(ResponseTemplate::new(404).set_body_string("File not found in S3"))
            .mount(&server)
            .await;

        let err = client_for(&server)
            .get_download_url("missing")
            .await
            .unwrap_err();
        match err {
            BackendError::Status { status, body } => {
                assert_eq!(status, StatusCode::NOT_FOUND);
                assert!(body.contains("File not found"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_get_download_url_missing_field() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/v1/storage/download-url"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({})))
            .mount(&server)
            .await;

        let err = client_for(&server).get_download_url("k").await.unwrap_err();
        assert!(matches!(err, BackendError::MissingField("downloadUrl")));
    }

    #[tokio::test]
    async fn test_latest_attempt_number() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v1/submissions"))
            .and(query_param("participantId", "7"))
            .and(query_param("assignmentId", "10"))
            .and(query_param("limit", "100"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "data": [
                    { "id": 1, "attemptNumber": 1 },
                    { "id": 2, "attemptNumber": 2 },
                    { "id": 3, "attemptNumber": 4 }
                ],
                "pagination": { "page": 1 }
            })))
            .mount(&server)
            .await;

        assert_eq!(
            client_for(&server).get_latest_attempt_number(7, 10).await,
            4
        );
    }

    #[tokio::test]
    async fn test_latest_attempt_number_defaults_to_zero_on_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v1/submissions"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        assert_eq!(
            client_for(&server).get_latest_attempt_number(7, 10).await,
            0
        );
    }

    #[tokio::test]
    async fn test_create_submission_status_handling() {
        let server = MockServer::start().await;
        let submission = NewSubmission {
            participant_id: 7,
            assignment_id: 10,
            score: 0.5,
            attempt_number: 1,
        };

        Mock::given(method("POST"))
            .and(path("/api/v1/submissions"))
            .and(body_json(serde_json::json!({
                "participantId": 7,
                "assignmentId": 10,
                "score": 0.5,
                "attemptNumber": 1
            })))
            .respond_with(ResponseTemplate::new(201))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/api/v1/submissions"))
            .respond_with(ResponseTemplate::new(409).set_body_string("duplicate"))
            .mount(&server)
            .await;

        let client = client_for(&server);
        assert!(client.create_submission(&submission).await.is_ok());

        let err = client.create_submission(&submission).await.unwrap_err();
        assert!(matches!(
            err,
            BackendError::Status {
                status: StatusCode::CONFLICT,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_create_submission_rejects_other_success_codes() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/v1/submissions"))
            .respond_with(ResponseTemplate::new(204))
            .mount(&server)
            .await;

        let submission = NewSubmission {
            participant_id: 1,
            assignment_id: 1,
            score: 1.0,
            attempt_number: 1,
        };
        assert!(client_for(&server)
            .create_submission(&submission)
            .await
            .is_err());
    }
}
