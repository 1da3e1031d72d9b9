//! Evaluation binary cache
//!
//! One slot per assignment under the cache directory. Every fetch goes back
//! to object storage and overwrites the slot, so a job never runs a stale
//! evaluator.

use std::borrow::Cow;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use reqwest::header::CONTENT_TYPE;
use reqwest::StatusCode;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::backend::{BackendClient, BackendError};

const EXECUTABLE_MODE: u32 = 0o755;
const CACHE_DIR_MODE: u32 = 0o755;

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("failed to get download URL: {0}")]
    DownloadUrl(#[source] BackendError),
    #[error("failed to download evaluation binary: {0}")]
    Fetch(#[from] reqwest::Error),
    #[error("object storage returned {0}")]
    FetchStatus(StatusCode),
    #[error("failed to write {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// When to rewrite CRLF line endings in downloaded evaluators
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LineEndingPolicy {
    /// Rewrite any payload containing CRLF
    Always,
    /// Rewrite only payloads that look like text (scripts)
    #[default]
    TextOnly,
    /// Keep bytes exactly as downloaded
    Never,
}

impl FromStr for LineEndingPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "always" => Ok(LineEndingPolicy::Always),
            "text" | "text_only" => Ok(LineEndingPolicy::TextOnly),
            "never" => Ok(LineEndingPolicy::Never),
            other => Err(format!("unknown line ending policy: {}", other)),
        }
    }
}

impl LineEndingPolicy {
    fn applies_to(self, content: &[u8], content_type: Option<&str>) -> bool {
        match self {
            LineEndingPolicy::Always => true,
            LineEndingPolicy::TextOnly => is_text_artifact(content, content_type),
            LineEndingPolicy::Never => false,
        }
    }
}

/// A freshly downloaded evaluator ready to execute
#[derive(Debug, Clone)]
pub struct CachedBinary {
    pub path: PathBuf,
    pub size: usize,
    /// Hex SHA-256 of the bytes on disk
    pub sha256: String,
    /// Whether CRLF line endings were rewritten
    pub normalized: bool,
}

/// Replace every CRLF with LF.
///
/// A run of carriage returns before a line feed collapses entirely, so the
/// result never contains CRLF and a second pass is a no-op.
pub fn normalize_line_endings(content: &[u8]) -> Cow<'_, [u8]> {
    if !content.windows(2).any(|w| w == b"\r\n") {
        return Cow::Borrowed(content);
    }

    let mut out = Vec::with_capacity(content.len());
    let mut pending_cr = 0usize;
    for &byte in content {
        match byte {
            b'\r' => pending_cr += 1,
            b'\n' => {
                pending_cr = 0;
                out.push(b'\n');
            }
            _ => {
                out.extend(std::iter::repeat(b'\r').take(pending_cr));
                pending_cr = 0;
                out.push(byte);
            }
        }
    }
    out.extend(std::iter::repeat(b'\r').take(pending_cr));
    Cow::Owned(out)
}

/// Heuristic: declared `text/*`, a shebang script, or NUL-free UTF-8 that is not ELF.
pub fn is_text_artifact(content: &[u8], content_type: Option<&str>) -> bool {
    if content_type.is_some_and(|ct| ct.trim_start().starts_with("text/")) {
        return true;
    }
    if content.starts_with(b"#!") {
        return true;
    }
    if content.starts_with(b"\x7fELF") || content.contains(&0) {
        return false;
    }
    std::str::from_utf8(content).is_ok()
}

/// Create the cache directory (not world-writable)
pub async fn ensure_cache_dir(dir: &Path) -> Result<(), CacheError> {
    tokio::fs::DirBuilder::new()
        .recursive(true)
        .mode(CACHE_DIR_MODE)
        .create(dir)
        .await
        .map_err(|source| CacheError::Io {
            path: dir.to_path_buf(),
            source,
        })
}

pub struct BinaryCache {
    backend: BackendClient,
    /// Plain client; presigned URLs carry their own authorization
    http: reqwest::Client,
    cache_dir: PathBuf,
    policy: LineEndingPolicy,
}

impl BinaryCache {
    pub fn new(
        backend: BackendClient,
        cache_dir: impl Into<PathBuf>,
        policy: LineEndingPolicy,
    ) -> Self {
        Self {
            backend,
            http: reqwest::Client::new(),
            cache_dir: cache_dir.into(),
            policy,
        }
    }

    /// Deterministic cache slot for an assignment
    pub fn binary_path(&self, assignment_id: i64) -> PathBuf {
        self.cache_dir.join(format!("eval_{}", assignment_id))
    }

    /// Download the evaluator for an assignment and make it executable
    pub async fn fetch(&self, assignment_id: i64, s3_key: &str) -> Result<CachedBinary, CacheError> {
        let download_url = self
            .backend
            .get_download_url(s3_key)
            .await
            .map_err(CacheError::DownloadUrl)?;
        debug!("Got presigned URL for {}", s3_key);

        let response = self.http.get(&download_url).send().await?;
        if !response.status().is_success() {
            return Err(CacheError::FetchStatus(response.status()));
        }
        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let content = response.bytes().await?;

        let normalized = self.policy.applies_to(&content, content_type.as_deref());
        let content = if normalized {
            normalize_line_endings(&content)
        } else {
            Cow::Borrowed(content.as_ref())
        };
        let normalized = normalized && matches!(content, Cow::Owned(_));
        if normalized {
            info!("Normalized CRLF line endings in evaluator for assignment {}", assignment_id);
        }

        let path = self.binary_path(assignment_id);
        self.install(&path, &content).await?;

        Ok(CachedBinary {
            path,
            size: content.len(),
            sha256: format!("{:x}", Sha256::digest(&content)),
            normalized,
        })
    }

    /// Write to a side file, mark it executable, then rename over the slot
    async fn install(&self, path: &Path, content: &[u8]) -> Result<(), CacheError> {
        ensure_cache_dir(&self.cache_dir).await?;

        let partial = path.with_extension("partial");
        let result = async {
            tokio::fs::write(&partial, content).await?;
            tokio::fs::set_permissions(&partial, std::fs::Permissions::from_mode(EXECUTABLE_MODE))
                .await?;
            tokio::fs::rename(&partial, path).await
        }
        .await;

        if let Err(source) = result {
            if let Err(e) = tokio::fs::remove_file(&partial).await {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!("Failed to remove partial download {:?}: {}", partial, e);
                }
            }
            return Err(CacheError::Io {
                path: path.to_path_buf(),
                source,
            });
        }

        Ok(())
    }
}
