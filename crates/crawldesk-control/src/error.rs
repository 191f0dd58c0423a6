use std::path::PathBuf;

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
};
use crawldesk_job::{JobConfigError, JobKey};

use crate::result_store::StoreError;

const MAX_MESSAGE_BYTES: usize = 4 * 1024;
const MAX_HINT_BYTES: usize = 1024;

/// Why a session refused to admit a new job.
#[derive(Debug, thiserror::Error)]
pub enum Admission {
    #[error("too many active crawlers (limit {cap})")]
    TooManyActiveJobs { cap: usize },
    #[error("a crawler for {key} is already running")]
    DuplicateJob { key: JobKey },
}

#[derive(Debug, thiserror::Error)]
pub enum LaunchError {
    #[error("write job config {}: {source}", .path.display())]
    WriteArtifact {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("spawn worker {}: {source}", .program.display())]
    Spawn {
        program: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Network-graph generation failures.
#[derive(Debug, thiserror::Error)]
pub enum GraphError {
    #[error("no crawl results to graph yet")]
    NoResults,
    #[error("spawn graph processor {}: {source}", .program.display())]
    Spawn {
        program: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("graph processor exited with {code:?}: {stderr}")]
    Failed { code: Option<i32>, stderr: String },
    #[error("graph processor gave up after {0:?}")]
    TimedOut(std::time::Duration),
    #[error("graph processor wrote no output")]
    MissingOutput,
    #[error("graph artifact: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("missing or unconfirmed tenant identity")]
    IdentityMissing,
    #[error(transparent)]
    AdmissionRejected(#[from] Admission),
    #[error("no active crawler for {key}")]
    JobNotFound { key: JobKey },
    #[error("failed to start crawler for {key}: {source}")]
    LaunchFailure {
        key: JobKey,
        #[source]
        source: LaunchError,
    },
    #[error(transparent)]
    InvalidJob(#[from] JobConfigError),
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct ErrorBody {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hint: Option<String>,
}

/// HTTP-facing error: status plus a `{code, message, hint?}` JSON body.
#[derive(Debug, Clone)]
pub struct ApiError {
    pub status: StatusCode,
    pub body: ErrorBody,
}

impl ApiError {
    pub fn new(status: StatusCode, code: &str, message: impl Into<String>) -> Self {
        Self {
            status,
            body: ErrorBody {
                code: code.to_string(),
                message: truncate_utf8(&message.into(), MAX_MESSAGE_BYTES),
                hint: None,
            },
        }
    }

    pub fn with_hint(mut self, hint: impl Into<String>) -> Self {
        self.body.hint = Some(truncate_utf8(&hint.into(), MAX_HINT_BYTES));
        self
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, "internal", message)
    }

    pub fn code(&self) -> &str {
        &self.body.code
    }
}

impl From<SessionError> for ApiError {
    fn from(err: SessionError) -> Self {
        let message = err.to_string();
        match &err {
            SessionError::IdentityMissing => {
                Self::new(StatusCode::UNAUTHORIZED, "identity_missing", message)
                    .with_hint("reload the dashboard to obtain a session")
            }
            SessionError::AdmissionRejected(Admission::TooManyActiveJobs { .. }) => {
                Self::new(StatusCode::TOO_MANY_REQUESTS, "too_many_active_jobs", message)
                    .with_hint("stop a running crawler or wait for one to finish")
            }
            SessionError::AdmissionRejected(Admission::DuplicateJob { .. }) => {
                Self::new(StatusCode::CONFLICT, "duplicate_job", message)
            }
            SessionError::JobNotFound { .. } => {
                Self::new(StatusCode::NOT_FOUND, "job_not_found", message)
            }
            SessionError::LaunchFailure { .. } => {
                Self::new(StatusCode::BAD_GATEWAY, "launch_failure", message)
            }
            SessionError::InvalidJob(_) => Self::new(StatusCode::BAD_REQUEST, "invalid_job", message),
        }
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::UnknownCategory(_) => {
                Self::new(StatusCode::BAD_REQUEST, "invalid_file_type", err.to_string())
                    .with_hint("use type=HTML or type=Image")
            }
            StoreError::Db(_) => {
                tracing::warn!(error = %err, "result store query failed");
                Self::new(StatusCode::INTERNAL_SERVER_ERROR, "store_unavailable", err.to_string())
            }
        }
    }
}

impl From<GraphError> for ApiError {
    fn from(err: GraphError) -> Self {
        match &err {
            GraphError::NoResults => {
                Self::new(StatusCode::NOT_FOUND, "not_found", "Results DB not found")
                    .with_hint("run a crawl before generating the network graph")
            }
            GraphError::TimedOut(_) => {
                tracing::warn!(error = %err, "network graph generation timed out");
                Self::new(StatusCode::GATEWAY_TIMEOUT, "graph_timeout", "Error generating network file")
            }
            GraphError::Spawn { .. } | GraphError::Failed { .. } | GraphError::MissingOutput => {
                tracing::warn!(error = %err, "network graph generation failed");
                Self::new(StatusCode::BAD_GATEWAY, "graph_failed", "Error generating network file")
                    .with_hint(err.to_string())
            }
            GraphError::Io(_) => {
                tracing::warn!(error = %err, "network graph artifact unavailable");
                Self::internal("Error generating network file")
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, axum::Json(self.body)).into_response()
    }
}

fn truncate_utf8(s: &str, max_bytes: usize) -> String {
    const MARKER: &str = "…(truncated)";
    if s.len() <= max_bytes {
        return s.to_owned();
    }
    let budget = max_bytes.saturating_sub(MARKER.len());
    let end = s
        .char_indices()
        .map(|(i, c)| i + c.len_utf8())
        .take_while(|&end| end <= budget)
        .last()
        .unwrap_or(0);
    format!("{}{MARKER}", &s[..end])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn admission_errors_map_to_distinct_codes() {
        let cap: ApiError = SessionError::from(Admission::TooManyActiveJobs { cap: 5 }).into();
        assert_eq!(cap.status, StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(cap.code(), "too_many_active_jobs");
        assert!(cap.body.message.contains('5'));

        let dup: ApiError = SessionError::from(Admission::DuplicateJob {
            key: JobKey::normalize("https://www.example.com"),
        })
        .into();
        assert_eq!(dup.status, StatusCode::CONFLICT);
        assert_eq!(dup.code(), "duplicate_job");
    }

    #[test]
    fn invalid_job_keeps_validation_message() {
        let err: ApiError = SessionError::from(JobConfigError::HostMissingWww).into();
        assert_eq!(err.status, StatusCode::BAD_REQUEST);
        assert_eq!(err.body.message, "Invalid URL host, must start with www.");
    }

    #[test]
    fn truncate_respects_char_boundaries() {
        let s = "é".repeat(MAX_MESSAGE_BYTES);
        let out = truncate_utf8(&s, MAX_MESSAGE_BYTES);
        assert!(out.len() <= MAX_MESSAGE_BYTES);
        assert!(out.ends_with("…(truncated)"));
    }

    #[test]
    fn truncate_keeps_short_ascii_and_cuts_exactly_at_budget() {
        assert_eq!(truncate_utf8("short", 64), "short");
        let out = truncate_utf8(&"a".repeat(100), 20);
        assert_eq!(out, format!("{}…(truncated)", "a".repeat(20 - "…(truncated)".len())));
    }

    #[test]
    fn graph_errors_map_to_gateway_statuses() {
        let missing: ApiError = GraphError::NoResults.into();
        assert_eq!(missing.status, StatusCode::NOT_FOUND);

        let failed: ApiError = GraphError::Failed {
            code: Some(2),
            stderr: "boom".into(),
        }
        .into();
        assert_eq!(failed.status, StatusCode::BAD_GATEWAY);
        assert_eq!(failed.code(), "graph_failed");
        assert!(failed.body.hint.unwrap().contains("boom"));

        let slow: ApiError = GraphError::TimedOut(std::time::Duration::from_secs(1)).into();
        assert_eq!(slow.status, StatusCode::GATEWAY_TIMEOUT);
    }
}
