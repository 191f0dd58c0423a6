use std::fmt;

use chrono::{DateTime, Utc};

pub mod config;

pub use config::{JobConfig, JobConfigError, validate_starting_url};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TenantIdError {
    #[error("tenant id is empty")]
    Empty,
    #[error("tenant id longer than {} characters", TenantId::MAX_LEN)]
    TooLong,
    #[error("tenant id contains invalid character {0:?}")]
    InvalidChar(char),
}

/// Opaque per-visitor identifier, issued once and carried in a client cookie.
///
/// Restricted to ASCII alphanumerics and `-` so it can be embedded in artifact
/// file names next to the `__` separator.
#[derive(
    Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize,
)]
#[serde(try_from = "String", into = "String")]
pub struct TenantId(String);

impl TenantId {
    pub const MAX_LEN: usize = 128;

    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn parse(raw: &str) -> Result<Self, TenantIdError> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err(TenantIdError::Empty);
        }
        if raw.len() > Self::MAX_LEN {
            return Err(TenantIdError::TooLong);
        }
        if let Some(c) = raw.chars().find(|c| !(c.is_ascii_alphanumeric() || *c == '-')) {
            return Err(TenantIdError::InvalidChar(c));
        }
        Ok(Self(raw.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for TenantId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TenantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for TenantId {
    type Error = TenantIdError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<TenantId> for String {
    fn from(value: TenantId) -> Self {
        value.0
    }
}

/// Normalized starting URL of a crawl. Unique within one session's active table.
#[derive(
    Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize,
)]
#[serde(transparent)]
pub struct JobKey(String);

impl JobKey {
    /// Trims, lowercases scheme and authority, and drops trailing slashes.
    pub fn normalize(raw: &str) -> Self {
        let raw = raw.trim();
        let normalized = match raw.split_once("://") {
            Some((scheme, rest)) => {
                let (authority, tail) = match rest.find('/') {
                    Some(i) => rest.split_at(i),
                    None => (rest, ""),
                };
                format!(
                    "{}://{}{}",
                    scheme.to_ascii_lowercase(),
                    authority.to_ascii_lowercase(),
                    tail
                )
            }
            None => raw.to_string(),
        };
        Self(normalized.trim_end_matches('/').to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for JobKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identifies one launch of a job. A key can be reused across launches; the id cannot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct JobId(pub uuid::Uuid);

impl JobId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct ActiveJob {
    pub key: JobKey,
    pub job_id: JobId,
    pub started_at: DateTime<Utc>,
    pub cancel_requested: bool,
}
