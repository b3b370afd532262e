//! Typed errors at the seams where the caller has to branch on the kind of failure.
//! Pipeline-level code stays on `anyhow` and wraps these with context.

use std::path::PathBuf;
use thiserror::Error;

/// Outcome of a single remote call that did not succeed.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RemoteError {
    /// Network failure, timeout, non-success status or a body without the expected shape.
    #[error("transient remote error: {0}")]
    Retryable(String),

    /// Rejected in a way that repeating the same request cannot fix (bad credentials).
    #[error("fatal remote error: {0}")]
    Fatal(String),
}

impl RemoteError {
    pub fn retryable(msg: impl Into<String>) -> Self {
        RemoteError::Retryable(msg.into())
    }

    pub fn fatal(msg: impl Into<String>) -> Self {
        RemoteError::Fatal(msg.into())
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, RemoteError::Retryable(_))
    }
}

impl From<reqwest::Error> for RemoteError {
    fn from(e: reqwest::Error) -> Self {
        // Transport, timeout and decode failures are all worth another attempt.
        RemoteError::Retryable(e.to_string())
    }
}

/// Why the retry driver gave up on an operation.
#[derive(Debug, Error)]
pub enum RetryError {
    #[error("{op}: {msg}")]
    Fatal { op: String, msg: String },

    #[error("{op}: giving up after {attempts} attempts, last error: {last}")]
    Exhausted { op: String, attempts: u32, last: String },

    #[error("{op}: cancelled")]
    Cancelled { op: String },
}

impl RetryError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, RetryError::Cancelled { .. })
    }
}

/// Misconfiguration detected before or during a run. Never retried.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("credentials file {path}: {reason}")]
    Credentials { path: PathBuf, reason: String },

    #[error("unknown field selector `{0}`")]
    UnknownField(String),

    #[error("invalid date `{input}`: expected YYYY-MM-DD, RFC3339 or unix seconds")]
    InvalidDate { input: String },

    #[error("subreddits `{existing}` and `{incoming}` both map to partition key `{key}`")]
    PartitionKeyCollision { key: String, existing: String, incoming: String },

    #[error("subreddit `{0}` has no usable partition key")]
    EmptyPartitionKey(String),

    #[error("{0} must be greater than zero")]
    Zero(&'static str),
}

/// A raw record that does not fit the typed schema.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RecordError {
    #[error("record is not a JSON object")]
    NotAnObject,

    #[error("missing or invalid `{0}`")]
    Field(&'static str),
}
