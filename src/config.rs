use crate::error::ConfigError;
use crate::record::FieldSelector;
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_SEARCH_URL: &str = "https://api.pushshift.io/reddit/submission/search/";
/// Hard cap of the authenticated info endpoint.
pub const MAX_LOOKUP_BATCH: usize = 100;

/// How long to keep trying a failing remote call.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Fixed pause between attempts.
    pub backoff: Duration,
    /// `None` retries forever (unattended batch jobs); `Some(n)` gives up after n attempts.
    pub max_attempts: Option<u32>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self { backoff: Duration::from_secs(1), max_attempts: None }
    }
}

impl RetryPolicy {
    pub fn forever(backoff: Duration) -> Self {
        Self { backoff, max_attempts: None }
    }
    pub fn bounded(backoff: Duration, max_attempts: u32) -> Self {
        Self { backoff, max_attempts: Some(max_attempts.max(1)) }
    }
}

/// User-facing options with sensible defaults and builder chaining.
#[derive(Clone, Debug)]
pub struct HarvestOptions {
    pub search_url: String,
    pub page_size: usize,
    pub fields: FieldSelector,
    pub retry: RetryPolicy,
    pub request_timeout: Duration,
    pub lookup_batch: usize,          // ids per authenticated lookup, capped at 100
    pub memory_budget_bytes: u64,     // writer flush threshold
    pub drop_pinned: bool,            // skip stickied/announcement posts before buffering
    pub parallel_flush: bool,         // append partitions concurrently within one flush
    pub zstd_level: i32,              // archive compression
    pub low_memory_flush: Option<f64>, // flush early when available RAM fraction drops below
    pub progress: bool,
    pub write_buffer_bytes: usize,     // archive append buffer
}

impl Default for HarvestOptions {
    fn default() -> Self {
        Self {
            search_url: DEFAULT_SEARCH_URL.to_string(),
            page_size: 500,
            fields: FieldSelector::all(),
            retry: RetryPolicy::default(),
            request_timeout: Duration::from_secs(30),
            lookup_batch: MAX_LOOKUP_BATCH,
            memory_budget_bytes: 256 * 1024 * 1024,
            drop_pinned: false,
            parallel_flush: false,
            zstd_level: 3,
            low_memory_flush: None,
            progress: true,
            write_buffer_bytes: 256 * 1024,
        }
    }
}

impl HarvestOptions {
    pub fn with_search_url(mut self, url: impl Into<String>) -> Self {
        self.search_url = url.into();
        self
    }
    pub fn with_page_size(mut self, n: usize) -> Self {
        self.page_size = n;
        self
    }
    pub fn with_fields<I, S>(mut self, fields: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.fields = FieldSelector::new(fields)?;
        Ok(self)
    }
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }
    pub fn with_lookup_batch(mut self, n: usize) -> Self {
        self.lookup_batch = n.clamp(1, MAX_LOOKUP_BATCH);
        self
    }
    pub fn with_memory_budget_mb(mut self, mb: f64) -> Self {
        self.memory_budget_bytes = mb_to_bytes(mb);
        self
    }
    pub fn with_memory_budget_bytes(mut self, bytes: u64) -> Self {
        self.memory_budget_bytes = bytes;
        self
    }
    pub fn with_drop_pinned(mut self, yes: bool) -> Self {
        self.drop_pinned = yes;
        self
    }
    pub fn with_parallel_flush(mut self, yes: bool) -> Self {
        self.parallel_flush = yes;
        self
    }
    pub fn with_zstd_level(mut self, level: i32) -> Self {
        self.zstd_level = level;
        self
    }
    pub fn with_low_memory_flush(mut self, fraction: Option<f64>) -> Self {
        self.low_memory_flush = fraction.map(|f| f.clamp(0.0, 1.0));
        self
    }
    pub fn with_progress(mut self, yes: bool) -> Self {
        self.progress = yes;
        self
    }
    pub fn with_write_buffer_bytes(mut self, bytes: usize) -> Self {
        self.write_buffer_bytes = bytes.max(1);
        self
    }

    /// Reject settings that would make a run loop or do nothing.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.page_size == 0 {
            return Err(ConfigError::Zero("page_size"));
        }
        if self.lookup_batch == 0 {
            return Err(ConfigError::Zero("lookup_batch"));
        }
        if self.retry.max_attempts == Some(0) {
            return Err(ConfigError::Zero("max_attempts"));
        }
        Ok(())
    }
}

pub fn mb_to_bytes(mb: f64) -> u64 {
    (mb.max(0.0) * 1024.0 * 1024.0) as u64
}

/// OAuth script-app credentials for the authenticated lookup.
#[derive(Clone, Deserialize)]
pub struct Credentials {
    pub client_id: String,
    pub client_secret: String,
    pub username: String,
    pub password: String,
    pub user_agent: String,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("client_id", &self.client_id)
            .field("username", &self.username)
            .field("user_agent", &self.user_agent)
            .finish_non_exhaustive()
    }
}

impl Credentials {
    /// Load once at session start. Missing or malformed files are fatal.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let err = |reason: String| ConfigError::Credentials { path: PathBuf::from(path), reason };
        let raw = fs::read_to_string(path).map_err(|e| err(e.to_string()))?;
        let creds: Credentials = serde_json::from_str(&raw).map_err(|e| err(e.to_string()))?;
        for (name, value) in [
            ("client_id", &creds.client_id),
            ("client_secret", &creds.client_secret),
            ("username", &creds.username),
            ("password", &creds.password),
            ("user_agent", &creds.user_agent),
        ] {
            if value.trim().is_empty() {
                return Err(err(format!("`{name}` is empty")));
            }
        }
        Ok(creds)
    }
}
