//! Cursor-paginated fetch: walk a subreddit backwards in time, one page per call.
//!
//! The cursor starts at the upper bound and moves to the oldest `created_utc` of
//! every page. The session ends when the cursor reaches the lower bound, a page
//! comes back empty, the cursor stops moving, or the cancel token is set.
//! Records older than the lower bound are dropped after the fact because the
//! endpoint only understands `before`.

use crate::cancel::CancelToken;
use crate::config::{HarvestOptions, RetryPolicy};
use crate::date::now_unix;
use crate::error::{ConfigError, RemoteError};
use crate::record::{as_epoch, parse_records, RecordBatch};
use crate::retry::{with_retry, Sleeper, ThreadSleeper};
use crate::search::{SearchApi, SearchQuery};
use anyhow::Result;
use std::sync::Arc;

/// What a batch producer hands back on each pull.
#[derive(Debug, PartialEq, Eq)]
pub enum StreamState {
    Active(RecordBatch),
    Exhausted,
}

/// A finite, non-restartable producer of record batches.
pub trait BatchSource {
    fn next_batch(&mut self) -> Result<StreamState>;
}

pub struct CursorFetcher<A: SearchApi> {
    api: A,
    subreddit: String,
    lower: i64,
    cursor: i64,
    page_size: usize,
    fields: Option<String>,
    retry: RetryPolicy,
    sleeper: Arc<dyn Sleeper>,
    cancel: CancelToken,
    done: bool,
    requests: u64,
    quarantined: u64,
}

impl<A: SearchApi> CursorFetcher<A> {
    /// `upper = None` starts from the current time. A window with `lower >= upper`
    /// is valid and yields nothing.
    pub fn new(
        api: A,
        subreddit: impl Into<String>,
        lower: i64,
        upper: Option<i64>,
        opts: &HarvestOptions,
    ) -> Result<Self, ConfigError> {
        opts.validate()?;
        let upper = upper.unwrap_or_else(now_unix);
        Ok(Self {
            api,
            subreddit: subreddit.into(),
            lower,
            cursor: upper,
            page_size: opts.page_size,
            fields: Some(opts.fields.to_query_value()),
            retry: opts.retry,
            sleeper: Arc::new(ThreadSleeper),
            cancel: CancelToken::default(),
            done: false,
            requests: 0,
            quarantined: 0,
        })
    }

    pub fn with_sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Oldest `created_utc` reached so far (the next `before`).
    pub fn cursor(&self) -> i64 {
        self.cursor
    }

    /// Successful page requests issued so far.
    pub fn requests(&self) -> u64 {
        self.requests
    }

    /// Raw objects rejected by the record schema so far.
    pub fn quarantined(&self) -> u64 {
        self.quarantined
    }

    pub fn subreddit(&self) -> &str {
        &self.subreddit
    }

    pub fn next_page(&mut self) -> Result<StreamState> {
        loop {
            if self.done {
                return Ok(StreamState::Exhausted);
            }
            if self.cursor <= self.lower {
                self.done = true;
                return Ok(StreamState::Exhausted);
            }
            if self.cancel.is_cancelled() {
                tracing::warn!("r/{}: fetch cancelled at cursor {}", self.subreddit, self.cursor);
                self.done = true;
                return Ok(StreamState::Exhausted);
            }

            let query = SearchQuery {
                subreddit: self.subreddit.clone(),
                before: self.cursor,
                size: self.page_size,
                fields: self.fields.clone(),
            };
            let op = format!("search r/{} before {}", self.subreddit, self.cursor);
            let api = &self.api;
            let raw = match with_retry(&op, &self.retry, self.sleeper.as_ref(), &self.cancel, || {
                let raw = api.search(&query)?;
                if !raw.is_empty() && !raw.iter().any(|v| v.get("created_utc").and_then(as_epoch).is_some()) {
                    // Without a timestamp the cursor cannot move; treat it like an error page.
                    return Err(RemoteError::retryable("page without any created_utc"));
                }
                Ok(raw)
            }) {
                Ok(raw) => raw,
                Err(e) if e.is_cancelled() => {
                    tracing::warn!("r/{}: fetch cancelled while retrying", self.subreddit);
                    self.done = true;
                    return Ok(StreamState::Exhausted);
                }
                Err(e) => {
                    self.done = true;
                    return Err(e.into());
                }
            };
            self.requests += 1;

            if raw.is_empty() {
                tracing::debug!("r/{}: empty page at cursor {}, upstream exhausted", self.subreddit, self.cursor);
                self.done = true;
                return Ok(StreamState::Exhausted);
            }

            let Some(oldest) = raw.iter().filter_map(|v| v.get("created_utc").and_then(as_epoch)).min() else {
                self.done = true;
                return Ok(StreamState::Exhausted);
            };
            if oldest >= self.cursor {
                // A cursor that does not move would request the same page forever.
                tracing::warn!(
                    "r/{}: cursor stalled at {} (page oldest {}), stopping",
                    self.subreddit,
                    self.cursor,
                    oldest
                );
                self.done = true;
            }
            tracing::debug!("r/{}: cursor {} -> {}", self.subreddit, self.cursor, oldest);
            self.cursor = self.cursor.min(oldest);

            let (mut batch, rejected) = parse_records(&raw);
            self.quarantined += rejected as u64;
            let lower = self.lower;
            batch.retain(|r| r.created_utc >= lower);

            if batch.is_empty() {
                // Either everything overshot the lower bound or everything was quarantined.
                continue;
            }
            return Ok(StreamState::Active(batch));
        }
    }
}

impl<A: SearchApi> BatchSource for CursorFetcher<A> {
    fn next_batch(&mut self) -> Result<StreamState> {
        self.next_page()
    }
}

impl<A: SearchApi> Iterator for CursorFetcher<A> {
    type Item = Result<RecordBatch>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.next_page() {
            Ok(StreamState::Active(batch)) => Some(Ok(batch)),
            Ok(StreamState::Exhausted) => None,
            Err(e) => Some(Err(e)),
        }
    }
}
