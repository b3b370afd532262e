//! Fixed-backoff retry driver. The decision to retry depends only on the
//! `RemoteError` kind and the configured policy.

use crate::cancel::CancelToken;
use crate::config::RetryPolicy;
use crate::error::{RemoteError, RetryError};
use std::time::Duration;

/// Where retry pauses go. Swappable so tests can observe pauses without waiting.
pub trait Sleeper: Send + Sync {
    fn sleep(&self, d: Duration);
}

#[derive(Clone, Copy, Debug, Default)]
pub struct ThreadSleeper;

impl Sleeper for ThreadSleeper {
    fn sleep(&self, d: Duration) {
        std::thread::sleep(d);
    }
}

/// Run `call` until it succeeds, fails fatally, runs out of attempts or the token is cancelled.
pub fn with_retry<T>(
    op: &str,
    policy: &RetryPolicy,
    sleeper: &dyn Sleeper,
    cancel: &CancelToken,
    mut call: impl FnMut() -> Result<T, RemoteError>,
) -> Result<T, RetryError> {
    let mut attempt: u32 = 0;
    loop {
        if cancel.is_cancelled() {
            return Err(RetryError::Cancelled { op: op.to_string() });
        }
        attempt += 1;
        match call() {
            Ok(v) => {
                if attempt > 1 {
                    tracing::info!("{op}: succeeded on attempt {attempt}");
                }
                return Ok(v);
            }
            Err(RemoteError::Fatal(msg)) => {
                tracing::error!("{op}: {msg}");
                return Err(RetryError::Fatal { op: op.to_string(), msg });
            }
            Err(RemoteError::Retryable(msg)) => {
                if policy.max_attempts.is_some_and(|max| attempt >= max) {
                    return Err(RetryError::Exhausted { op: op.to_string(), attempts: attempt, last: msg });
                }
                tracing::warn!(
                    "{op}: attempt {attempt} failed ({msg}), trying again in {:?}",
                    policy.backoff
                );
                sleeper.sleep(policy.backoff);
            }
        }
    }
}
