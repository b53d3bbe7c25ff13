//! Bounded timeouts, exponential backoff and request pacing.
//!
//! Every remote call goes through [`with_timeout`] so one slow dependency
//! cannot stall unrelated work. HTTP clients additionally wrap each request
//! in [`RetryPolicy::run`], which retries only errors that
//! [`KbError::is_retryable`] accepts:
//!
//! - `RateLimited` with a `Retry-After` hint → sleep for the hint
//! - other retryable errors → `base * 2^attempt`, capped
//! - anything else → returned immediately

use std::future::Future;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::warn;

use crate::config::CrawlConfig;
use crate::error::{KbError, Result};

/// Await `fut`, failing with [`KbError::Timeout`] after `limit`.
pub async fn with_timeout<T, F>(limit: Duration, what: &str, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => Err(KbError::Timeout {
            what: what.to_string(),
            secs: limit.as_secs(),
        }),
    }
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    pub fn from_crawl(config: &CrawlConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            base_delay: Duration::from_millis(config.backoff_base_ms),
            max_delay: Duration::from_millis(config.backoff_cap_ms),
        }
    }

    /// No retries at all.
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    /// Delay before retry number `attempt` (0-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt.min(16)).unwrap_or(u32::MAX);
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    fn delay_for(&self, err: &KbError, attempt: u32) -> Duration {
        match err {
            KbError::RateLimited {
                retry_after: Some(hint),
                ..
            } => (*hint).min(self.max_delay),
            _ => self.backoff(attempt),
        }
    }

    /// Run `op` until it succeeds, fails with a non-retryable error, or
    /// the retry budget is spent.
    pub async fn run<T, F, Fut>(&self, what: &str, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 0;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(err) if err.is_retryable() && attempt < self.max_retries => {
                    let delay = self.delay_for(&err, attempt);
                    warn!(
                        what,
                        attempt = attempt + 1,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

/// Spaces requests evenly at a fixed rate.
///
/// Used by the content-source client so a bulk catch-up crawl does not
/// burst past the server's rate limit before any 429 arrives.
#[derive(Debug)]
pub struct RequestPacer {
    interval: Duration,
    next_slot: Mutex<Option<Instant>>,
}

impl RequestPacer {
    pub fn per_second(rate: f64) -> Self {
        Self {
            interval: Duration::from_secs_f64(1.0 / rate.max(0.001)),
            next_slot: Mutex::new(None),
        }
    }

    /// Wait until the next request slot.
    pub async fn wait(&self) {
        let sleep_until = {
            let mut next = self.next_slot.lock().await;
            let now = Instant::now();
            let slot = match *next {
                Some(slot) if slot > now => slot,
                _ => now,
            };
            *next = Some(slot + self.interval);
            slot
        };
        tokio::time::sleep_until(sleep_until).await;
    }
}
