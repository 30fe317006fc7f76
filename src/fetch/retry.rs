//! Retry with exponential backoff, plus a cap on concurrent downloads.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::Semaphore;
use tracing::{debug, warn};

use super::{FetchError, ShardFetcher, ShardMeta, ShardSource};
use crate::config::DistributionConfig;

/// Backoff schedule for transient fetch failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    pub max_retries: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &DistributionConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            initial_delay: Duration::from_millis(config.initial_retry_delay_ms),
            max_delay: Duration::from_millis(config.max_retry_delay_ms),
        }
    }

    /// Delay before retry number `retry` (0-based): doubles each time, capped.
    pub fn delay_for(&self, retry: u32) -> Duration {
        let factor = 1u32.checked_shl(retry).unwrap_or(u32::MAX);
        self.initial_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RetryStats {
    pub attempts: u64,
    pub retries: u64,
    pub failures: u64,
}

/// Wraps a fetcher with retries and a download concurrency limit.
pub struct RetryingFetcher<F> {
    inner: F,
    policy: RetryPolicy,

    /// `None` when downloads are unbounded.
    downloads: Option<Arc<Semaphore>>,

    attempts: AtomicU64,
    retries: AtomicU64,
    failures: AtomicU64,
}

impl<F: ShardFetcher> RetryingFetcher<F> {
    /// `concurrent_downloads == 0` disables the limit.
    pub fn new(inner: F, policy: RetryPolicy, concurrent_downloads: usize) -> Self {
        Self {
            inner,
            policy,
            downloads: (concurrent_downloads > 0)
                .then(|| Arc::new(Semaphore::new(concurrent_downloads))),
            attempts: AtomicU64::new(0),
            retries: AtomicU64::new(0),
            failures: AtomicU64::new(0),
        }
    }

    pub fn from_config(inner: F, config: &DistributionConfig) -> Self {
        Self::new(inner, RetryPolicy::from_config(config), config.concurrent_downloads)
    }

    pub fn inner(&self) -> &F {
        &self.inner
    }

    pub fn stats(&self) -> RetryStats {
        RetryStats {
            attempts: self.attempts.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
        }
    }
}

#[async_trait]
impl<F: ShardFetcher> ShardFetcher for RetryingFetcher<F> {
    fn source(&self) -> ShardSource {
        self.inner.source()
    }

    async fn fetch(&self, meta: &ShardMeta) -> Result<Bytes, FetchError> {
        let _permit = match &self.downloads {
            Some(sem) => Some(
                sem.acquire()
                    .await
                    .map_err(|_| FetchError::Network("download limiter closed".into()))?,
            ),
            None => None,
        };

        let mut retry = 0;
        loop {
            self.attempts.fetch_add(1, Ordering::Relaxed);
            match self.inner.fetch(meta).await {
                Ok(bytes) => {
                    if retry > 0 {
                        debug!(shard = meta.index, retries = retry, "Fetch succeeded after retry");
                    }
                    return Ok(bytes);
                }
                Err(e) if e.is_transient() && retry < self.policy.max_retries => {
                    let delay = self.policy.delay_for(retry);
                    warn!(
                        shard = meta.index,
                        attempt = retry + 1,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Shard fetch failed, retrying"
                    );
                    self.retries.fetch_add(1, Ordering::Relaxed);
                    tokio::time::sleep(delay).await;
                    retry += 1;
                }
                Err(e) => {
                    self.failures.fetch_add(1, Ordering::Relaxed);
                    return Err(e);
                }
            }
        }
    }
}
