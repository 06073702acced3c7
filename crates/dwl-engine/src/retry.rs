//! Chunk-level retry with exponential backoff and full jitter. Only
//! transient store errors are retried; permanent ones fail the chunk
//! immediately and the run carries on with the other chunks.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tracing::warn;

use dwl_config::CoreConfig;
use dwl_store::StoreError;

#[derive(Debug, Clone, Copy)]
pub struct RetryHandler {
    pub max_retries: u32,
    pub base_ms: u64,
    pub cap_ms: u64,
}

impl RetryHandler {
    pub fn from_config(config: &CoreConfig) -> Self {
        Self {
            max_retries: config.retry_max,
            base_ms: config.retry_base_ms,
            cap_ms: config.retry_cap_ms,
        }
    }

    /// Backoff before attempt `n` (1-based): full jitter over
    /// `min(cap, base * 2^(n-1))`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exp = self
            .base_ms
            .saturating_mul(1u64 << (attempt - 1).min(20))
            .min(self.cap_ms);
        let jittered = rand::thread_rng().gen_range(0..=exp);
        Duration::from_millis(jittered)
    }

    pub async fn run<T, F, Fut>(&self, what: &str, mut op: F) -> Result<T, StoreError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, StoreError>>,
    {
        let mut attempt = 0u32;
        loop {
            match op().await {
                Ok(v) => return Ok(v),
                Err(e) if e.is_transient() && attempt < self.max_retries => {
                    attempt += 1;
                    let delay = self.delay_for_attempt(attempt);
                    warn!(
                        what,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "transient failure, backing off"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;

    fn handler() -> RetryHandler {
        RetryHandler {
            max_retries: 3,
            base_ms: 1,
            cap_ms: 4,
        }
    }

    #[tokio::test]
    async fn transient_errors_are_retried_until_success() {
        let attempts = AtomicU32::new(0);
        let out: Result<u32, _> = handler()
            .run("op", || {
                let n = attempts.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 2 {
                        Err(dwl_store::StoreError::Transient(sqlx::Error::PoolTimedOut))
                    } else {
                        Ok(7)
                    }
                }
            })
            .await;
        assert_eq!(out.unwrap(), 7);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn permanent_errors_fail_fast() {
        let attempts = AtomicU32::new(0);
        let out: Result<(), _> = handler()
            .run("op", || {
                attempts.fetch_add(1, Ordering::SeqCst);
                async { Err(dwl_store::StoreError::Permanent(sqlx::Error::RowNotFound)) }
            })
            .await;
        assert!(out.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn retries_are_bounded() {
        let attempts = AtomicU32::new(0);
        let out: Result<(), _> = handler()
            .run("op", || {
                attempts.fetch_add(1, Ordering::SeqCst);
                async { Err(dwl_store::StoreError::Transient(sqlx::Error::PoolTimedOut)) }
            })
            .await;
        assert!(out.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 4); // initial + 3 retries
    }

    #[test]
    fn delay_is_capped() {
        let h = RetryHandler {
            max_retries: 3,
            base_ms: 500,
            cap_ms: 30_000,
        };
        for attempt in 1..=10 {
            assert!(h.delay_for_attempt(attempt) <= Duration::from_millis(30_000));
        }
    }
}
