//! Bounded retry with exponential backoff for blob store calls.
//!
//! [`RetryPolicy`] decides whether a failed call is worth repeating and how
//! long to wait; [`RetryingStore`] applies it uniformly to every operation of
//! a wrapped [`BlobStore`].
//!
//! Only transient failures (`AppError::is_transient`) are retried. Not-found,
//! authorization and malformed-path errors surface on the first attempt.
//!
//! # Delay Calculation
//!
//! ```text
//! delay = min(base_delay * multiplier^(attempt - 1), max_delay) + jitter
//! ```

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;

use crate::error::{AppError, Result};
use crate::models::RetryConfig;
use crate::storage::BlobStore;

/// Decision on whether to retry a failed call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    /// Retry after the specified delay.
    Retry {
        delay: Duration,
        /// Which attempt comes next (1-indexed, so the first retry is 2)
        attempt: u32,
    },

    /// Give up and surface the error.
    DoNotRetry { reason: String },
}

/// Configuration for retry behavior with exponential backoff.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Maximum number of attempts (including the initial attempt).
    max_attempts: u32,
    base_delay: Duration,
    max_delay: Duration,
    backoff_multiplier: f64,
    max_jitter: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&RetryConfig::default())
    }
}

impl RetryPolicy {
    #[must_use]
    pub fn new(
        max_attempts: u32,
        base_delay: Duration,
        max_delay: Duration,
        backoff_multiplier: f64,
        max_jitter: Duration,
    ) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
            max_delay,
            backoff_multiplier: backoff_multiplier.max(1.0),
            max_jitter,
        }
    }

    #[must_use]
    pub fn from_config(config: &RetryConfig) -> Self {
        Self::new(
            config.max_attempts,
            Duration::from_millis(config.base_delay_ms),
            Duration::from_millis(config.max_delay_ms),
            config.backoff_multiplier,
            Duration::from_millis(config.max_jitter_ms),
        )
    }

    /// A policy that never retries.
    #[must_use]
    pub fn none() -> Self {
        Self::new(1, Duration::ZERO, Duration::ZERO, 1.0, Duration::ZERO)
    }

    #[must_use]
    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Decide what to do after `attempt` (1-indexed) failed with `error`.
    pub fn should_retry(&self, error: &AppError, attempt: u32) -> RetryDecision {
        if !error.is_transient() {
            return RetryDecision::DoNotRetry {
                reason: "permanent failure - retry would not help".to_string(),
            };
        }

        if attempt >= self.max_attempts {
            return RetryDecision::DoNotRetry {
                reason: format!("max attempts ({}) exhausted", self.max_attempts),
            };
        }

        RetryDecision::Retry {
            delay: self.calculate_delay(attempt),
            attempt: attempt + 1,
        }
    }

    fn calculate_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1) as i32;
        let delay_ms = self.base_delay.as_millis() as f64 * self.backoff_multiplier.powi(exponent);
        let capped_ms = delay_ms.min(self.max_delay.as_millis() as f64);
        Duration::from_millis(capped_ms as u64) + self.calculate_jitter()
    }

    fn calculate_jitter(&self) -> Duration {
        let max = self.max_jitter.as_millis() as u64;
        if max == 0 {
            return Duration::ZERO;
        }
        Duration::from_millis(rand::thread_rng().gen_range(0..=max))
    }

    /// Run `op` until it succeeds, fails permanently or the budget runs out.
    ///
    /// A transient failure on the last attempt is wrapped in
    /// `AppError::RetriesExhausted`.
    pub async fn run<T, F, Fut>(&self, operation: &'static str, path: &str, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 1;
        loop {
            let error = match op().await {
                Ok(value) => return Ok(value),
                Err(e) => e,
            };

            match self.should_retry(&error, attempt) {
                RetryDecision::Retry {
                    delay,
                    attempt: next,
                } => {
                    log::debug!(
                        "{} {} failed (attempt {}/{}): {}; retrying in {:?}",
                        operation,
                        path,
                        attempt,
                        self.max_attempts,
                        error,
                        delay
                    );
                    tokio::time::sleep(delay).await;
                    attempt = next;
                }
                RetryDecision::DoNotRetry { reason } => {
                    if !error.is_transient() {
                        return Err(error);
                    }
                    log::warn!("{} {} giving up: {}", operation, path, reason);
                    return Err(AppError::RetriesExhausted {
                        operation,
                        path: path.to_string(),
                        attempts: attempt,
                        source: Box::new(error),
                    });
                }
            }
        }
    }
}

/// Blob store decorator applying a [`RetryPolicy`] to every call.
pub struct RetryingStore<S> {
    inner: S,
    policy: RetryPolicy,
}

impl<S: BlobStore> RetryingStore<S> {
    pub fn new(inner: S, policy: RetryPolicy) -> Self {
        Self { inner, policy }
    }

    pub fn inner(&self) -> &S {
        &self.inner
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }
}

#[async_trait]
impl<S: BlobStore> BlobStore for RetryingStore<S> {
    async fn get(&self, path: &str) -> Result<Vec<u8>> {
        self.policy.run("get", path, || self.inner.get(path)).await
    }

    async fn put(&self, path: &str, bytes: Vec<u8>) -> Result<()> {
        self.policy
            .run("put", path, || self.inner.put(path, bytes.clone()))
            .await
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        self.policy.run("list", prefix, || self.inner.list(prefix)).await
    }

    async fn delete(&self, path: &str) -> Result<()> {
        self.policy.run("delete", path, || self.inner.delete(path)).await
    }

    fn describe(&self) -> String {
        self.inner.describe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{Fault, MemoryStorage};

    fn fast_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy::new(
            max_attempts,
            Duration::from_millis(1),
            Duration::from_millis(4),
            2.0,
            Duration::ZERO,
        )
    }

    #[test]
    fn test_default_policy_values() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_attempts(), 5);
        assert_eq!(policy.base_delay, Duration::from_millis(200));
        assert_eq!(policy.max_delay, Duration::from_secs(10));
    }

    #[test]
    fn test_max_attempts_minimum_is_one() {
        let policy = RetryPolicy::new(0, Duration::ZERO, Duration::ZERO, 2.0, Duration::ZERO);
        assert_eq!(policy.max_attempts(), 1);
    }

    #[test]
    fn test_delay_doubles_and_caps() {
        let policy = RetryPolicy::new(
            10,
            Duration::from_secs(1),
            Duration::from_secs(5),
            2.0,
            Duration::ZERO,
        );
        assert_eq!(policy.calculate_delay(1), Duration::from_secs(1));
        assert_eq!(policy.calculate_delay(2), Duration::from_secs(2));
        assert_eq!(policy.calculate_delay(3), Duration::from_secs(4));
        assert_eq!(policy.calculate_delay(6), Duration::from_secs(5));
    }

    #[test]
    fn test_jitter_within_bounds() {
        let policy = RetryPolicy::new(
            3,
            Duration::from_millis(100),
            Duration::from_secs(1),
            2.0,
            Duration::from_millis(50),
        );
        for _ in 0..100 {
            let delay = policy.calculate_delay(1);
            assert!(delay >= Duration::from_millis(100));
            assert!(delay <= Duration::from_millis(150));
        }
    }

    #[test]
    fn test_permanent_errors_do_not_retry() {
        let policy = RetryPolicy::default();
        for error in [
            AppError::permanent("p", "denied"),
            AppError::not_found("p"),
            AppError::invalid_path("..", "dot segment"),
        ] {
            assert!(matches!(
                policy.should_retry(&error, 1),
                RetryDecision::DoNotRetry { .. }
            ));
        }
    }

    #[test]
    fn test_transient_retries_until_exhausted() {
        let policy = fast_policy(3);
        let error = AppError::transient("p", "timeout");
        assert!(matches!(
            policy.should_retry(&error, 1),
            RetryDecision::Retry { attempt: 2, .. }
        ));
        assert!(matches!(
            policy.should_retry(&error, 2),
            RetryDecision::Retry { attempt: 3, .. }
        ));
        match policy.should_retry(&error, 3) {
            RetryDecision::DoNotRetry { reason } => assert!(reason.contains("exhausted")),
            other => panic!("expected DoNotRetry, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_store_recovers_from_transient_faults() {
        let memory = MemoryStorage::new();
        memory.inject(Fault::Transient, 2);
        let store = RetryingStore::new(memory.clone(), fast_policy(3));

        store.put("job/a", b"v".to_vec()).await.unwrap();
        assert_eq!(memory.calls(), 3);
        assert_eq!(store.get("job/a").await.unwrap(), b"v");
    }

    #[tokio::test]
    async fn test_store_gives_up_after_budget() {
        let memory = MemoryStorage::new();
        memory.set_offline(true);
        let store = RetryingStore::new(memory.clone(), fast_policy(4));

        let err = store.list("job/").await.unwrap_err();
        assert!(matches!(err, AppError::RetriesExhausted { attempts: 4, .. }));
        assert_eq!(memory.calls(), 4);
    }

    #[tokio::test]
    async fn test_store_surfaces_permanent_immediately() {
        let memory = MemoryStorage::new();
        memory.inject(Fault::Permanent, 1);
        let store = RetryingStore::new(memory.clone(), fast_policy(5));

        let err = store.get("job/a").await.unwrap_err();
        assert!(matches!(err, AppError::PermanentStore { .. }));
        assert_eq!(memory.calls(), 1);

        let err = store.get("job/a").await.unwrap_err();
        assert!(err.is_not_found());
        assert_eq!(memory.calls(), 2);
    }
}
