// Bounded exponential backoff around any storage backend
use async_trait::async_trait;
use std::future::Future;
use std::time::Duration;

use super::{ByteStream, ObjectKey, Payload, StorageBackend, StoreError};
use crate::config::RetryConfig;

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl RetryPolicy {
    /// Delay before the given retry (1-based)
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.initial_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            initial_backoff: config.initial_backoff(),
            max_backoff: config.max_backoff(),
        }
    }
}

/// Retries transient failures of the wrapped backend
pub struct Retrying<S> {
    inner: S,
    policy: RetryPolicy,
}

impl<S: StorageBackend> Retrying<S> {
    pub fn new(inner: S, policy: RetryPolicy) -> Self {
        Self { inner, policy }
    }

    pub fn inner(&self) -> &S {
        &self.inner
    }

    async fn run<T, F, Fut>(&self, op: &'static str, key: &ObjectKey, mut f: F) -> Result<T, StoreError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, StoreError>>,
    {
        let mut attempt = 1;
        loop {
            match f().await {
                Err(e) if e.is_transient() && attempt < self.policy.max_attempts => {
                    let delay = self.policy.backoff(attempt);
                    tracing::warn!(
                        op,
                        %key,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Transient object store failure, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) if e.is_transient() => {
                    tracing::error!(op, %key, attempts = attempt, error = %e, "Object store retries exhausted");
                    return Err(e);
                }
                other => return other,
            }
        }
    }
}

#[async_trait]
impl<S: StorageBackend> StorageBackend for Retrying<S> {
    async fn put(&self, key: &ObjectKey, payload: &Payload) -> Result<(), StoreError> {
        self.run("put", key, || self.inner.put(key, payload)).await
    }

    async fn get(&self, key: &ObjectKey) -> Result<ByteStream, StoreError> {
        self.run("get", key, || self.inner.get(key)).await
    }

    async fn delete(&self, key: &ObjectKey) -> Result<(), StoreError> {
        self.run("delete", key, || self.inner.delete(key)).await
    }

    async fn stat(&self, key: &ObjectKey) -> Result<Option<u64>, StoreError> {
        self.run("stat", key, || self.inner.stat(key)).await
    }

    async fn presign(&self, key: &ObjectKey, expires_in: Duration) -> Result<Option<String>, StoreError> {
        self.run("presign", key, || self.inner.presign(key, expires_in)).await
    }

    fn name(&self) -> &'static str {
        self.inner.name()
    }
}
