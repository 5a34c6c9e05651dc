//! Chaos injection wrapper for [`Backend`].
//!
//! [`ChaosBackend`] wraps any backend and injects configurable failures:
//! random errors, writes blocked by key prefix, a write budget after which
//! every write fails, and latency.

use crate::backend::{Backend, BackendError};
use rand::Rng;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio::time::Duration;

/// Configuration for backend chaos injection.
#[derive(Debug, Clone)]
pub struct ChaosConfig {
    /// Probability of failing any call \[0.0, 1.0\].
    pub failure_rate: f64,
    /// Fixed latency injected before forwarding.
    pub latency: Duration,
}

impl Default for ChaosConfig {
    fn default() -> Self {
        Self {
            failure_rate: 0.0,
            latency: Duration::ZERO,
        }
    }
}

pub struct ChaosBackend<B: Backend> {
    inner: Arc<B>,
    config: RwLock<ChaosConfig>,
    /// Writes (set/delete) to keys with these prefixes fail.
    failed_prefixes: RwLock<HashSet<String>>,
    /// Remaining writes allowed before every write fails; `None` = unlimited.
    write_budget: RwLock<Option<usize>>,
}

impl<B: Backend> std::fmt::Debug for ChaosBackend<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChaosBackend").finish_non_exhaustive()
    }
}

impl<B: Backend> ChaosBackend<B> {
    pub fn new(inner: B, config: ChaosConfig) -> Self {
        Self::wrap(Arc::new(inner), config)
    }

    /// Wrap a backend that is also used directly elsewhere.
    pub fn wrap(inner: Arc<B>, config: ChaosConfig) -> Self {
        Self {
            inner,
            config: RwLock::new(config),
            failed_prefixes: RwLock::new(HashSet::new()),
            write_budget: RwLock::new(None),
        }
    }

    pub fn inner(&self) -> &Arc<B> {
        &self.inner
    }

    /// Fail every write to a key starting with `prefix`.
    pub async fn fail_prefix(&self, prefix: &str) {
        self.failed_prefixes.write().await.insert(prefix.to_string());
    }

    pub async fn recover_prefix(&self, prefix: &str) {
        self.failed_prefixes.write().await.remove(prefix);
    }

    /// Allow `n` more writes, then fail all writes until [`Self::clear_write_budget`].
    pub async fn fail_writes_after(&self, n: usize) {
        *self.write_budget.write().await = Some(n);
    }

    pub async fn clear_write_budget(&self) {
        *self.write_budget.write().await = None;
    }

    pub async fn set_failure_rate(&self, rate: f64) {
        self.config.write().await.failure_rate = rate;
    }

    /// Latency and random failure, applied to every call.
    async fn maybe_fail(&self) -> Result<(), BackendError> {
        let (delay, failure_rate) = {
            let config = self.config.read().await;
            (config.latency, config.failure_rate)
        };

        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        if failure_rate > 0.0 && rand::thread_rng().gen_bool(failure_rate.min(1.0)) {
            return Err(BackendError::Unavailable("chaos: random failure".into()));
        }
        Ok(())
    }

    async fn maybe_fail_write(&self, key: &str) -> Result<(), BackendError> {
        self.maybe_fail().await?;

        {
            let failed = self.failed_prefixes.read().await;
            if failed.iter().any(|p| key.starts_with(p.as_str())) {
                return Err(BackendError::Unavailable(format!(
                    "chaos: writes to {:?} blocked",
                    key
                )));
            }
        }

        let mut budget = self.write_budget.write().await;
        match budget.as_mut() {
            Some(0) => Err(BackendError::Unavailable(
                "chaos: write budget exhausted".into(),
            )),
            Some(n) => {
                *n -= 1;
                Ok(())
            }
            None => Ok(()),
        }
    }
}

#[async_trait::async_trait]
impl<B: Backend> Backend for ChaosBackend<B> {
    async fn get(&self, key: &str) -> Result<Option<String>, BackendError> {
        self.maybe_fail().await?;
        self.inner.get(key).await
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), BackendError> {
        self.maybe_fail_write(key).await?;
        self.inner.set(key, value).await
    }

    async fn delete(&self, key: &str) -> Result<(), BackendError> {
        self.maybe_fail_write(key).await?;
        self.inner.delete(key).await
    }

    async fn list_keys(&self) -> Result<Vec<String>, BackendError> {
        self.maybe_fail().await?;
        self.inner.list_keys().await
    }

    fn max_value_bytes(&self) -> usize {
        self.inner.max_value_bytes()
    }
}

// ────────────────────────── Tests ──────────────────────────
