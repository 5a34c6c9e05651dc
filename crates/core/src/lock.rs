//! Process-wide mutual exclusion with a bounded wait.

use crate::error::CoreError;
use std::time::Duration;
use tokio::sync::{Mutex, MutexGuard};

/// Held for the lifetime of a critical section; released on drop.
pub type LockGuard<'a> = MutexGuard<'a, ()>;

/// A named mutex whose acquisition gives up after `timeout`.
///
/// Acquisition is first come, first served; there is no priority scheme.
#[derive(Debug)]
pub struct GlobalLock {
    name: &'static str,
    mutex: Mutex<()>,
    timeout: Duration,
}

impl GlobalLock {
    pub fn new(name: &'static str, timeout: Duration) -> Self {
        Self {
            name,
            mutex: Mutex::new(()),
            timeout,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub async fn acquire(&self) -> Result<LockGuard<'_>, CoreError> {
        match tokio::time::timeout(self.timeout, self.mutex.lock()).await {
            Ok(guard) => Ok(guard),
            Err(_) => {
                deskvault_metrics::metrics().lock_timeouts.inc();
                tracing::warn!("gave up on the {} lock after {:?}", self.name, self.timeout);
                Err(CoreError::LockTimeout {
                    lock: self.name,
                    waited: self.timeout,
                })
            }
        }
    }
}
