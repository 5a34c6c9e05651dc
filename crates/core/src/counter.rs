//! Named non-negative counters (open-ticket tallies and the like).

use crate::error::CoreError;
use crate::keyspace::StoreKey;
use deskvault_storage::Backend;
use std::sync::Arc;

pub struct Counters {
    backend: Arc<dyn Backend>,
}

impl std::fmt::Debug for Counters {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Counters").finish_non_exhaustive()
    }
}

impl Counters {
    pub fn new(backend: Arc<dyn Backend>) -> Self {
        Self { backend }
    }

    /// `None` if the counter has never been written.
    pub async fn get(&self, name: &str) -> Result<Option<u64>, CoreError> {
        let key = StoreKey::counter(name)?.to_string();
        match self.backend.get(&key).await? {
            Some(raw) => raw
                .trim()
                .parse::<u64>()
                .map(Some)
                .map_err(|e| CoreError::corrupt(&key, format!("counter {:?}: {}", raw, e))),
            None => Ok(None),
        }
    }

    /// Apply `delta` and return the new value. A result below zero is
    /// refused and nothing is written.
    pub async fn add(&self, name: &str, delta: i64) -> Result<u64, CoreError> {
        let current = self.get(name).await?.unwrap_or(0);
        let next = i128::from(current) + i128::from(delta);
        let next = u64::try_from(next).map_err(|_| {
            CoreError::Operation(format!(
                "counter {} would go from {} to {}",
                name, current, next
            ))
        })?;
        self.write(name, next).await?;
        Ok(next)
    }

    /// Put a counter back to `prior`, deleting it if it did not exist.
    pub async fn restore(&self, name: &str, prior: Option<u64>) -> Result<(), CoreError> {
        match prior {
            Some(value) => self.write(name, value).await,
            None => {
                let key = StoreKey::counter(name)?.to_string();
                self.backend.delete(&key).await?;
                Ok(())
            }
        }
    }

    async fn write(&self, name: &str, value: u64) -> Result<(), CoreError> {
        let key = StoreKey::counter(name)?.to_string();
        self.backend.set(&key, &value.to_string()).await?;
        Ok(())
    }
}
