//! Durable backend over the WAL-backed [`StorageEngine`].

use crate::backend::{check_size, Backend, BackendError};
use crate::engine::StorageEngine;
use crate::wal::FsyncPolicy;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::RwLock;

#[derive(Debug, Clone)]
pub struct WalBackend {
    engine: Arc<RwLock<StorageEngine>>,
    max_value_bytes: usize,
}

impl WalBackend {
    pub fn open(
        data_dir: &Path,
        fsync: FsyncPolicy,
        max_value_bytes: usize,
    ) -> Result<Self, BackendError> {
        let engine = StorageEngine::open(data_dir, fsync)?;
        Ok(Self {
            engine: Arc::new(RwLock::new(engine)),
            max_value_bytes,
        })
    }

    /// Flush and fsync the WAL.
    pub async fn sync(&self) -> Result<(), BackendError> {
        self.engine.write().await.sync()?;
        Ok(())
    }
}

#[async_trait::async_trait]
impl Backend for WalBackend {
    async fn get(&self, key: &str) -> Result<Option<String>, BackendError> {
        Ok(self.engine.read().await.get(key))
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), BackendError> {
        check_size(key, value, self.max_value_bytes)?;
        self.engine.write().await.set(key, value)?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), BackendError> {
        self.engine.write().await.delete(key)?;
        Ok(())
    }

    async fn list_keys(&self) -> Result<Vec<String>, BackendError> {
        Ok(self.engine.read().await.keys())
    }

    fn max_value_bytes(&self) -> usize {
        self.max_value_bytes
    }
}
