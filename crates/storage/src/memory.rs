//! In-memory backend.

use crate::backend::{check_size, Backend, BackendError};
use crate::memtable::Memtable;
use tokio::sync::RwLock;

/// A volatile [`Backend`] over an ordered map.
#[derive(Debug)]
pub struct MemoryBackend {
    table: RwLock<Memtable>,
    max_value_bytes: usize,
}

impl MemoryBackend {
    pub fn new(max_value_bytes: usize) -> Self {
        Self {
            table: RwLock::new(Memtable::new()),
            max_value_bytes,
        }
    }

    pub async fn len(&self) -> usize {
        self.table.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.table.read().await.is_empty()
    }
}

#[async_trait::async_trait]
impl Backend for MemoryBackend {
    async fn get(&self, key: &str) -> Result<Option<String>, BackendError> {
        Ok(self.table.read().await.get(key).map(str::to_string))
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), BackendError> {
        check_size(key, value, self.max_value_bytes)?;
        self.table
            .write()
            .await
            .set(key.to_string(), value.to_string());
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), BackendError> {
        self.table.write().await.remove(key);
        Ok(())
    }

    async fn list_keys(&self) -> Result<Vec<String>, BackendError> {
        Ok(self.table.read().await.keys())
    }

    fn max_value_bytes(&self) -> usize {
        self.max_value_bytes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_backend_basic() {
        let backend = MemoryBackend::new(64);
        assert!(backend.get("k").await.unwrap().is_none());

        backend.set("k", "v").await.unwrap();
        assert_eq!(backend.get("k").await.unwrap().as_deref(), Some("v"));
        assert_eq!(backend.len().await, 1);

        backend.delete("k").await.unwrap();
        backend.delete("k").await.unwrap();
        assert!(backend.is_empty().await);
    }

    #[tokio::test]
    async fn test_memory_backend_enforces_ceiling() {
        let backend = MemoryBackend::new(8);
        backend.set("ok", "12345678").await.unwrap();

        let err = backend.set("big", "123456789").await.unwrap_err();
        match err {
            BackendError::ValueTooLarge { key, size, limit } => {
                assert_eq!(key, "big");
                assert_eq!(size, 9);
                assert_eq!(limit, 8);
            }
            other => panic!("unexpected error {:?}", other),
        }
        assert!(backend.get("big").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_memory_backend_list_keys_ordered() {
        let backend = MemoryBackend::new(64);
        for key in ["c", "a", "b"] {
            backend.set(key, "x").await.unwrap();
        }
        assert_eq!(backend.list_keys().await.unwrap(), vec!["a", "b", "c"]);
    }
}
