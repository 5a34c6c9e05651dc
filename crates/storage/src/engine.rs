//! Storage engine: WAL + memtable.
//!
//! Every mutation is appended to the WAL before it is applied to the
//! memtable, so reopening the engine reproduces the last logged state.

use crate::entry::WalEntry;
use crate::memtable::Memtable;
use crate::wal::{FsyncPolicy, Wal, WalError};
use std::path::Path;

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("WAL error: {0}")]
    Wal(#[from] WalError),
    #[error("storage I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// The storage engine. All operations are synchronous (blocking I/O);
/// the async boundary is at [`crate::WalBackend`].
#[derive(Debug)]
pub struct StorageEngine {
    memtable: Memtable,
    wal: Wal,
}

impl StorageEngine {
    /// Open or create an engine in `data_dir`, replaying its WAL.
    pub fn open(data_dir: &Path, fsync: FsyncPolicy) -> Result<Self, StorageError> {
        std::fs::create_dir_all(data_dir)?;
        let wal_path = data_dir.join("wal.log");

        let entries = Wal::recover(&wal_path)?;
        let replayed = entries.len();
        let mut memtable = Memtable::new();
        for entry in entries {
            memtable.apply(entry);
        }

        let wal = Wal::open(&wal_path, fsync)?;

        tracing::info!(
            "storage engine opened: {} keys recovered from {} WAL entries at {:?}",
            memtable.len(),
            replayed,
            wal_path
        );

        Ok(Self { memtable, wal })
    }

    pub fn get(&self, key: &str) -> Option<String> {
        self.memtable.get(key).map(str::to_string)
    }

    pub fn set(&mut self, key: &str, value: &str) -> Result<(), StorageError> {
        self.wal.append(&WalEntry::set(key, value))?;
        self.memtable.set(key.to_string(), value.to_string());
        Ok(())
    }

    /// Remove a key. Deleting an absent key is a no-op and is not logged.
    pub fn delete(&mut self, key: &str) -> Result<(), StorageError> {
        if self.memtable.get(key).is_none() {
            return Ok(());
        }
        self.wal.append(&WalEntry::delete(key))?;
        self.memtable.remove(key);
        Ok(())
    }

    pub fn key_count(&self) -> usize {
        self.memtable.len()
    }

    pub fn keys(&self) -> Vec<String> {
        self.memtable.keys()
    }

    pub fn keys_with_prefix(&self, prefix: &str) -> Vec<String> {
        self.memtable.keys_with_prefix(prefix)
    }

    /// Sync the WAL to disk (for batch fsync mode).
    pub fn sync(&mut self) -> Result<(), StorageError> {
        self.wal.sync()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_engine_set_get() {
        let dir = TempDir::new().unwrap();
        let mut engine = StorageEngine::open(dir.path(), FsyncPolicy::None).unwrap();

        engine.set("k1", "v1").unwrap();
        assert_eq!(engine.get("k1").as_deref(), Some("v1"));
        assert!(engine.get("k2").is_none());
    }

    #[test]
    fn test_engine_crash_recovery() {
        let dir = TempDir::new().unwrap();

        {
            let mut engine = StorageEngine::open(dir.path(), FsyncPolicy::Always).unwrap();
            engine.set("k1", "v1").unwrap();
            engine.set("k2", "v2").unwrap();
            engine.set("k1", "v1b").unwrap();
            engine.delete("k2").unwrap();
            engine.set("k3", "v3").unwrap();
        }

        let engine = StorageEngine::open(dir.path(), FsyncPolicy::Always).unwrap();
        assert_eq!(engine.key_count(), 2);
        assert_eq!(engine.get("k1").as_deref(), Some("v1b"));
        assert!(engine.get("k2").is_none());
        assert_eq!(engine.get("k3").as_deref(), Some("v3"));
    }

    #[test]
    fn test_engine_delete_absent_is_noop() {
        let dir = TempDir::new().unwrap();
        let mut engine = StorageEngine::open(dir.path(), FsyncPolicy::None).unwrap();
        engine.delete("ghost").unwrap();
        assert_eq!(engine.key_count(), 0);
        drop(engine);
        assert!(Wal::replay(&dir.path().join("wal.log")).unwrap().is_empty());
    }

    #[test]
    fn test_engine_keys() {
        let dir = TempDir::new().unwrap();
        let mut engine = StorageEngine::open(dir.path(), FsyncPolicy::None).unwrap();

        engine.set("a:1", "v1").unwrap();
        engine.set("a:2", "v2").unwrap();
        engine.set("b:1", "v3").unwrap();

        assert_eq!(engine.keys(), vec!["a:1", "a:2", "b:1"]);
        assert_eq!(engine.keys_with_prefix("a:"), vec!["a:1", "a:2"]);
    }
}
