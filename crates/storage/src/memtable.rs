//! In-memory table holding the current value of every key.

use crate::entry::WalEntry;
use std::collections::BTreeMap;

/// Ordered key -> value map; iteration order is lexicographic by key.
#[derive(Debug, Default)]
pub struct Memtable {
    data: BTreeMap<String, String>,
}

impl Memtable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.data.get(key).map(String::as_str)
    }

    /// Returns the previous value, if any.
    pub fn set(&mut self, key: String, value: String) -> Option<String> {
        self.data.insert(key, value)
    }

    pub fn remove(&mut self, key: &str) -> Option<String> {
        self.data.remove(key)
    }

    /// Apply a logged mutation (used during WAL replay).
    pub fn apply(&mut self, entry: WalEntry) {
        match entry {
            WalEntry::Set { key, value, .. } => {
                self.data.insert(key, value);
            }
            WalEntry::Delete { key, .. } => {
                self.data.remove(&key);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// All keys, sorted.
    pub fn keys(&self) -> Vec<String> {
        self.data.keys().cloned().collect()
    }

    /// Keys starting with `prefix`, sorted.
    pub fn keys_with_prefix(&self, prefix: &str) -> Vec<String> {
        self.data
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, _)| k.clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memtable_set_get_remove() {
        let mut mt = Memtable::new();
        assert_eq!(mt.set("k1".into(), "v1".into()), None);
        assert_eq!(mt.set("k1".into(), "v2".into()), Some("v1".into()));
        assert_eq!(mt.get("k1"), Some("v2"));
        assert_eq!(mt.remove("k1"), Some("v2".into()));
        assert!(mt.get("k1").is_none());
        assert!(mt.is_empty());
    }

    #[test]
    fn test_memtable_apply_replay_order() {
        let mut mt = Memtable::new();
        mt.apply(WalEntry::set("k1", "v1"));
        mt.apply(WalEntry::set("k2", "v2"));
        mt.apply(WalEntry::set("k1", "v3"));
        mt.apply(WalEntry::delete("k2"));
        assert_eq!(mt.len(), 1);
        assert_eq!(mt.get("k1"), Some("v3"));
    }

    #[test]
    fn test_memtable_keys_sorted() {
        let mut mt = Memtable::new();
        mt.set("b".into(), "1".into());
        mt.set("a".into(), "2".into());
        mt.set("c".into(), "3".into());
        assert_eq!(mt.keys(), vec!["a", "b", "c"]);
    }

    #[test]
    fn test_memtable_keys_with_prefix() {
        let mut mt = Memtable::new();
        mt.set("rec:1".into(), "a".into());
        mt.set("rec:2".into(), "b".into());
        mt.set("idx:status".into(), "c".into());
        mt.set("red".into(), "d".into());

        assert_eq!(mt.keys_with_prefix("rec:"), vec!["rec:1", "rec:2"]);
        assert_eq!(mt.keys_with_prefix("idx:").len(), 1);
        assert!(mt.keys_with_prefix("nope:").is_empty());
    }
}
