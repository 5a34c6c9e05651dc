//! Secondary indexes: field value -> set of record ids.
//!
//! Indexes are a lossy fast path, never a source of truth. A malformed
//! entry reads as empty, stale members are allowed, and an entry that
//! grows past `max_entries` is trimmed to the `evict_to` most recently
//! created members. Ranking members reads each one's `createdAt` from
//! the record store, so eviction costs one record read per member. It
//! only runs on overflow.
//!
//! An entry is stored under [`StoreKey::Index`]. Small sets are kept
//! inline in that value; sets that would not fit under the backend's
//! ceiling are spread over [`StoreKey::IndexPage`] values and the head
//! records only the page count.

use crate::error::CoreError;
use crate::keyspace::StoreKey;
use deskvault_common::{format_day, Record, RecordId};
use deskvault_config::{IndexConfig, IndexField, IndexKind};
use deskvault_storage::Backend;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::cmp::Reverse;
use std::collections::BTreeSet;
use std::sync::Arc;

/// Resolves a record's creation time for eviction ranking.
#[async_trait::async_trait]
pub trait CreatedAtSource: Send + Sync {
    /// `None` when the record is gone, unreadable, or has no `createdAt`.
    async fn created_at(&self, id: &RecordId) -> Option<u64>;
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct IndexHead {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    members: Vec<RecordId>,
    #[serde(default, skip_serializing_if = "is_zero")]
    pages: u32,
}

fn is_zero(n: &u32) -> bool {
    *n == 0
}

/// A loaded entry plus how many pages it occupied, for cleanup on rewrite.
struct LoadedEntry {
    members: BTreeSet<RecordId>,
    pages: u32,
}

pub struct IndexManager {
    backend: Arc<dyn Backend>,
    fields: Vec<IndexField>,
    max_entries: usize,
    evict_to: usize,
}

impl std::fmt::Debug for IndexManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IndexManager")
            .field("fields", &self.fields)
            .field("max_entries", &self.max_entries)
            .field("evict_to", &self.evict_to)
            .finish_non_exhaustive()
    }
}

impl IndexManager {
    pub fn new(backend: Arc<dyn Backend>, config: &IndexConfig) -> Self {
        Self {
            backend,
            fields: config.fields.clone(),
            max_entries: config.max_entries,
            evict_to: config.evict_to,
        }
    }

    pub fn fields(&self) -> &[IndexField] {
        &self.fields
    }

    /// The bucket `record` falls into for every configured index it has a
    /// value for, as `(index name, value)` pairs.
    pub fn entries_for(&self, record: &Record) -> Vec<(String, String)> {
        self.fields
            .iter()
            .filter_map(|f| {
                let value = index_value(record.field(&f.field)?, f.kind)?;
                Some((f.name.clone(), value))
            })
            .collect()
    }

    /// Add `id` under `(name, value)`, evicting if the entry overflows.
    pub async fn update(
        &self,
        name: &str,
        value: &str,
        id: &RecordId,
        source: &dyn CreatedAtSource,
    ) -> Result<(), CoreError> {
        let head = StoreKey::index(name, value)?;
        let mut entry = self.load(&head).await?;
        if !entry.members.insert(id.clone()) {
            return Ok(());
        }
        if entry.members.len() > self.max_entries {
            let before = entry.members.len();
            entry.members = self.evict(entry.members, source).await;
            deskvault_metrics::metrics().index_evictions.inc();
            tracing::warn!(
                "index {}={:?} overflowed: evicted {} of {} members",
                name,
                value,
                before - entry.members.len(),
                before
            );
        }
        self.store(name, value, &entry.members, entry.pages).await
    }

    /// Drop `id` from `(name, value)`.
    pub async fn remove(&self, name: &str, value: &str, id: &RecordId) -> Result<(), CoreError> {
        let head = StoreKey::index(name, value)?;
        let mut entry = self.load(&head).await?;
        if entry.members.remove(id) {
            self.store(name, value, &entry.members, entry.pages).await?;
        }
        Ok(())
    }

    /// The ids currently indexed under `(name, value)`. May be stale and,
    /// after eviction, incomplete.
    pub async fn lookup(&self, name: &str, value: &str) -> Result<BTreeSet<RecordId>, CoreError> {
        let head = StoreKey::index(name, value)?;
        Ok(self.load(&head).await?.members)
    }

    /// Intersection of several lookups. No criteria yields no ids.
    pub async fn search(
        &self,
        criteria: &[(&str, &str)],
    ) -> Result<BTreeSet<RecordId>, CoreError> {
        let mut result: Option<BTreeSet<RecordId>> = None;
        for (name, value) in criteria {
            let ids = self.lookup(name, value).await?;
            let narrowed = match result {
                Some(acc) => acc.intersection(&ids).cloned().collect(),
                None => ids,
            };
            if narrowed.is_empty() {
                return Ok(narrowed);
            }
            result = Some(narrowed);
        }
        Ok(result.unwrap_or_default())
    }

    async fn evict(
        &self,
        members: BTreeSet<RecordId>,
        source: &dyn CreatedAtSource,
    ) -> BTreeSet<RecordId> {
        let mut ranked = Vec::with_capacity(members.len());
        for id in members {
            let created = source.created_at(&id).await;
            ranked.push((created, id));
        }
        // Newest first; unknown creation time ranks oldest. Ties by id.
        ranked.sort_by(|a, b| Reverse(&a.0).cmp(&Reverse(&b.0)).then_with(|| a.1.cmp(&b.1)));
        ranked.truncate(self.evict_to);
        ranked.into_iter().map(|(_, id)| id).collect()
    }

    async fn load(&self, head: &StoreKey) -> Result<LoadedEntry, CoreError> {
        let (name, value) = match head {
            StoreKey::Index { name, value } => (name, value),
            other => return Err(CoreError::Operation(format!("{} is not an index key", other))),
        };
        let Some(text) = self.backend.get(&head.to_string()).await? else {
            return Ok(LoadedEntry {
                members: BTreeSet::new(),
                pages: 0,
            });
        };
        let parsed: IndexHead = match serde_json::from_str(&text) {
            Ok(h) => h,
            Err(e) => {
                degraded(head, &e);
                return Ok(LoadedEntry {
                    members: BTreeSet::new(),
                    pages: 0,
                });
            }
        };

        let mut members: BTreeSet<RecordId> = parsed.members.into_iter().collect();
        for page in 0..parsed.pages {
            let key = StoreKey::index_page(name, value, page)?;
            match self.backend.get(&key.to_string()).await? {
                Some(text) => match serde_json::from_str::<Vec<RecordId>>(&text) {
                    Ok(ids) => members.extend(ids),
                    Err(e) => degraded(&key, &e),
                },
                None => degraded(&key, &"page missing"),
            }
        }
        Ok(LoadedEntry {
            members,
            pages: parsed.pages,
        })
    }

    async fn store(
        &self,
        name: &str,
        value: &str,
        members: &BTreeSet<RecordId>,
        old_pages: u32,
    ) -> Result<(), CoreError> {
        let head = StoreKey::index(name, value)?.to_string();
        let ceiling = self.backend.max_value_bytes();

        let new_pages = if members.is_empty() {
            self.backend.delete(&head).await?;
            0
        } else {
            let inline = serde_json::to_string(&IndexHead {
                members: members.iter().cloned().collect(),
                pages: 0,
            })?;
            if inline.len() < ceiling {
                self.backend.set(&head, &inline).await?;
                0
            } else {
                let pages = paginate(members, ceiling);
                for (i, page) in pages.iter().enumerate() {
                    let key = StoreKey::index_page(name, value, i as u32)?;
                    self.backend
                        .set(&key.to_string(), &serde_json::to_string(page)?)
                        .await?;
                }
                let count = pages.len() as u32;
                let head_value = serde_json::to_string(&IndexHead {
                    members: Vec::new(),
                    pages: count,
                })?;
                self.backend.set(&head, &head_value).await?;
                count
            }
        };

        for page in new_pages..old_pages {
            let key = StoreKey::index_page(name, value, page)?;
            self.backend.delete(&key.to_string()).await?;
        }
        Ok(())
    }
}

fn degraded(key: &StoreKey, err: &dyn std::fmt::Display) {
    deskvault_metrics::metrics().index_corrupt_reads.inc();
    tracing::warn!("index entry {} unreadable ({}); treating as empty", key, err);
}

/// Render a field value as an index bucket. Only scalars are indexable.
fn index_value(value: &Value, kind: IndexKind) -> Option<String> {
    match kind {
        IndexKind::Day => value.as_u64().map(format_day),
        IndexKind::Value => match value {
            Value::String(s) => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            Value::Bool(b) => Some(b.to_string()),
            _ => None,
        },
    }
}

/// Split ids into JSON arrays that each serialize below `ceiling` bytes.
fn paginate(members: &BTreeSet<RecordId>, ceiling: usize) -> Vec<Vec<RecordId>> {
    let mut pages = Vec::new();
    let mut page: Vec<RecordId> = Vec::new();
    // "[]"
    let mut size = 2;
    for id in members {
        // quotes plus a separating comma
        let cost = id.as_str().len() + 2 + usize::from(!page.is_empty());
        if !page.is_empty() && size + cost >= ceiling {
            pages.push(std::mem::take(&mut page));
            size = 2;
        }
        size += id.as_str().len() + 2 + usize::from(!page.is_empty());
        page.push(id.clone());
    }
    if !page.is_empty() {
        pages.push(page);
    }
    pages
}

#[cfg(test)]
mod tests {
    use super::*;
    use deskvault_storage::MemoryBackend;
    use serde_json::json;
    use std::collections::HashMap;

    fn rid(s: &str) -> RecordId {
        RecordId::new(s).unwrap()
    }

    struct FixedCreatedAt(HashMap<RecordId, u64>);

    #[async_trait::async_trait]
    impl CreatedAtSource for FixedCreatedAt {
        async fn created_at(&self, id: &RecordId) -> Option<u64> {
            self.0.get(id).copied()
        }
    }

    fn manager(ceiling: usize, max_entries: usize, evict_to: usize) -> (Arc<MemoryBackend>, IndexManager) {
        let backend = Arc::new(MemoryBackend::new(ceiling));
        let config = IndexConfig {
            max_entries,
            evict_to,
            ..IndexConfig::default()
        };
        (backend.clone(), IndexManager::new(backend, &config))
    }

    #[tokio::test]
    async fn test_update_and_lookup() {
        let (_, idx) = manager(8192, 1000, 500);
        let none = FixedCreatedAt(HashMap::new());

        idx.update("status", "open", &rid("T-1"), &none).await.unwrap();
        idx.update("status", "open", &rid("T-2"), &none).await.unwrap();
        idx.update("status", "open", &rid("T-1"), &none).await.unwrap();
        idx.update("status", "closed", &rid("T-3"), &none).await.unwrap();

        let open = idx.lookup("status", "open").await.unwrap();
        assert_eq!(open, [rid("T-1"), rid("T-2")].into_iter().collect());
        assert!(idx.lookup("status", "pending").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_remove_member() {
        let (backend, idx) = manager(8192, 1000, 500);
        let none = FixedCreatedAt(HashMap::new());
        idx.update("priority", "high", &rid("T-1"), &none).await.unwrap();
        idx.remove("priority", "high", &rid("T-1")).await.unwrap();

        assert!(idx.lookup("priority", "high").await.unwrap().is_empty());
        assert!(backend.is_empty().await, "empty entry should be deleted");
    }

    #[tokio::test]
    async fn test_corrupt_entry_reads_as_empty() {
        let (backend, idx) = manager(8192, 1000, 500);
        let key = StoreKey::index("status", "open").unwrap().to_string();
        backend.set(&key, "{not json").await.unwrap();

        assert!(idx.lookup("status", "open").await.unwrap().is_empty());

        // The next update overwrites the corrupt entry.
        let none = FixedCreatedAt(HashMap::new());
        idx.update("status", "open", &rid("T-9"), &none).await.unwrap();
        assert_eq!(idx.lookup("status", "open").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_eviction_keeps_newest() {
        let (_, idx) = manager(8192, 10, 5);
        let created: HashMap<RecordId, u64> =
            (0..11).map(|i| (rid(&format!("T-{}", i)), 1_000 + i as u64)).collect();
        let source = FixedCreatedAt(created);

        for i in 0..10 {
            idx.update("status", "open", &rid(&format!("T-{}", i)), &source)
                .await
                .unwrap();
        }
        assert_eq!(idx.lookup("status", "open").await.unwrap().len(), 10);

        idx.update("status", "open", &rid("T-10"), &source).await.unwrap();
        let kept = idx.lookup("status", "open").await.unwrap();
        let expected: BTreeSet<RecordId> = (6..11).map(|i| rid(&format!("T-{}", i))).collect();
        assert_eq!(kept, expected);
    }

    #[tokio::test]
    async fn test_eviction_ranks_unknown_as_oldest() {
        let (_, idx) = manager(8192, 3, 2);
        let source = FixedCreatedAt(
            [(rid("old"), 1u64), (rid("new"), 9u64), (rid("mid"), 5u64)]
                .into_iter()
                .collect(),
        );
        for id in ["ghost", "old", "new", "mid"] {
            idx.update("owner", "amy", &rid(id), &source).await.unwrap();
        }
        let kept = idx.lookup("owner", "amy").await.unwrap();
        assert_eq!(kept, [rid("new"), rid("mid")].into_iter().collect());
    }

    #[tokio::test]
    async fn test_large_entry_is_paged() {
        let (backend, idx) = manager(256, 1000, 500);
        let none = FixedCreatedAt(HashMap::new());
        for i in 0..100 {
            idx.update("status", "open", &rid(&format!("ticket-{:04}", i)), &none)
                .await
                .unwrap();
        }
        assert_eq!(idx.lookup("status", "open").await.unwrap().len(), 100);

        let page0 = StoreKey::index_page("status", "open", 0).unwrap().to_string();
        assert!(backend.get(&page0).await.unwrap().is_some());

        // Shrinking back to an inline entry removes the pages.
        for i in 1..100 {
            idx.remove("status", "open", &rid(&format!("ticket-{:04}", i)))
                .await
                .unwrap();
        }
        assert_eq!(idx.lookup("status", "open").await.unwrap().len(), 1);
        assert!(backend.get(&page0).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_missing_page_is_tolerated() {
        let (backend, idx) = manager(256, 1000, 500);
        let none = FixedCreatedAt(HashMap::new());
        for i in 0..100 {
            idx.update("status", "open", &rid(&format!("ticket-{:04}", i)), &none)
                .await
                .unwrap();
        }
        let page0 = StoreKey::index_page("status", "open", 0).unwrap().to_string();
        backend.delete(&page0).await.unwrap();

        let ids = idx.lookup("status", "open").await.unwrap();
        assert!(!ids.is_empty() && ids.len() < 100);
    }

    #[tokio::test]
    async fn test_search_intersects() {
        let (_, idx) = manager(8192, 1000, 500);
        let none = FixedCreatedAt(HashMap::new());
        for id in ["T-1", "T-2", "T-3"] {
            idx.update("status", "open", &rid(id), &none).await.unwrap();
        }
        for id in ["T-2", "T-3", "T-4"] {
            idx.update("priority", "high", &rid(id), &none).await.unwrap();
        }
        idx.update("owner", "sam", &rid("T-3"), &none).await.unwrap();

        let both = idx
            .search(&[("status", "open"), ("priority", "high")])
            .await
            .unwrap();
        assert_eq!(both, [rid("T-2"), rid("T-3")].into_iter().collect());

        let all = idx
            .search(&[("status", "open"), ("priority", "high"), ("owner", "sam")])
            .await
            .unwrap();
        assert_eq!(all, [rid("T-3")].into_iter().collect());

        assert!(idx.search(&[]).await.unwrap().is_empty());
    }

    #[test]
    fn test_entries_for_record() {
        let backend = Arc::new(MemoryBackend::new(8192));
        let idx = IndexManager::new(backend, &IndexConfig::default());
        let record = Record::new(rid("T-1"))
            .with_field("status", "open")
            .with_field("priority", 2)
            .with_field("assignedTo", json!(null))
            .with_field("createdAt", 1_709_208_000_000u64);

        let mut entries = idx.entries_for(&record);
        entries.sort();
        assert_eq!(
            entries,
            vec![
                ("date".to_string(), "2024-02-29".to_string()),
                ("priority".to_string(), "2".to_string()),
                ("status".to_string(), "open".to_string()),
            ]
        );
    }

    #[test]
    fn test_paginate_respects_ceiling() {
        let members: BTreeSet<RecordId> =
            (0..50).map(|i| rid(&format!("T-{:03}", i))).collect();
        let pages = paginate(&members, 64);
        assert!(pages.len() > 1);
        for page in &pages {
            assert!(serde_json::to_string(page).unwrap().len() < 64);
        }
        let total: usize = pages.iter().map(Vec::len).sum();
        assert_eq!(total, 50);
    }
}
