//! Short-lived read cache in front of the record store.

use deskvault_common::{Clock, Record, RecordId};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;

#[derive(Debug, Clone)]
pub struct CachedRecord {
    pub record: Record,
    /// Chunked entries are served without a version check.
    pub chunked: bool,
    cached_at_ms: u64,
}

impl CachedRecord {
    fn live_at(&self, now_ms: u64, ttl_ms: u64) -> bool {
        now_ms.saturating_sub(self.cached_at_ms) < ttl_ms
    }
}

struct Entries {
    map: HashMap<RecordId, CachedRecord>,
    last_sweep_ms: u64,
}

/// Per-record cache with a fixed TTL, keyed by record id.
///
/// Expired entries are swept out on insert at most once per TTL, so the map
/// holds only what was cached in the last two TTLs.
pub struct RecordCache {
    entries: RwLock<Entries>,
    ttl: Duration,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for RecordCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecordCache")
            .field("ttl", &self.ttl)
            .finish_non_exhaustive()
    }
}

impl RecordCache {
    pub fn new(ttl: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: RwLock::new(Entries {
                map: HashMap::new(),
                last_sweep_ms: clock.now_ms(),
            }),
            ttl,
            clock,
        }
    }

    /// A live entry, if any. Expired entries are dropped on sight.
    pub async fn get(&self, id: &RecordId) -> Option<CachedRecord> {
        let now = self.clock.now_ms();
        let ttl_ms = self.ttl_ms();
        {
            let entries = self.entries.read().await;
            match entries.map.get(id) {
                Some(e) if e.live_at(now, ttl_ms) => return Some(e.clone()),
                Some(_) => {}
                None => return None,
            }
        }
        // A put may have landed since the read guard was dropped.
        let mut entries = self.entries.write().await;
        match entries.map.get(id) {
            Some(e) if e.live_at(now, ttl_ms) => Some(e.clone()),
            Some(_) => {
                entries.map.remove(id);
                None
            }
            None => None,
        }
    }

    pub async fn put(&self, record: Record, chunked: bool) {
        let now = self.clock.now_ms();
        let ttl_ms = self.ttl_ms();
        let entry = CachedRecord {
            record,
            chunked,
            cached_at_ms: now,
        };
        let mut entries = self.entries.write().await;
        if now.saturating_sub(entries.last_sweep_ms) >= ttl_ms {
            let before = entries.map.len();
            entries.map.retain(|_, e| e.live_at(now, ttl_ms));
            entries.last_sweep_ms = now;
            tracing::trace!("record cache swept {} expired entries", before - entries.map.len());
        }
        entries.map.insert(entry.record.id.clone(), entry);
    }

    pub async fn invalidate(&self, id: &RecordId) {
        self.entries.write().await.map.remove(id);
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.map.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.map.is_empty()
    }

    fn ttl_ms(&self) -> u64 {
        self.ttl.as_millis() as u64
    }
}
