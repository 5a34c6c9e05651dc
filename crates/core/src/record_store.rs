//! Chunked record store.
//!
//! A record whose serialized form fits under the backend's value ceiling is
//! stored whole under [`StoreKey::Primary`]. Larger records are split into
//! `chunk_bytes` slices under [`StoreKey::Chunk`] and described by a
//! [`ChunkMeta`] under [`StoreKey::Meta`]. Reads look for metadata first,
//! so a record mid-way between layouts resolves to whichever layout the
//! metadata currently describes.
//!
//! Every successful save bumps `_version` exactly once. Reads go through a
//! short-lived cache; cached small records are revalidated against the
//! stored `_version`, cached chunked records are trusted until they expire.

use crate::cache::RecordCache;
use crate::error::CoreError;
use crate::index::{CreatedAtSource, IndexManager};
use crate::keyspace::StoreKey;
use crate::quota::QuotaLimiter;
use deskvault_common::{ChunkMeta, Clock, Record, RecordId};
use deskvault_config::VaultConfig;
use deskvault_storage::Backend;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;

/// Quota operation consulted before every record write.
pub const OP_RECORD_WRITE: &str = "record_write";

/// How a record is currently laid out in the backend.
enum Layout {
    Absent,
    Inline(String),
    Chunked(ChunkMeta),
}

/// What a save or delete is about to replace.
#[derive(Default)]
struct Existing {
    record: Option<Record>,
    /// Highest version seen in either the record or its metadata.
    version: u64,
    created_ms: Option<u64>,
    chunks: Vec<u32>,
    present: bool,
}

#[derive(Deserialize)]
struct VersionStamp {
    #[serde(rename = "_version", default)]
    version: u64,
}

pub struct RecordStore {
    backend: Arc<dyn Backend>,
    cache: RecordCache,
    indexes: IndexManager,
    quota: Option<Arc<QuotaLimiter>>,
    clock: Arc<dyn Clock>,
    chunk_bytes: usize,
}

impl std::fmt::Debug for RecordStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecordStore")
            .field("chunk_bytes", &self.chunk_bytes)
            .field("indexes", &self.indexes)
            .finish_non_exhaustive()
    }
}

impl RecordStore {
    pub fn new(
        backend: Arc<dyn Backend>,
        config: &VaultConfig,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, CoreError> {
        let chunk_bytes = config.storage.chunk_bytes;
        let ceiling = backend.max_value_bytes();
        if chunk_bytes == 0 || chunk_bytes >= ceiling {
            return Err(CoreError::InvalidConfig(format!(
                "chunk_bytes {} must be between 1 and the backend ceiling {}",
                chunk_bytes, ceiling
            )));
        }
        Ok(Self {
            cache: RecordCache::new(Duration::from_secs(config.cache.ttl_secs), clock.clone()),
            indexes: IndexManager::new(backend.clone(), &config.index),
            backend,
            quota: None,
            clock,
            chunk_bytes,
        })
    }

    /// Meter writes through `limiter` under [`OP_RECORD_WRITE`].
    pub fn with_quota(mut self, limiter: Arc<QuotaLimiter>) -> Self {
        self.quota = Some(limiter);
        self
    }

    pub fn indexes(&self) -> &IndexManager {
        &self.indexes
    }

    /// Persist `record`, returning it with `_version` and `_lastModified`
    /// as stored.
    pub async fn save(&self, record: Record) -> Result<Record, CoreError> {
        self.consume_write_quota().await?;
        self.write(record).await
    }

    /// Remove a record in either layout. Index entries pointing at it are
    /// left to go stale. Returns whether anything was stored.
    pub async fn delete(&self, id: &RecordId) -> Result<bool, CoreError> {
        self.consume_write_quota().await?;
        self.remove(id).await
    }

    pub async fn get(&self, id: &RecordId) -> Result<Record, CoreError> {
        let m = deskvault_metrics::metrics();
        if let Some(cached) = self.cache.get(id).await {
            if cached.chunked || self.stored_version(id).await? == Some(cached.record.version) {
                m.cache_hits.inc();
                return Ok(cached.record);
            }
            m.cache_stale.inc();
            tracing::debug!(
                "cached copy of {} (v{}) is stale; refetching",
                id,
                cached.record.version
            );
            self.cache.invalidate(id).await;
        } else {
            m.cache_misses.inc();
        }

        let (record, chunked) = match self.read_layout(id).await? {
            Layout::Absent => return Err(CoreError::NotFound(id.clone())),
            Layout::Inline(raw) => (decode(&StoreKey::Primary(id.clone()), &raw, id)?, false),
            Layout::Chunked(meta) => (self.reassemble(id, &meta).await?, true),
        };
        m.records_read.inc();
        self.cache.put(record.clone(), chunked).await;
        Ok(record)
    }

    /// Whether `id` currently resolves to a readable record.
    pub async fn exists(&self, id: &RecordId) -> Result<bool, CoreError> {
        match self.get(id).await {
            Ok(_) => Ok(true),
            Err(CoreError::NotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Put back `pre_image`, or remove the record if there was none.
    /// Not metered: undoing a write must not be refused by the quota that
    /// admitted it.
    pub(crate) async fn restore(
        &self,
        id: &RecordId,
        pre_image: Option<Record>,
    ) -> Result<(), CoreError> {
        match pre_image {
            Some(record) => self.write(record).await.map(|_| ()),
            None => self.remove(id).await.map(|_| ()),
        }
    }

    pub(crate) async fn consume_write_quota(&self) -> Result<(), CoreError> {
        if let Some(quota) = &self.quota {
            quota.check_and_consume(OP_RECORD_WRITE).await?;
        }
        Ok(())
    }

    pub(crate) async fn write(&self, mut record: Record) -> Result<Record, CoreError> {
        let id = record.id.clone();
        let existing = self.existing(&id).await?;
        let now = self.clock.now_ms();

        record.version = existing.version.max(record.version) + 1;
        record.last_modified_ms = now;
        let serialized = serde_json::to_string(&record)?;
        let primary = StoreKey::Primary(id.clone()).to_string();
        let meta_key = StoreKey::Meta(id.clone()).to_string();

        let chunk_count = if serialized.len() < self.backend.max_value_bytes() {
            self.backend.set(&primary, &serialized).await?;
            self.backend.delete(&meta_key).await?;
            0
        } else {
            let chunks = split_utf8(&serialized, self.chunk_bytes);
            for (i, chunk) in chunks.iter().enumerate() {
                let key = StoreKey::Chunk(id.clone(), i as u32).to_string();
                self.backend.set(&key, chunk).await?;
            }
            let meta = ChunkMeta {
                record_id: id.clone(),
                chunk_count: chunks.len() as u32,
                byte_length: serialized.len(),
                version: record.version,
                created: existing.created_ms.unwrap_or(now),
                modified: now,
            };
            self.backend
                .set(&meta_key, &serde_json::to_string(&meta)?)
                .await?;
            self.backend.delete(&primary).await?;
            deskvault_metrics::metrics().chunked_writes.inc();
            meta.chunk_count
        };

        for stale in existing.chunks.iter().filter(|&&n| n >= chunk_count) {
            let key = StoreKey::Chunk(id.clone(), *stale).to_string();
            self.backend.delete(&key).await?;
        }
        self.cache.invalidate(&id).await;

        self.reindex(&record, existing.record.as_ref()).await?;
        deskvault_metrics::metrics().records_saved.inc();
        tracing::debug!(
            "saved {} v{} ({} bytes, {} chunks)",
            id,
            record.version,
            serialized.len(),
            chunk_count
        );
        Ok(record)
    }

    pub(crate) async fn remove(&self, id: &RecordId) -> Result<bool, CoreError> {
        let existing = self.existing(id).await?;
        if !existing.present {
            return Ok(false);
        }
        self.backend
            .delete(&StoreKey::Meta(id.clone()).to_string())
            .await?;
        for n in &existing.chunks {
            self.backend
                .delete(&StoreKey::Chunk(id.clone(), *n).to_string())
                .await?;
        }
        self.backend
            .delete(&StoreKey::Primary(id.clone()).to_string())
            .await?;
        self.cache.invalidate(id).await;
        deskvault_metrics::metrics().records_deleted.inc();
        tracing::debug!("deleted {}", id);
        Ok(true)
    }

    /// Drop the pre-image's stale index memberships, then add the new ones.
    async fn reindex(&self, record: &Record, previous: Option<&Record>) -> Result<(), CoreError> {
        let entries = self.indexes.entries_for(record);
        if let Some(prev) = previous {
            for (name, value) in self.indexes.entries_for(prev) {
                if !entries.contains(&(name.clone(), value.clone())) {
                    self.indexes.remove(&name, &value, &record.id).await?;
                }
            }
        }
        for (name, value) in &entries {
            self.indexes.update(name, value, &record.id, self).await?;
        }
        Ok(())
    }

    /// Inspect what is stored for `id` ahead of overwriting or deleting it.
    /// Unreadable data does not block the write that replaces it.
    async fn existing(&self, id: &RecordId) -> Result<Existing, CoreError> {
        let layout = match self.read_layout(id).await {
            Ok(layout) => layout,
            Err(e) if e.is_data_integrity() => {
                tracing::warn!("replacing unreadable record {}: {}", id, e);
                return Ok(Existing {
                    chunks: self.scan_chunks(id).await?,
                    present: true,
                    ..Existing::default()
                });
            }
            Err(e) => return Err(e),
        };

        let mut existing = Existing {
            present: !matches!(layout, Layout::Absent),
            ..Existing::default()
        };
        let read = match layout {
            Layout::Absent => return Ok(existing),
            Layout::Inline(raw) => decode(&StoreKey::Primary(id.clone()), &raw, id),
            Layout::Chunked(meta) => {
                existing.version = meta.version;
                existing.created_ms = Some(meta.created);
                existing.chunks = (0..meta.chunk_count).collect();
                self.reassemble(id, &meta).await
            }
        };
        match read {
            Ok(record) => {
                existing.version = existing.version.max(record.version);
                existing.record = Some(record);
            }
            Err(e) if e.is_data_integrity() => {
                tracing::warn!("replacing unreadable record {}: {}", id, e);
            }
            Err(e) => return Err(e),
        }
        Ok(existing)
    }

    async fn read_layout(&self, id: &RecordId) -> Result<Layout, CoreError> {
        let meta_key = StoreKey::Meta(id.clone());
        if let Some(raw) = self.backend.get(&meta_key.to_string()).await? {
            let meta: ChunkMeta =
                serde_json::from_str(&raw).map_err(|e| CoreError::corrupt(&meta_key, e))?;
            return Ok(Layout::Chunked(meta));
        }
        let primary = StoreKey::Primary(id.clone()).to_string();
        if let Some(raw) = self.backend.get(&primary).await? {
            return Ok(Layout::Inline(raw));
        }
        let first_chunk = StoreKey::Chunk(id.clone(), 0).to_string();
        if self.backend.get(&first_chunk).await?.is_some() {
            return Err(CoreError::corrupt(
                &meta_key,
                "chunks present but metadata missing",
            ));
        }
        Ok(Layout::Absent)
    }

    /// Concatenate chunks in index order. Reads are sequential.
    async fn reassemble(&self, id: &RecordId, meta: &ChunkMeta) -> Result<Record, CoreError> {
        let meta_key = StoreKey::Meta(id.clone());
        if meta.record_id != *id {
            return Err(CoreError::corrupt(
                &meta_key,
                format!("metadata belongs to {}", meta.record_id),
            ));
        }
        if meta.chunk_count == 0 {
            return Err(CoreError::corrupt(&meta_key, "chunk count is zero"));
        }

        let mut buf = String::with_capacity(meta.byte_length);
        for index in 0..meta.chunk_count {
            let key = StoreKey::Chunk(id.clone(), index).to_string();
            match self.backend.get(&key).await? {
                Some(part) => buf.push_str(&part),
                None => {
                    return Err(CoreError::ChunkMissing {
                        id: id.clone(),
                        index,
                        expected: meta.chunk_count,
                    })
                }
            }
        }
        if buf.len() != meta.byte_length {
            return Err(CoreError::corrupt(
                &meta_key,
                format!(
                    "reassembled {} bytes, metadata says {}",
                    buf.len(),
                    meta.byte_length
                ),
            ));
        }
        decode(&meta_key, &buf, id)
    }

    /// `_version` of the stored small-record copy, if there is one.
    async fn stored_version(&self, id: &RecordId) -> Result<Option<u64>, CoreError> {
        let primary = StoreKey::Primary(id.clone()).to_string();
        Ok(self
            .backend
            .get(&primary)
            .await?
            .and_then(|raw| serde_json::from_str::<VersionStamp>(&raw).ok())
            .map(|p| p.version))
    }

    /// Chunk indices stored for `id`, found by walking the keyspace.
    /// Only used when metadata cannot be trusted.
    async fn scan_chunks(&self, id: &RecordId) -> Result<Vec<u32>, CoreError> {
        let prefix = format!("{}:chunk:", StoreKey::Primary(id.clone()));
        let mut chunks = Vec::new();
        for key in self.backend.list_keys().await? {
            if !key.starts_with(&prefix) {
                continue;
            }
            if let Ok(StoreKey::Chunk(owner, n)) = key.parse::<StoreKey>() {
                if owner == *id {
                    chunks.push(n);
                }
            }
        }
        Ok(chunks)
    }
}

#[async_trait::async_trait]
impl CreatedAtSource for RecordStore {
    async fn created_at(&self, id: &RecordId) -> Option<u64> {
        match self.get(id).await {
            Ok(record) => record.created_at_ms(),
            Err(e) => {
                tracing::debug!("no createdAt for {} during eviction: {}", id, e);
                None
            }
        }
    }
}

fn decode(key: &StoreKey, raw: &str, id: &RecordId) -> Result<Record, CoreError> {
    let record: Record = serde_json::from_str(raw).map_err(|e| CoreError::corrupt(key, e))?;
    if record.id != *id {
        return Err(CoreError::corrupt(
            key,
            format!("holds record {}", record.id),
        ));
    }
    Ok(record)
}

/// Split `s` into slices of at most `max` bytes without cutting a UTF-8
/// sequence. A slice only exceeds `max` when `max` is smaller than a
/// single character.
fn split_utf8(s: &str, max: usize) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut rest = s;
    while !rest.is_empty() {
        if rest.len() <= max {
            parts.push(rest);
            break;
        }
        let mut end = max;
        while end > 0 && !rest.is_char_boundary(end) {
            end -= 1;
        }
        if end == 0 {
            end = rest.chars().next().map_or(rest.len(), char::len_utf8);
        }
        let (head, tail) = rest.split_at(end);
        parts.push(head);
        rest = tail;
    }
    parts
}
