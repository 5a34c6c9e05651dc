//! deskvault-common: shared types for the deskvault record store.
//!
//! Provides the validated [`RecordId`], the [`Record`] document with its
//! `_version` / `_lastModified` bookkeeping, chunk metadata, outbound
//! messages, and the injectable [`Clock`].

pub mod clock;

pub use clock::{epoch_ms, format_day, Clock, MockClock, SystemClock};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

/// Field read when ranking records for index eviction.
pub const CREATED_AT_FIELD: &str = "createdAt";

// ---------------------------------------------------------------------------
// Names
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid {kind} {value:?}: must be non-empty and use only [A-Za-z0-9_.-]")]
pub struct NameError {
    pub kind: &'static str,
    pub value: String,
}

/// Check that `value` is usable as a key segment.
///
/// Every segment rendered into a storage key goes through this check, so a
/// segment can never contain the `:` separator.
pub fn validate_name(kind: &'static str, value: &str) -> Result<(), NameError> {
    let ok = !value.is_empty()
        && value
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'_' | b'.' | b'-'));
    if ok {
        Ok(())
    } else {
        Err(NameError {
            kind,
            value: value.to_string(),
        })
    }
}

// ---------------------------------------------------------------------------
// RecordId
// ---------------------------------------------------------------------------

/// Stable identifier of a record. Immutable once the record exists.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct RecordId(String);

impl RecordId {
    pub fn new(id: impl Into<String>) -> Result<Self, NameError> {
        let id = id.into();
        validate_name("record id", &id)?;
        Ok(Self(id))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for RecordId {
    type Error = NameError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<RecordId> for String {
    fn from(id: RecordId) -> Self {
        id.0
    }
}

impl fmt::Debug for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RecordId({})", self.0)
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ---------------------------------------------------------------------------
// Record
// ---------------------------------------------------------------------------

/// A persisted business document (a ticket).
///
/// Only `id`, `_version` and `_lastModified` are interpreted by the store;
/// every other field is carried opaquely in `fields`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub id: RecordId,
    /// Bumped exactly once per successful write.
    #[serde(rename = "_version", default)]
    pub version: u64,
    /// Millis since epoch of the last successful write.
    #[serde(rename = "_lastModified", default)]
    pub last_modified_ms: u64,
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl Record {
    pub fn new(id: RecordId) -> Self {
        Self {
            id,
            version: 0,
            last_modified_ms: 0,
            fields: Map::new(),
        }
    }

    /// Builder-style field setter.
    pub fn with_field(mut self, name: &str, value: impl Into<Value>) -> Self {
        self.set_field(name, value);
        self
    }

    pub fn set_field(&mut self, name: &str, value: impl Into<Value>) {
        self.fields.insert(name.to_string(), value.into());
    }

    pub fn field(&self, name: &str) -> Option<&Value> {
        self.fields.get(name)
    }

    /// `createdAt` as millis since epoch, if present and numeric.
    pub fn created_at_ms(&self) -> Option<u64> {
        self.field(CREATED_AT_FIELD).and_then(Value::as_u64)
    }

    /// Whether two records carry the same id and payload, ignoring the
    /// store-managed `_version` and `_lastModified`.
    pub fn same_payload(&self, other: &Record) -> bool {
        self.id == other.id && self.fields == other.fields
    }
}

// ---------------------------------------------------------------------------
// Chunk metadata
// ---------------------------------------------------------------------------

/// Describes a record whose serialized form was split into chunks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkMeta {
    pub record_id: RecordId,
    pub chunk_count: u32,
    /// Byte length of the full serialized record.
    pub byte_length: usize,
    /// `_version` of the record the chunks hold.
    pub version: u64,
    pub created: u64,
    pub modified: u64,
}

// ---------------------------------------------------------------------------
// Outbound messages
// ---------------------------------------------------------------------------

/// A reply queued for delivery by the mail collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutboundMessage {
    pub to: String,
    pub subject: String,
    pub body: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thread_id: Option<String>,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
