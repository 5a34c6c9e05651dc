//! WAL entry format.

use serde::{Deserialize, Serialize};

/// One logged mutation of the key/value map.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum WalEntry {
    Set {
        key: String,
        value: String,
        timestamp_ms: u64,
    },
    Delete {
        key: String,
        timestamp_ms: u64,
    },
}

impl WalEntry {
    pub fn set(key: &str, value: &str) -> Self {
        Self::Set {
            key: key.to_string(),
            value: value.to_string(),
            timestamp_ms: now_ms(),
        }
    }

    pub fn delete(key: &str) -> Self {
        Self::Delete {
            key: key.to_string(),
            timestamp_ms: now_ms(),
        }
    }

    pub fn key(&self) -> &str {
        match self {
            Self::Set { key, .. } | Self::Delete { key, .. } => key,
        }
    }
}

fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
