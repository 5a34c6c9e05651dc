//! Error taxonomy of the persistence core.

use crate::keyspace::WindowKind;
use deskvault_common::{NameError, RecordId};
use deskvault_storage::BackendError;
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    /// Retryable once the window rolls over.
    #[error("quota exceeded for {op} ({window} window): {current}/{limit}")]
    QuotaExceeded {
        op: String,
        window: WindowKind,
        current: u64,
        limit: u64,
    },

    #[error("record {id} is missing chunk {index} of {expected}")]
    ChunkMissing {
        id: RecordId,
        index: u32,
        expected: u32,
    },

    #[error("stored data at {key} is corrupt: {reason}")]
    RecordCorrupt { key: String, reason: String },

    /// Retryable; nothing was applied.
    #[error("timed out after {waited:?} waiting for the {lock} lock")]
    LockTimeout {
        lock: &'static str,
        waited: Duration,
    },

    #[error("record {0} not found")]
    NotFound(RecordId),

    #[error(transparent)]
    InvalidName(#[from] NameError),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("backend error: {0}")]
    Backend(#[from] BackendError),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("operation failed: {0}")]
    Operation(String),
}

impl CoreError {
    pub(crate) fn corrupt(key: impl ToString, reason: impl ToString) -> Self {
        Self::RecordCorrupt {
            key: key.to_string(),
            reason: reason.to_string(),
        }
    }

    /// Whether the caller may retry the same call after backing off.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::QuotaExceeded { .. } | Self::LockTimeout { .. } => true,
            Self::Backend(e) => e.is_retryable(),
            _ => false,
        }
    }

    /// Data loss or a serialization bug; never retried, never masked.
    pub fn is_data_integrity(&self) -> bool {
        matches!(self, Self::ChunkMissing { .. } | Self::RecordCorrupt { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        let quota = CoreError::QuotaExceeded {
            op: "record_write".into(),
            window: WindowKind::Minute,
            current: 5,
            limit: 5,
        };
        assert!(quota.is_retryable());
        assert!(!quota.is_data_integrity());

        let lock = CoreError::LockTimeout {
            lock: "txn",
            waited: Duration::from_secs(10),
        };
        assert!(lock.is_retryable());

        let missing = CoreError::ChunkMissing {
            id: RecordId::new("T-1").unwrap(),
            index: 2,
            expected: 3,
        };
        assert!(!missing.is_retryable());
        assert!(missing.is_data_integrity());

        let flaky = CoreError::Backend(BackendError::Unavailable("down".into()));
        assert!(flaky.is_retryable());
        let too_big = CoreError::Backend(BackendError::ValueTooLarge {
            key: "k".into(),
            size: 10,
            limit: 5,
        });
        assert!(!too_big.is_retryable());
    }

    #[test]
    fn test_quota_message_carries_counts() {
        let err = CoreError::QuotaExceeded {
            op: "send_reply".into(),
            window: WindowKind::Day,
            current: 100,
            limit: 100,
        };
        let msg = err.to_string();
        assert!(msg.contains("send_reply"), "{}", msg);
        assert!(msg.contains("day"), "{}", msg);
        assert!(msg.contains("100/100"), "{}", msg);
    }
}
