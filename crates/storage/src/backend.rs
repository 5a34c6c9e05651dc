//! The backing key/value store contract.

use crate::engine::StorageError;

#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("value for {key:?} is {size} bytes, over the {limit}-byte ceiling")]
    ValueTooLarge {
        key: String,
        size: usize,
        limit: usize,
    },
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("backend unavailable: {0}")]
    Unavailable(String),
}

impl BackendError {
    /// Whether retrying the same call later may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }
}

/// A string key/value service with a hard per-value size ceiling.
///
/// Each call is individually atomic; nothing spans keys. Implementations
/// must reject values larger than [`Backend::max_value_bytes`] rather than
/// truncate them.
#[async_trait::async_trait]
pub trait Backend: Send + Sync + 'static {
    async fn get(&self, key: &str) -> Result<Option<String>, BackendError>;

    async fn set(&self, key: &str, value: &str) -> Result<(), BackendError>;

    /// Deleting an absent key succeeds.
    async fn delete(&self, key: &str) -> Result<(), BackendError>;

    /// Every key, in lexicographic order. Maintenance paths only.
    async fn list_keys(&self) -> Result<Vec<String>, BackendError>;

    /// The per-value size ceiling in bytes.
    fn max_value_bytes(&self) -> usize;
}

/// Reject `value` if it would exceed `limit`.
pub(crate) fn check_size(key: &str, value: &str, limit: usize) -> Result<(), BackendError> {
    if value.len() > limit {
        return Err(BackendError::ValueTooLarge {
            key: key.to_string(),
            size: value.len(),
            limit,
        });
    }
    Ok(())
}
