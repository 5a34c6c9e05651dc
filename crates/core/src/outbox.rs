//! Queue of outbound replies awaiting delivery.
//!
//! Messages are stored one per key under [`StoreKey::Outbox`] so that a
//! transaction can cancel exactly the message it enqueued.

use crate::error::CoreError;
use crate::keyspace::{StoreKey, OUTBOX_PREFIX};
use deskvault_common::{Clock, OutboundMessage};
use deskvault_storage::Backend;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueuedMessage {
    pub id: String,
    #[serde(flatten)]
    pub message: OutboundMessage,
    pub enqueued_at: u64,
}

pub struct Outbox {
    backend: Arc<dyn Backend>,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for Outbox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Outbox").finish_non_exhaustive()
    }
}

impl Outbox {
    pub fn new(backend: Arc<dyn Backend>, clock: Arc<dyn Clock>) -> Self {
        Self { backend, clock }
    }

    /// Queue `message` and return its generated id.
    pub async fn enqueue(&self, message: OutboundMessage) -> Result<String, CoreError> {
        let id = uuid::Uuid::new_v4().to_string();
        let queued = QueuedMessage {
            id: id.clone(),
            message,
            enqueued_at: self.clock.now_ms(),
        };
        let key = StoreKey::outbox(&id)?;
        self.backend
            .set(&key.to_string(), &serde_json::to_string(&queued)?)
            .await?;
        tracing::debug!("queued message {} to {}", id, queued.message.to);
        Ok(id)
    }

    /// Remove a queued message. Returns whether it was still queued.
    pub async fn cancel(&self, id: &str) -> Result<bool, CoreError> {
        let key = StoreKey::outbox(id)?.to_string();
        let present = self.backend.get(&key).await?.is_some();
        if present {
            self.backend.delete(&key).await?;
            tracing::debug!("cancelled message {}", id);
        }
        Ok(present)
    }

    pub async fn get(&self, id: &str) -> Result<Option<QueuedMessage>, CoreError> {
        let key = StoreKey::outbox(id)?.to_string();
        match self.backend.get(&key).await? {
            Some(raw) => Ok(Some(
                serde_json::from_str(&raw).map_err(|e| CoreError::corrupt(&key, e))?,
            )),
            None => Ok(None),
        }
    }

    /// Every queued message, oldest first.
    pub async fn pending(&self) -> Result<Vec<QueuedMessage>, CoreError> {
        let mut messages = Vec::new();
        for key in self.backend.list_keys().await? {
            if !key.starts_with(OUTBOX_PREFIX) {
                continue;
            }
            // Raced with a cancel; skip.
            let Some(raw) = self.backend.get(&key).await? else {
                continue;
            };
            let queued: QueuedMessage =
                serde_json::from_str(&raw).map_err(|e| CoreError::corrupt(&key, e))?;
            messages.push(queued);
        }
        messages.sort_by(|a, b| a.enqueued_at.cmp(&b.enqueued_at).then_with(|| a.id.cmp(&b.id)));
        Ok(messages)
    }
}
