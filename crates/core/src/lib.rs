//! Persistence and transaction core for deskvault.
//!
//! Provides: a record store that chunks values over the backend's size
//! ceiling, best-effort secondary indexes with bounded eviction,
//! fixed-window quotas with scheduled counter cleanup, and a transaction
//! coordinator with compensating rollback. [`DeskVault`] ties them
//! together over one [`deskvault_storage::Backend`].

pub mod cache;
pub mod cleanup;
pub mod counter;
pub mod error;
pub mod index;
pub mod keyspace;
pub mod lock;
pub mod outbox;
pub mod quota;
pub mod record_store;
pub mod txn;
pub mod vault;

pub use error::CoreError;
pub use keyspace::{StoreKey, WindowKind};
pub use quota::{QuotaLimiter, QuotaUsage, WindowUsage};
pub use record_store::{RecordStore, OP_RECORD_WRITE};
pub use txn::{CustomOperation, Operation, StepOutput, TxnError, TxnReceipt, TxnState};
pub use vault::DeskVault;
