//! Backing key/value store for deskvault.
//!
//! The record store consumes a [`Backend`]: string keys to string values,
//! a hard per-value size ceiling, no multi-key atomicity, no TTL and no
//! query capability. This crate provides the contract plus three
//! implementations:
//!
//! - [`MemoryBackend`]: an ordered in-memory map.
//! - [`WalBackend`]: a durable engine (WAL + memtable) that survives restarts.
//! - [`ChaosBackend`]: a fault-injecting wrapper for tests.

pub mod backend;
pub mod chaos;
pub mod engine;
pub mod entry;
pub mod memory;
pub mod memtable;
pub mod wal;
pub mod wal_backend;

pub use backend::{Backend, BackendError};
pub use chaos::{ChaosBackend, ChaosConfig};
pub use engine::StorageEngine;
pub use entry::WalEntry;
pub use memory::MemoryBackend;
pub use wal::FsyncPolicy;
pub use wal_backend::WalBackend;
