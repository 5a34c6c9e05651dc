//! The caller-facing entry point tying the core components together.

use crate::cleanup::spawn_cleanup_task;
use crate::counter::Counters;
use crate::error::CoreError;
use crate::outbox::Outbox;
use crate::quota::{QuotaLimiter, QuotaUsage};
use crate::record_store::RecordStore;
use crate::txn::{Operation, TxnCoordinator, TxnError, TxnReceipt};
use deskvault_common::{Clock, Record, RecordId};
use deskvault_config::VaultConfig;
use deskvault_storage::Backend;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

pub struct DeskVault {
    records: Arc<RecordStore>,
    quota: Arc<QuotaLimiter>,
    outbox: Arc<Outbox>,
    counters: Arc<Counters>,
    txn: TxnCoordinator,
    cleanup_interval: Duration,
}

impl std::fmt::Debug for DeskVault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeskVault")
            .field("records", &self.records)
            .field("quota", &self.quota)
            .finish_non_exhaustive()
    }
}

impl DeskVault {
    pub fn new(
        backend: Arc<dyn Backend>,
        config: &VaultConfig,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, CoreError> {
        config
            .validate()
            .map_err(|e| CoreError::InvalidConfig(e.to_string()))?;

        let quota = Arc::new(QuotaLimiter::new(backend.clone(), &config.quota, clock.clone()));
        let records = Arc::new(
            RecordStore::new(backend.clone(), config, clock.clone())?.with_quota(quota.clone()),
        );
        let outbox = Arc::new(Outbox::new(backend.clone(), clock));
        let counters = Arc::new(Counters::new(backend));
        let txn = TxnCoordinator::new(
            records.clone(),
            outbox.clone(),
            counters.clone(),
            Duration::from_millis(config.txn.lock_timeout_ms),
        );
        tracing::info!(
            "deskvault ready: {} index(es), {} quota rule(s)",
            config.index.fields.len(),
            config.quota.limits.len()
        );
        Ok(Self {
            records,
            quota,
            outbox,
            counters,
            txn,
            cleanup_interval: Duration::from_secs(config.quota.cleanup_interval_secs),
        })
    }

    pub async fn save_record(&self, record: Record) -> Result<Record, CoreError> {
        self.records.save(record).await
    }

    pub async fn get_record(&self, id: &RecordId) -> Result<Record, CoreError> {
        self.records.get(id).await
    }

    pub async fn delete_record(&self, id: &RecordId) -> Result<bool, CoreError> {
        self.records.delete(id).await
    }

    /// Ids indexed under `index = value`. Best effort: may include records
    /// that no longer match and may miss evicted ones.
    pub async fn search_by_field(
        &self,
        index: &str,
        value: &str,
    ) -> Result<BTreeSet<RecordId>, CoreError> {
        self.records.indexes().lookup(index, value).await
    }

    /// Ids matching every `(index, value)` pair.
    pub async fn search(&self, criteria: &[(&str, &str)]) -> Result<BTreeSet<RecordId>, CoreError> {
        self.records.indexes().search(criteria).await
    }

    pub async fn run_transaction(&self, ops: Vec<Operation>) -> Result<TxnReceipt, TxnError> {
        self.txn.run(ops).await
    }

    /// Consume one call of `op` against its quota.
    pub async fn check_quota(&self, op: &str) -> Result<Option<QuotaUsage>, CoreError> {
        self.quota.check_and_consume(op).await
    }

    pub async fn quota_status(&self, op: &str) -> Result<Option<QuotaUsage>, CoreError> {
        self.quota.status(op).await
    }

    /// Start reclaiming expired quota counters at the configured interval.
    pub fn spawn_quota_cleanup(&self) -> tokio::task::JoinHandle<()> {
        spawn_cleanup_task(self.quota.clone(), self.cleanup_interval)
    }

    pub fn records(&self) -> &Arc<RecordStore> {
        &self.records
    }

    pub fn quota(&self) -> &Arc<QuotaLimiter> {
        &self.quota
    }

    pub fn outbox(&self) -> &Arc<Outbox> {
        &self.outbox
    }

    pub fn counters(&self) -> &Arc<Counters> {
        &self.counters
    }
}
