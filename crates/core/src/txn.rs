//! Transaction coordinator.
//!
//! A transaction is an ordered list of [`Operation`]s run under the global
//! transaction lock. Each applied step leaves an [`Undo`] value in a log;
//! if a later step fails, the log is replayed in reverse and the original
//! error is returned with any undo failures attached.
//!
//! Rollback only covers failures the coordinator observes. The backend has
//! no multi-key atomicity, so a process that dies between two steps leaves
//! the earlier ones applied and nothing undoes them on restart.

use crate::counter::Counters;
use crate::error::CoreError;
use crate::lock::GlobalLock;
use crate::outbox::Outbox;
use crate::record_store::RecordStore;
use deskvault_common::{OutboundMessage, Record, RecordId};
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxnState {
    Idle,
    Running,
    Committed,
    RollingBack,
    Failed,
}

impl fmt::Display for TxnState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Idle => "idle",
            Self::Running => "running",
            Self::Committed => "committed",
            Self::RollingBack => "rolling back",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

impl TxnState {
    /// Whether a transaction may move from `self` to `next`:
    /// `Idle -> Running -> {Committed, RollingBack -> Failed}`.
    pub fn can_advance_to(self, next: TxnState) -> bool {
        matches!(
            (self, next),
            (Self::Idle, Self::Running)
                | (Self::Running, Self::Committed)
                | (Self::Running, Self::RollingBack)
                | (Self::RollingBack, Self::Failed)
        )
    }
}

/// The states one transaction has passed through.
struct Progress {
    txn_id: Uuid,
    path: Vec<TxnState>,
}

impl Progress {
    fn new(txn_id: Uuid) -> Self {
        Self {
            txn_id,
            path: vec![TxnState::Idle],
        }
    }

    fn state(&self) -> TxnState {
        self.path.last().copied().unwrap_or(TxnState::Idle)
    }

    fn advance(&mut self, next: TxnState) {
        let from = self.state();
        debug_assert!(from.can_advance_to(next), "txn {} -> {}", from, next);
        tracing::debug!("txn {}: {} -> {}", self.txn_id, from, next);
        self.path.push(next);
    }
}

/// A caller-defined step with its own inverse.
///
/// `apply` returns a token that is handed back to `undo` if the
/// transaction rolls back.
#[async_trait::async_trait]
pub trait CustomOperation: Send + Sync {
    fn name(&self) -> &str;

    async fn apply(&self) -> Result<Value, CoreError>;

    async fn undo(&self, token: Value) -> Result<(), CoreError>;
}

#[derive(Clone)]
pub enum Operation {
    UpdateRecord(Record),
    DeleteRecord(RecordId),
    EnqueueMessage(OutboundMessage),
    /// Adjust a named counter; the result must stay non-negative.
    UpdateCounter { name: String, delta: i64 },
    Custom(Arc<dyn CustomOperation>),
}

impl fmt::Debug for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UpdateRecord(r) => write!(f, "UpdateRecord({})", r.id),
            Self::DeleteRecord(id) => write!(f, "DeleteRecord({})", id),
            Self::EnqueueMessage(m) => write!(f, "EnqueueMessage(to {})", m.to),
            Self::UpdateCounter { name, delta } => write!(f, "UpdateCounter({} {:+})", name, delta),
            Self::Custom(op) => write!(f, "Custom({})", op.name()),
        }
    }
}

/// The inverse of one applied step.
#[derive(Clone)]
pub enum Undo {
    /// Re-write the pre-image, or delete the record if there was none.
    RestoreRecord {
        id: RecordId,
        pre_image: Option<Record>,
    },
    CancelMessage {
        id: String,
    },
    RestoreCounter {
        name: String,
        prior: Option<u64>,
    },
    Custom {
        op: Arc<dyn CustomOperation>,
        token: Value,
    },
}

impl fmt::Debug for Undo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::RestoreRecord { id, pre_image } => match pre_image {
                Some(r) => write!(f, "RestoreRecord({} v{})", id, r.version),
                None => write!(f, "RestoreRecord({} absent)", id),
            },
            Self::CancelMessage { id } => write!(f, "CancelMessage({})", id),
            Self::RestoreCounter { name, prior } => {
                write!(f, "RestoreCounter({} = {:?})", name, prior)
            }
            Self::Custom { op, .. } => write!(f, "Custom({})", op.name()),
        }
    }
}

/// What a committed step produced.
#[derive(Debug, Clone, PartialEq)]
pub enum StepOutput {
    Record(Record),
    Deleted(bool),
    MessageId(String),
    Counter(u64),
    Custom(Value),
}

#[derive(Debug, Clone)]
pub struct TxnReceipt {
    pub txn_id: Uuid,
    pub steps: Vec<StepOutput>,
    pub state: TxnState,
    /// Every state passed through, starting at `Idle`.
    pub path: Vec<TxnState>,
}

#[derive(Debug)]
pub struct InverseFailure {
    /// Index of the step whose undo failed.
    pub step: usize,
    pub undo: String,
    pub error: CoreError,
}

/// A transaction that did not commit.
///
/// `cause` is the error that stopped it; undo failures never replace it.
#[derive(Debug, thiserror::Error)]
#[error("transaction {txn_id} {state}: {cause}")]
pub struct TxnError {
    pub txn_id: Uuid,
    #[source]
    pub cause: CoreError,
    /// `None` when no step ran (the lock was not acquired).
    pub failed_step: Option<usize>,
    pub state: TxnState,
    pub path: Vec<TxnState>,
    pub inverse_failures: Vec<InverseFailure>,
}

impl TxnError {
    pub fn is_retryable(&self) -> bool {
        self.cause.is_retryable()
    }

    /// Whether rollback left everything as it was before the transaction.
    pub fn fully_rolled_back(&self) -> bool {
        self.inverse_failures.is_empty()
    }
}

pub struct TxnCoordinator {
    records: Arc<RecordStore>,
    outbox: Arc<Outbox>,
    counters: Arc<Counters>,
    lock: GlobalLock,
}

impl fmt::Debug for TxnCoordinator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TxnCoordinator")
            .field("lock", &self.lock)
            .finish_non_exhaustive()
    }
}

impl TxnCoordinator {
    pub fn new(
        records: Arc<RecordStore>,
        outbox: Arc<Outbox>,
        counters: Arc<Counters>,
        lock_timeout: Duration,
    ) -> Self {
        Self {
            records,
            outbox,
            counters,
            lock: GlobalLock::new("txn", lock_timeout),
        }
    }

    /// Run `ops` in order, all or nothing as far as rollback can manage.
    ///
    /// Must not be called from inside a [`CustomOperation`] of another
    /// transaction: the lock is not reentrant and the inner call would
    /// wait out the lock timeout.
    pub async fn run(&self, ops: Vec<Operation>) -> Result<TxnReceipt, TxnError> {
        let txn_id = Uuid::new_v4();
        let _timer = deskvault_metrics::start_txn_timer();
        let m = deskvault_metrics::metrics();
        let mut progress = Progress::new(txn_id);

        let _guard = match self.lock.acquire().await {
            Ok(guard) => guard,
            Err(cause) => {
                return Err(TxnError {
                    txn_id,
                    cause,
                    failed_step: None,
                    state: progress.state(),
                    path: progress.path,
                    inverse_failures: Vec::new(),
                })
            }
        };
        progress.advance(TxnState::Running);
        tracing::debug!("txn {} running {} step(s)", txn_id, ops.len());

        let mut log: Vec<(usize, Undo)> = Vec::with_capacity(ops.len());
        let mut steps = Vec::with_capacity(ops.len());
        for (i, op) in ops.into_iter().enumerate() {
            let described = format!("{:?}", op);
            match self.apply(i, op, &mut log).await {
                Ok(output) => steps.push(output),
                Err(cause) => {
                    tracing::warn!(
                        "txn {} step {} ({}) failed: {}; rolling back {} step(s)",
                        txn_id,
                        i,
                        described,
                        cause,
                        log.len()
                    );
                    progress.advance(TxnState::RollingBack);
                    let inverse_failures = self.rollback(txn_id, log).await;
                    m.txn_rolled_back.inc();
                    progress.advance(TxnState::Failed);
                    return Err(TxnError {
                        txn_id,
                        cause,
                        failed_step: Some(i),
                        state: progress.state(),
                        path: progress.path,
                        inverse_failures,
                    });
                }
            }
        }

        m.txn_committed.inc();
        progress.advance(TxnState::Committed);
        Ok(TxnReceipt {
            txn_id,
            steps,
            state: progress.state(),
            path: progress.path,
        })
    }

    /// Apply one step, logging its inverse.
    ///
    /// Record writes touch several keys, so their inverse is logged before
    /// the write starts and undoes a partial write too. Single-key steps
    /// log theirs only once they have taken effect.
    async fn apply(
        &self,
        step: usize,
        op: Operation,
        log: &mut Vec<(usize, Undo)>,
    ) -> Result<StepOutput, CoreError> {
        match op {
            Operation::UpdateRecord(record) => {
                let pre_image = self.pre_image(&record.id).await?;
                self.records.consume_write_quota().await?;
                log.push((
                    step,
                    Undo::RestoreRecord {
                        id: record.id.clone(),
                        pre_image,
                    },
                ));
                Ok(StepOutput::Record(self.records.write(record).await?))
            }
            Operation::DeleteRecord(id) => {
                let pre_image = self.pre_image(&id).await?;
                self.records.consume_write_quota().await?;
                if pre_image.is_some() {
                    log.push((
                        step,
                        Undo::RestoreRecord {
                            id: id.clone(),
                            pre_image,
                        },
                    ));
                }
                Ok(StepOutput::Deleted(self.records.remove(&id).await?))
            }
            Operation::EnqueueMessage(message) => {
                let id = self.outbox.enqueue(message).await?;
                log.push((step, Undo::CancelMessage { id: id.clone() }));
                Ok(StepOutput::MessageId(id))
            }
            Operation::UpdateCounter { name, delta } => {
                let prior = self.counters.get(&name).await?;
                let value = self.counters.add(&name, delta).await?;
                log.push((step, Undo::RestoreCounter { name, prior }));
                Ok(StepOutput::Counter(value))
            }
            Operation::Custom(op) => {
                let token = op.apply().await?;
                log.push((
                    step,
                    Undo::Custom {
                        op,
                        token: token.clone(),
                    },
                ));
                Ok(StepOutput::Custom(token))
            }
        }
    }

    async fn pre_image(&self, id: &RecordId) -> Result<Option<Record>, CoreError> {
        match self.records.get(id).await {
            Ok(record) => Ok(Some(record)),
            Err(CoreError::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Undo in reverse order. Failures are logged and collected; the rest
    /// of the log still runs.
    async fn rollback(&self, txn_id: Uuid, log: Vec<(usize, Undo)>) -> Vec<InverseFailure> {
        let mut failures = Vec::new();
        for (step, undo) in log.into_iter().rev() {
            let described = format!("{:?}", undo);
            let result = match undo {
                Undo::RestoreRecord { id, pre_image } => self.records.restore(&id, pre_image).await,
                Undo::CancelMessage { id } => self.outbox.cancel(&id).await.map(|_| ()),
                Undo::RestoreCounter { name, prior } => self.counters.restore(&name, prior).await,
                Undo::Custom { op, token } => op.undo(token).await,
            };
            if let Err(error) = result {
                deskvault_metrics::metrics().txn_inverse_failures.inc();
                tracing::warn!(
                    "txn {} could not undo step {} ({}): {}",
                    txn_id,
                    step,
                    described,
                    error
                );
                failures.push(InverseFailure {
                    step,
                    undo: described,
                    error,
                });
            }
        }
        failures
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
