use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use bytes::Bytes;
use metrics::counter;
use tokio::sync::Mutex;
use tracing::debug;

use crate::bail;
use crate::error::{BatchResult, ErrorKind};
use crate::failpoints::{MEMORY_COMMIT_FP, MEMORY_CREATE_TRANSACTION_FP, batcher_fail_point};
use crate::metrics::{BATCHER_STORE_COMMITS_TOTAL, BATCHER_STORE_ROLLBACKS_TOTAL};
use crate::transaction::base::{Transaction, TransactionId, TransactionKind, TransactionManager};

#[derive(Debug)]
struct Inner {
    entries: BTreeMap<String, Bytes>,
    commits: u64,
    rollbacks: u64,
    failing_commits: usize,
}

/// In-memory key/value backing store for testing and development purposes.
///
/// [`MemoryStore`] implements [`TransactionManager`] over a sorted map. Local transactions stage
/// their writes and apply them atomically on commit, which makes it straightforward to observe
/// whether a batch became durable. Failures can be injected with [`MemoryStore::fail_next_commits`]
/// and [`MemoryStore::fail_next_creations`]. All data is lost when the store is dropped.
#[derive(Debug, Clone)]
pub struct MemoryStore {
    inner: Arc<Mutex<Inner>>,
    next_transaction_id: Arc<AtomicU64>,
    failing_creations: Arc<AtomicUsize>,
}

impl MemoryStore {
    /// Creates a new empty memory store.
    pub fn new() -> Self {
        let inner = Inner {
            entries: BTreeMap::new(),
            commits: 0,
            rollbacks: 0,
            failing_commits: 0,
        };

        Self {
            inner: Arc::new(Mutex::new(inner)),
            next_transaction_id: Arc::new(AtomicU64::new(1)),
            failing_creations: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Returns the committed value stored under `key`.
    pub async fn get(&self, key: &str) -> Option<Bytes> {
        let inner = self.inner.lock().await;
        inner.entries.get(key).cloned()
    }

    /// Returns a copy of every committed entry.
    pub async fn entries(&self) -> BTreeMap<String, Bytes> {
        let inner = self.inner.lock().await;
        inner.entries.clone()
    }

    /// Returns the number of local transactions committed so far.
    pub async fn commits(&self) -> u64 {
        let inner = self.inner.lock().await;
        inner.commits
    }

    /// Returns the number of local transactions rolled back so far.
    pub async fn rollbacks(&self) -> u64 {
        let inner = self.inner.lock().await;
        inner.rollbacks
    }

    /// Makes the next `count` local commits fail with [`ErrorKind::CommitFailed`].
    pub async fn fail_next_commits(&self, count: usize) {
        let mut inner = self.inner.lock().await;
        inner.failing_commits = count;
    }

    /// Makes the next `count` transaction creations fail with
    /// [`ErrorKind::TransactionCreationFailed`].
    pub fn fail_next_creations(&self, count: usize) {
        self.failing_creations.store(count, Ordering::Relaxed);
    }

    fn create_transaction(&self, kind: TransactionKind) -> BatchResult<MemoryTransaction> {
        batcher_fail_point(MEMORY_CREATE_TRANSACTION_FP)?;

        let rejected = self
            .failing_creations
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |remaining| {
                remaining.checked_sub(1)
            })
            .is_ok();
        if rejected {
            bail!(
                ErrorKind::TransactionCreationFailed,
                "Memory store rejected the transaction",
                format!("{kind} transaction creation failed")
            );
        }

        let id = TransactionId::new(self.next_transaction_id.fetch_add(1, Ordering::Relaxed));
        debug!(transaction_id = %id, %kind, "created memory transaction");

        Ok(MemoryTransaction {
            id,
            kind,
            store: self.inner.clone(),
            state: Mutex::new(TransactionState {
                status: TransactionStatus::Active,
                writes: Vec::new(),
            }),
        })
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl TransactionManager for MemoryStore {
    type Transaction = MemoryTransaction;

    fn create_local_transaction(&self) -> BatchResult<MemoryTransaction> {
        self.create_transaction(TransactionKind::Local)
    }

    fn create_autocommit_transaction(&self) -> BatchResult<MemoryTransaction> {
        self.create_transaction(TransactionKind::AutoCommit)
    }
}

/// Lifecycle of a [`MemoryTransaction`].
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum TransactionStatus {
    Active,
    Committed,
    RolledBack,
    /// The commit was attempted and rejected; staged writes were discarded.
    Failed,
}

#[derive(Debug)]
enum Write {
    Put(String, Bytes),
    Delete(String),
}

#[derive(Debug)]
struct TransactionState {
    status: TransactionStatus,
    writes: Vec<Write>,
}

/// Transaction over a [`MemoryStore`].
#[derive(Debug)]
pub struct MemoryTransaction {
    id: TransactionId,
    kind: TransactionKind,
    store: Arc<Mutex<Inner>>,
    state: Mutex<TransactionState>,
}

impl MemoryTransaction {
    /// Stores `value` under `key` within this transaction.
    pub async fn put(&self, key: impl Into<String>, value: impl Into<Bytes>) -> BatchResult<()> {
        self.write(Write::Put(key.into(), value.into())).await
    }

    /// Removes `key` within this transaction.
    pub async fn delete(&self, key: impl Into<String>) -> BatchResult<()> {
        self.write(Write::Delete(key.into())).await
    }

    /// Returns the current status of this transaction.
    pub async fn status(&self) -> TransactionStatus {
        self.state.lock().await.status
    }

    /// Returns the number of writes staged and not yet committed.
    pub async fn staged_writes(&self) -> usize {
        self.state.lock().await.writes.len()
    }

    async fn write(&self, write: Write) -> BatchResult<()> {
        let mut state = self.state.lock().await;
        if state.status != TransactionStatus::Active {
            bail!(
                ErrorKind::InvalidState,
                "Transaction is no longer active",
                format!("transaction {} is {:?}", self.id, state.status)
            );
        }

        match self.kind {
            TransactionKind::Local => state.writes.push(write),
            TransactionKind::AutoCommit => {
                let mut store = self.store.lock().await;
                apply(&mut store.entries, write);
            }
        }

        Ok(())
    }
}

impl Transaction for MemoryTransaction {
    fn id(&self) -> TransactionId {
        self.id
    }

    fn kind(&self) -> TransactionKind {
        self.kind
    }

    async fn commit(&self) -> BatchResult<()> {
        if self.kind == TransactionKind::AutoCommit {
            return Ok(());
        }

        let mut state = self.state.lock().await;
        if state.status != TransactionStatus::Active {
            bail!(
                ErrorKind::InvalidState,
                "Cannot commit a transaction that is no longer active",
                format!("transaction {} is {:?}", self.id, state.status)
            );
        }

        let mut store = self.store.lock().await;

        let injected = batcher_fail_point(MEMORY_COMMIT_FP);
        if injected.is_err() || store.failing_commits > 0 {
            store.failing_commits = store.failing_commits.saturating_sub(1);
            state.status = TransactionStatus::Failed;
            state.writes.clear();

            injected?;
            bail!(
                ErrorKind::CommitFailed,
                "Memory store rejected the commit",
                format!("transaction {}", self.id)
            );
        }

        let writes = std::mem::take(&mut state.writes);
        let write_count = writes.len();
        for write in writes {
            apply(&mut store.entries, write);
        }
        store.commits += 1;
        state.status = TransactionStatus::Committed;

        counter!(BATCHER_STORE_COMMITS_TOTAL).increment(1);
        debug!(transaction_id = %self.id, write_count, "committed memory transaction");

        Ok(())
    }

    async fn rollback(&self) -> BatchResult<()> {
        if self.kind == TransactionKind::AutoCommit {
            return Ok(());
        }

        let mut state = self.state.lock().await;
        match state.status {
            TransactionStatus::Active | TransactionStatus::Failed => {
                state.writes.clear();
                state.status = TransactionStatus::RolledBack;

                let mut store = self.store.lock().await;
                store.rollbacks += 1;
                counter!(BATCHER_STORE_ROLLBACKS_TOTAL).increment(1);
                debug!(transaction_id = %self.id, "rolled back memory transaction");

                Ok(())
            }
            TransactionStatus::RolledBack => Ok(()),
            TransactionStatus::Committed => bail!(
                ErrorKind::RollbackFailed,
                "Cannot roll back a committed transaction",
                format!("transaction {}", self.id)
            ),
        }
    }
}

fn apply(entries: &mut BTreeMap<String, Bytes>, write: Write) {
    match write {
        Write::Put(key, value) => {
            entries.insert(key, value);
        }
        Write::Delete(key) => {
            entries.remove(&key);
        }
    }
}
