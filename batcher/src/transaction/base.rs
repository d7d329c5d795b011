use std::fmt;
use std::future::Future;

use crate::error::BatchResult;

/// Identifier of a transaction, unique within its [`TransactionManager`].
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TransactionId(u64);

impl TransactionId {
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    pub fn into_inner(self) -> u64 {
        self.0
    }
}

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// How a transaction applies the mutations made through it.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum TransactionKind {
    /// Mutations are staged and applied atomically by [`Transaction::commit`].
    Local,
    /// Every mutation is applied as soon as it is made; commit and rollback do nothing.
    AutoCommit,
}

impl fmt::Display for TransactionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransactionKind::Local => write!(f, "local"),
            TransactionKind::AutoCommit => write!(f, "auto_commit"),
        }
    }
}

/// A transaction against the backing store.
///
/// Transactions are shared by every participant of a batch, so both outcome operations take
/// `&self`. Committing is the expensive operation the coordinators amortize; neither coordinator
/// retries a failed commit or rollback.
pub trait Transaction: Send + Sync + 'static {
    /// Returns the identifier of this transaction.
    fn id(&self) -> TransactionId;

    /// Returns whether this is a local or an auto-commit transaction.
    fn kind(&self) -> TransactionKind;

    /// Makes every mutation performed in this transaction durable.
    fn commit(&self) -> impl Future<Output = BatchResult<()>> + Send;

    /// Discards every mutation performed in this transaction.
    fn rollback(&self) -> impl Future<Output = BatchResult<()>> + Send;
}

/// Creates transactions against one backing store.
///
/// Creation is expected to be cheap and non-blocking, which lets coordinators create transactions
/// while holding their short internal locks.
pub trait TransactionManager: Send + Sync + 'static {
    /// Transaction type produced by this manager.
    type Transaction: Transaction;

    /// Creates a transaction whose mutations become durable only on commit.
    fn create_local_transaction(&self) -> BatchResult<Self::Transaction>;

    /// Creates a transaction whose mutations become durable immediately.
    fn create_autocommit_transaction(&self) -> BatchResult<Self::Transaction>;
}
