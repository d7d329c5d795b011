use std::any::Any;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

use async_trait::async_trait;
use tracing::error;

use crate::error::{BatchError, BatchResult};
use crate::transaction::base::Transaction;

/// Observer of the outcome of a batch completed by the batch register coordinator.
///
/// A listener is registered at most once per batch. Exactly one of
/// [`BatchListener::batch_committed`] and [`BatchListener::batch_rolled_back`] is called for each
/// batch it was registered with. Panics raised by a listener are caught and logged.
pub trait BatchListener<T: Transaction>: Send + Sync {
    /// Called with the batch transaction right before it is committed.
    fn batch_precommit(&self, transaction: &T);

    /// Called once the batch transaction committed.
    fn batch_committed(&self);

    /// Called once the batch transaction failed to commit.
    fn batch_rolled_back(&self);
}

/// Unit of work executed by the drain queue coordinator inside a shared transaction.
///
/// Exactly one of [`UnitOfWork::committed`] and [`UnitOfWork::rolled_back`] is called once the
/// round that executed the unit finishes.
#[async_trait]
pub trait UnitOfWork<T: Transaction>: Send + Sync {
    /// Performs the mutation inside `transaction`.
    ///
    /// Routine failures are reported through the returned error, which rolls back the whole round.
    async fn execute(&self, transaction: &T) -> BatchResult<()>;

    /// Called once the round transaction committed.
    fn committed(&self);

    /// Called once the round transaction was rolled back, with the error that caused it.
    fn rolled_back(&self, cause: &BatchError);
}

/// Set of listeners keyed by pointer identity, iterated in insertion order.
pub(crate) struct ListenerSet<T: Transaction> {
    listeners: Vec<Arc<dyn BatchListener<T>>>,
}

impl<T: Transaction> ListenerSet<T> {
    pub(crate) fn new() -> Self {
        Self {
            listeners: Vec::new(),
        }
    }

    /// Adds `listener` unless the same listener is already present.
    pub(crate) fn insert(&mut self, listener: Arc<dyn BatchListener<T>>) -> bool {
        let already_present = self
            .listeners
            .iter()
            .any(|existing| std::ptr::addr_eq(Arc::as_ptr(existing), Arc::as_ptr(&listener)));

        if already_present {
            return false;
        }

        self.listeners.push(listener);
        true
    }

    pub(crate) fn len(&self) -> usize {
        self.listeners.len()
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = &Arc<dyn BatchListener<T>>> {
        self.listeners.iter()
    }
}

impl<T: Transaction> Default for ListenerSet<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Runs a producer supplied callback, logging instead of propagating a panic.
pub(crate) fn guarded_callback(callback_name: &'static str, callback: impl FnOnce()) {
    if let Err(panic) = catch_unwind(AssertUnwindSafe(callback)) {
        error!(
            callback = callback_name,
            panic = panic_message(&panic),
            "producer callback panicked"
        );
    }
}

/// Extracts a readable message from a panic payload.
pub(crate) fn panic_message(panic: &Box<dyn Any + Send>) -> String {
    if let Some(message) = panic.downcast_ref::<&'static str>() {
        return (*message).to_string();
    }

    if let Some(message) = panic.downcast_ref::<String>() {
        return message.clone();
    }

    "<non-string panic payload>".to_string()
}
