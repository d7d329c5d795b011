use std::sync::{Arc, Mutex};

use crate::coordinator::listener::BatchListener;
use crate::test_utils::notify::TimedNotify;
use crate::transaction::base::{Transaction, TransactionId};

/// Callback received by a [`RecordingListener`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerEvent {
    Precommit(TransactionId),
    Committed,
    RolledBack,
}

/// Batch listener recording every callback in the order it was received.
#[derive(Debug, Default)]
pub struct RecordingListener {
    events: Mutex<Vec<ListenerEvent>>,
    notify: TimedNotify,
}

impl RecordingListener {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn events(&self) -> Vec<ListenerEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn precommits(&self) -> usize {
        self.count(|event| matches!(event, ListenerEvent::Precommit(_)))
    }

    pub fn committed(&self) -> usize {
        self.count(|event| *event == ListenerEvent::Committed)
    }

    pub fn rolled_back(&self) -> usize {
        self.count(|event| *event == ListenerEvent::RolledBack)
    }

    /// Number of batch outcomes, committed or rolled back, received so far.
    pub fn outcomes(&self) -> usize {
        self.committed() + self.rolled_back()
    }

    /// Waits until at least `count` batch outcomes were received.
    pub async fn wait_for_outcomes(&self, count: usize) {
        self.notify.wait_until(|| self.outcomes() >= count).await;
    }

    fn count(&self, predicate: impl Fn(&ListenerEvent) -> bool) -> usize {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter(|event| predicate(event))
            .count()
    }

    fn record(&self, event: ListenerEvent) {
        self.events.lock().unwrap().push(event);
        self.notify.notify();
    }
}

impl<T: Transaction> BatchListener<T> for RecordingListener {
    fn batch_precommit(&self, transaction: &T) {
        self.record(ListenerEvent::Precommit(transaction.id()));
    }

    fn batch_committed(&self) {
        self.record(ListenerEvent::Committed);
    }

    fn batch_rolled_back(&self) {
        self.record(ListenerEvent::RolledBack);
    }
}

/// Batch listener that panics when told its batch committed.
#[derive(Debug, Default)]
pub struct PanickingListener;

impl PanickingListener {
    pub fn new() -> Arc<Self> {
        Arc::new(Self)
    }
}

impl<T: Transaction> BatchListener<T> for PanickingListener {
    fn batch_precommit(&self, _transaction: &T) {}

    fn batch_committed(&self) {
        panic!("listener was configured to panic on commit");
    }

    fn batch_rolled_back(&self) {}
}
