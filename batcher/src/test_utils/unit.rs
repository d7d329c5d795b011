use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;

use crate::bail;
use crate::coordinator::drain::BoxedUnitOfWork;
use crate::coordinator::listener::UnitOfWork;
use crate::error::{BatchError, BatchResult, ErrorKind};
use crate::test_utils::notify::TimedNotify;
use crate::transaction::memory::MemoryTransaction;

/// Final outcome reported to a unit of work.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnitOutcome {
    Committed,
    RolledBack(ErrorKind),
}

#[derive(Debug, Clone)]
enum UnitBehavior {
    Put { key: String, value: Bytes },
    Fail,
    Panic,
    PanicOnCommit { key: String, value: Bytes },
}

/// Creates units of work and records the outcome reported to each of them.
///
/// Outcomes are stored by unit name in the order the callbacks ran.
#[derive(Debug, Clone, Default)]
pub struct UnitRecorder {
    outcomes: Arc<Mutex<Vec<(String, UnitOutcome)>>>,
    notify: TimedNotify,
}

impl UnitRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Unit writing `value` under `key`, named after its key.
    pub fn put(&self, key: &str, value: &str) -> BoxedUnitOfWork<MemoryTransaction> {
        self.unit(
            key,
            UnitBehavior::Put {
                key: key.to_string(),
                value: Bytes::copy_from_slice(value.as_bytes()),
            },
        )
    }

    /// Unit whose execution returns an error.
    pub fn failing(&self, name: &str) -> BoxedUnitOfWork<MemoryTransaction> {
        self.unit(name, UnitBehavior::Fail)
    }

    /// Unit whose execution panics.
    pub fn panicking(&self, name: &str) -> BoxedUnitOfWork<MemoryTransaction> {
        self.unit(name, UnitBehavior::Panic)
    }

    /// Unit writing under `key` whose commit notification panics before recording anything.
    pub fn panicking_on_commit(
        &self,
        key: &str,
        value: &str,
    ) -> BoxedUnitOfWork<MemoryTransaction> {
        self.unit(
            key,
            UnitBehavior::PanicOnCommit {
                key: key.to_string(),
                value: Bytes::copy_from_slice(value.as_bytes()),
            },
        )
    }

    pub fn outcomes(&self) -> Vec<(String, UnitOutcome)> {
        self.outcomes.lock().unwrap().clone()
    }

    /// Returns the outcome reported to the unit called `name`, if any.
    pub fn outcome_of(&self, name: &str) -> Option<UnitOutcome> {
        self.outcomes
            .lock()
            .unwrap()
            .iter()
            .find(|(unit_name, _)| unit_name == name)
            .map(|(_, outcome)| *outcome)
    }

    pub fn committed(&self) -> usize {
        self.count(|outcome| *outcome == UnitOutcome::Committed)
    }

    pub fn rolled_back(&self) -> usize {
        self.count(|outcome| matches!(outcome, UnitOutcome::RolledBack(_)))
    }

    /// Waits until at least `count` units were notified.
    pub async fn wait_for_outcomes(&self, count: usize) {
        self.notify
            .wait_until(|| self.outcomes.lock().unwrap().len() >= count)
            .await;
    }

    fn count(&self, predicate: impl Fn(&UnitOutcome) -> bool) -> usize {
        self.outcomes
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, outcome)| predicate(outcome))
            .count()
    }

    fn unit(&self, name: &str, behavior: UnitBehavior) -> BoxedUnitOfWork<MemoryTransaction> {
        Box::new(RecordingUnit {
            name: name.to_string(),
            behavior,
            recorder: self.clone(),
        })
    }

    fn record(&self, name: &str, outcome: UnitOutcome) {
        self.outcomes
            .lock()
            .unwrap()
            .push((name.to_string(), outcome));
        self.notify.notify();
    }
}

struct RecordingUnit {
    name: String,
    behavior: UnitBehavior,
    recorder: UnitRecorder,
}

#[async_trait]
impl UnitOfWork<MemoryTransaction> for RecordingUnit {
    async fn execute(&self, transaction: &MemoryTransaction) -> BatchResult<()> {
        match &self.behavior {
            UnitBehavior::Put { key, value } | UnitBehavior::PanicOnCommit { key, value } => {
                transaction.put(key.clone(), value.clone()).await
            }
            UnitBehavior::Fail => bail!(
                ErrorKind::UnitExecutionFailed,
                "Unit of work failed",
                format!("unit '{}' was configured to fail", self.name)
            ),
            UnitBehavior::Panic => panic!("unit '{}' was configured to panic", self.name),
        }
    }

    fn committed(&self) {
        if matches!(self.behavior, UnitBehavior::PanicOnCommit { .. }) {
            panic!("unit '{}' was configured to panic on commit", self.name);
        }
        self.recorder.record(&self.name, UnitOutcome::Committed);
    }

    fn rolled_back(&self, cause: &BatchError) {
        self.recorder
            .record(&self.name, UnitOutcome::RolledBack(cause.kind()));
    }
}
