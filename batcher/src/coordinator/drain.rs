//! Continuous drain queue coordinator.
//!
//! Producers enqueue self-contained [`UnitOfWork`]s. Once the backlog exceeds the configured
//! threshold, the pending queue is swapped out and executed against one transaction on a spawned
//! task. While the backlog stays above the threshold that task keeps draining round after round
//! without going back through the scheduler. A periodic alarm drains whatever is left below the
//! threshold so that no unit waits longer than the commit interval.
//!
//! At most one round executes at any time. Every accepted unit is told exactly once whether its
//! round committed or rolled back.

use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures::FutureExt;
use metrics::{counter, histogram};
use tokio::runtime::Handle;
use tokio::sync::watch;
use tracing::{debug, error, warn};

use crate::concurrency::alarm::{AlarmHandle, AlarmService};
use crate::config::DrainQueueConfig;
use crate::coordinator::listener::{UnitOfWork, guarded_callback, panic_message};
use crate::error::{BatchError, BatchResult, ErrorKind};
use crate::metrics::{
    BATCHER_DRAIN_ROUND_UNITS, BATCHER_DRAIN_ROUNDS_TOTAL, BATCHER_FATAL_CLOSES_TOTAL,
    COORDINATOR_LABEL, OUTCOME_LABEL, register_metrics,
};
use crate::transaction::base::{Transaction, TransactionManager};
use crate::{bail, batch_error};

/// Name used for this coordinator in logs and metrics.
const COORDINATOR_NAME: &str = "drain_queue";

/// Boxed unit of work accepted by the coordinator.
pub type BoxedUnitOfWork<T> = Box<dyn UnitOfWork<T>>;

struct DrainState<T> {
    pending: Vec<BoxedUnitOfWork<T>>,
    executing: bool,
    closed: bool,
    drained_since_alarm: bool,
    alarm: Option<AlarmHandle>,
}

impl<T> DrainState<T> {
    fn is_idle(&self) -> bool {
        self.pending.is_empty() && !self.executing
    }
}

/// What the drain task does once a round has been notified.
enum NextRound<T: Transaction> {
    /// Execute another round right away.
    Continue {
        units: Vec<BoxedUnitOfWork<T>>,
        transaction: T,
    },
    /// Stop draining; `abandoned` units were pending when the coordinator was found closed.
    Stop { abandoned: Vec<BoxedUnitOfWork<T>> },
    /// Creating the next transaction failed, which closed the coordinator.
    Fatal {
        error: BatchError,
        abandoned: Vec<BoxedUnitOfWork<T>>,
    },
}

struct Inner<M: TransactionManager> {
    batch_threshold: usize,
    max_commit_interval: Option<Duration>,
    manager: M,
    alarms: Arc<dyn AlarmService>,
    runtime: Handle,
    state: Mutex<DrainState<M::Transaction>>,
    idle_tx: watch::Sender<bool>,
}

impl<M: TransactionManager> Inner<M> {
    fn lock_state(&self) -> MutexGuard<'_, DrainState<M::Transaction>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Publishes whether the queue is idle to [`DrainQueueCoordinator::wait_until_idle`] waiters.
    fn publish_idle(&self, state: &DrainState<M::Transaction>) {
        let idle = state.is_idle();
        self.idle_tx.send_if_modified(|current| {
            let modified = *current != idle;
            *current = idle;
            modified
        });
    }

    /// Swaps out the pending queue and spawns a task executing it in a new transaction.
    ///
    /// Must be called with the state lock held and no round executing.
    fn start_round(self: &Arc<Self>, state: &mut DrainState<M::Transaction>) -> BatchResult<()> {
        let transaction = self.manager.create_local_transaction()?;
        let units = std::mem::take(&mut state.pending);
        state.executing = true;

        debug!(
            coordinator = COORDINATOR_NAME,
            transaction_id = %transaction.id(),
            units = units.len(),
            "dispatching drain round"
        );

        let inner = self.clone();
        self.runtime.spawn(inner.drain(units, transaction));

        Ok(())
    }

    /// Marks the coordinator closed and returns the units that will never execute.
    ///
    /// Must be called with the state lock held.
    fn close_locked(
        &self,
        state: &mut DrainState<M::Transaction>,
    ) -> Vec<BoxedUnitOfWork<M::Transaction>> {
        state.closed = true;
        if let Some(alarm) = state.alarm.take() {
            self.alarms.cancel(alarm);
        }

        if state.executing {
            // The running round takes care of whatever is left once it observes the close.
            Vec::new()
        } else {
            std::mem::take(&mut state.pending)
        }
    }

    /// Closes the coordinator after a failure it cannot recover from.
    fn close_fatally(
        &self,
        state: &mut DrainState<M::Transaction>,
        error: &BatchError,
    ) -> Vec<BoxedUnitOfWork<M::Transaction>> {
        error!(
            coordinator = COORDINATOR_NAME,
            error = %error,
            "closing coordinator after fatal error"
        );
        counter!(BATCHER_FATAL_CLOSES_TOTAL, COORDINATOR_LABEL => COORDINATOR_NAME).increment(1);

        state.executing = false;
        let abandoned = self.close_locked(state);
        self.publish_idle(state);

        abandoned
    }

    /// Executes rounds until the backlog drops to the threshold or the coordinator closes.
    async fn drain(
        self: Arc<Self>,
        mut units: Vec<BoxedUnitOfWork<M::Transaction>>,
        mut transaction: M::Transaction,
    ) -> BatchResult<()> {
        loop {
            let outcome = self.execute_round(&units, &transaction).await;
            notify_round(units, &transaction, &outcome);

            match self.next_round(outcome.is_ok()) {
                NextRound::Continue {
                    units: next_units,
                    transaction: next_transaction,
                } => {
                    units = next_units;
                    transaction = next_transaction;
                }
                NextRound::Stop { abandoned } => {
                    notify_abandoned(abandoned);
                    return Ok(());
                }
                NextRound::Fatal { error, abandoned } => {
                    notify_rolled_back(abandoned, &error);
                    return Err(error);
                }
            }
        }
    }

    /// Executes every unit in order, then commits, rolling back on the first failure.
    async fn execute_round(
        &self,
        units: &[BoxedUnitOfWork<M::Transaction>],
        transaction: &M::Transaction,
    ) -> BatchResult<()> {
        let mut outcome = Ok(());

        for (index, unit) in units.iter().enumerate() {
            let result = AssertUnwindSafe(unit.execute(transaction))
                .catch_unwind()
                .await
                .unwrap_or_else(|panic| {
                    Err(batch_error!(
                        ErrorKind::UnitPanic,
                        "Unit of work panicked during execution",
                        panic_message(&panic)
                    ))
                });

            if let Err(err) = result {
                warn!(
                    coordinator = COORDINATOR_NAME,
                    transaction_id = %transaction.id(),
                    unit_index = index,
                    error = %err,
                    "unit of work failed, abandoning round"
                );
                outcome = Err(err);
                break;
            }
        }

        if outcome.is_ok() {
            outcome = transaction.commit().await;
        }

        if let Err(err) = &outcome {
            debug!(
                coordinator = COORDINATOR_NAME,
                transaction_id = %transaction.id(),
                error = %err,
                "rolling back drain round"
            );

            if let Err(rollback_err) = transaction.rollback().await {
                warn!(
                    coordinator = COORDINATOR_NAME,
                    transaction_id = %transaction.id(),
                    error = %rollback_err,
                    "drain round rollback failed"
                );
            }
        }

        let outcome_label = if outcome.is_ok() {
            "committed"
        } else {
            "rolled_back"
        };
        counter!(
            BATCHER_DRAIN_ROUNDS_TOTAL,
            COORDINATOR_LABEL => COORDINATOR_NAME,
            OUTCOME_LABEL => outcome_label
        )
        .increment(1);
        histogram!(BATCHER_DRAIN_ROUND_UNITS).record(units.len() as f64);

        outcome
    }

    /// Decides, under the state lock, whether the drain task runs another round.
    fn next_round(&self, succeeded: bool) -> NextRound<M::Transaction> {
        let mut state = self.lock_state();

        if !state.closed && succeeded && state.pending.len() > self.batch_threshold {
            match self.manager.create_local_transaction() {
                Ok(transaction) => {
                    let units = std::mem::take(&mut state.pending);
                    debug!(
                        coordinator = COORDINATOR_NAME,
                        transaction_id = %transaction.id(),
                        units = units.len(),
                        "continuing drain with backlog"
                    );
                    self.publish_idle(&state);

                    return NextRound::Continue { units, transaction };
                }
                Err(error) => {
                    let abandoned = self.close_fatally(&mut state, &error);
                    return NextRound::Fatal { error, abandoned };
                }
            }
        }

        state.executing = false;
        let abandoned = if state.closed {
            std::mem::take(&mut state.pending)
        } else {
            Vec::new()
        };
        self.publish_idle(&state);

        NextRound::Stop { abandoned }
    }

    /// Drains the backlog left below the threshold, then reschedules itself.
    fn on_interval(self: &Arc<Self>) {
        let abandoned = {
            let mut state = self.lock_state();
            state.alarm = None;

            if state.closed {
                return;
            }

            let mut abandoned = None;
            if !state.drained_since_alarm && !state.executing && !state.pending.is_empty() {
                if let Err(error) = self.start_round(&mut state) {
                    let units = self.close_fatally(&mut state, &error);
                    abandoned = Some((error, units));
                }
            }

            state.drained_since_alarm = false;
            if abandoned.is_none() {
                self.schedule_interval(&mut state);
            }
            self.publish_idle(&state);

            abandoned
        };

        if let Some((error, units)) = abandoned {
            notify_rolled_back(units, &error);
        }
    }

    fn schedule_interval(self: &Arc<Self>, state: &mut DrainState<M::Transaction>) {
        let Some(interval) = self.max_commit_interval else {
            return;
        };

        let inner = Arc::downgrade(self);
        let handle = self.alarms.schedule(
            interval,
            "drain_queue_interval",
            Box::new(move || {
                async move {
                    if let Some(inner) = inner.upgrade() {
                        inner.on_interval();
                    }
                }
                .boxed()
            }),
        );
        state.alarm = Some(handle);
    }
}

/// Coordinator executing queued units of work in batched transactions.
///
/// Cloning the coordinator yields another handle to the same queue.
pub struct DrainQueueCoordinator<M: TransactionManager> {
    inner: Arc<Inner<M>>,
}

impl<M: TransactionManager> DrainQueueCoordinator<M> {
    /// Creates a coordinator executing rounds on the runtime of the calling task.
    ///
    /// Fails with [`ErrorKind::DispatchFailed`] when called outside of a tokio runtime.
    pub fn new(
        config: DrainQueueConfig,
        manager: M,
        alarms: Arc<dyn AlarmService>,
    ) -> BatchResult<Self> {
        let runtime = Handle::try_current().map_err(|err| {
            batch_error!(
                ErrorKind::DispatchFailed,
                "Drain queue coordinator requires a tokio runtime",
                source: err
            )
        })?;
        register_metrics();

        let (idle_tx, _) = watch::channel(true);
        let inner = Arc::new(Inner {
            batch_threshold: config.batch_threshold,
            max_commit_interval: config.max_commit_interval(),
            manager,
            alarms,
            runtime,
            state: Mutex::new(DrainState {
                pending: Vec::new(),
                executing: false,
                closed: false,
                drained_since_alarm: false,
                alarm: None,
            }),
            idle_tx,
        });

        {
            let mut state = inner.lock_state();
            inner.schedule_interval(&mut state);
        }

        Ok(Self { inner })
    }

    /// Queues `unit` for execution.
    ///
    /// When no round is executing and the backlog exceeds the threshold, a round is dispatched
    /// before returning. Fails with [`ErrorKind::CoordinatorClosed`] once the coordinator is
    /// closed, in which case `unit` is dropped without being notified. If dispatching the round
    /// fails the coordinator closes, every pending unit including `unit` is rolled back, and the
    /// error is returned.
    pub fn enqueue(&self, unit: BoxedUnitOfWork<M::Transaction>) -> BatchResult<()> {
        let abandoned = {
            let mut state = self.inner.lock_state();
            if state.closed {
                bail!(
                    ErrorKind::CoordinatorClosed,
                    "Drain queue coordinator is closed"
                );
            }

            state.pending.push(unit);

            let mut abandoned = None;
            if !state.executing && state.pending.len() > self.inner.batch_threshold {
                state.drained_since_alarm = true;
                if let Err(error) = self.inner.start_round(&mut state) {
                    let units = self.inner.close_fatally(&mut state, &error);
                    abandoned = Some((error, units));
                }
            }
            self.inner.publish_idle(&state);

            abandoned
        };

        if let Some((error, units)) = abandoned {
            notify_rolled_back(units, &error);
            return Err(error);
        }

        Ok(())
    }

    /// Closes the coordinator.
    ///
    /// Later [`DrainQueueCoordinator::enqueue`] calls fail. A round already executing runs to
    /// completion and notifies its units; units still pending are rolled back with
    /// [`ErrorKind::CoordinatorClosed`].
    pub fn close(&self) {
        let abandoned = {
            let mut state = self.inner.lock_state();
            if state.closed {
                return;
            }

            let abandoned = self.inner.close_locked(&mut state);
            self.inner.publish_idle(&state);

            abandoned
        };

        debug!(coordinator = COORDINATOR_NAME, "coordinator closed");
        notify_abandoned(abandoned);
    }

    /// Waits until no unit is pending and no round is executing.
    ///
    /// Units left below the threshold are only drained by the periodic alarm. With the alarm
    /// disabled, units stranded at or below the threshold are never drained on their own, so this
    /// waits forever unless more units arrive or the coordinator closes. Wrap the call in a
    /// timeout when the interval is zero.
    pub async fn wait_until_idle(&self) {
        let mut idle_rx = self.inner.idle_tx.subscribe();
        // The sender lives as long as `self`, so waiting cannot fail.
        let _ = idle_rx.wait_for(|idle| *idle).await;
    }

    /// Returns whether the coordinator was closed.
    pub fn is_closed(&self) -> bool {
        self.inner.lock_state().closed
    }

    /// Returns whether a round is currently executing.
    pub fn is_executing(&self) -> bool {
        self.inner.lock_state().executing
    }

    /// Returns the number of units waiting for the next round.
    pub fn pending_len(&self) -> usize {
        self.inner.lock_state().pending.len()
    }
}

impl<M: TransactionManager> Clone for DrainQueueCoordinator<M> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<M: TransactionManager> fmt::Debug for DrainQueueCoordinator<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DrainQueueCoordinator")
            .field("batch_threshold", &self.inner.batch_threshold)
            .field("max_commit_interval", &self.inner.max_commit_interval)
            .finish()
    }
}

/// Tells every unit of a finished round how the round ended.
fn notify_round<T: Transaction>(
    units: Vec<BoxedUnitOfWork<T>>,
    transaction: &T,
    outcome: &BatchResult<()>,
) {
    match outcome {
        Ok(()) => {
            debug!(
                coordinator = COORDINATOR_NAME,
                transaction_id = %transaction.id(),
                units = units.len(),
                "drain round committed"
            );
            for unit in units {
                guarded_callback("committed", || unit.committed());
            }
        }
        Err(err) => notify_rolled_back(units, err),
    }
}

fn notify_rolled_back<T: Transaction>(units: Vec<BoxedUnitOfWork<T>>, cause: &BatchError) {
    for unit in units {
        guarded_callback("rolled_back", || unit.rolled_back(cause));
    }
}

/// Rolls back units that were pending when the coordinator closed.
fn notify_abandoned<T: Transaction>(units: Vec<BoxedUnitOfWork<T>>) {
    if units.is_empty() {
        return;
    }

    let cause = batch_error!(
        ErrorKind::CoordinatorClosed,
        "Coordinator closed before the unit of work was executed",
        format!("{} pending units abandoned", units.len())
    );
    notify_rolled_back(units, &cause);
}
