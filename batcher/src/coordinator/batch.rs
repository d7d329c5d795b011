//! Batch register coordinator.
//!
//! Many concurrent producers contribute to one shared transaction. Each producer calls
//! [`BatchRegisterCoordinator::register`] to obtain the current batch transaction together with a
//! shared gate permit, performs its mutations, and hands the permit back through
//! [`BatchRegisterCoordinator::report`]. The batch commits once the reported size reaches the
//! configured threshold, or when the staleness alarm forces it.
//!
//! Completion takes the exclusive side of the [`ReaderWriterGate`], so a batch never commits while
//! any producer is between `register` and `report`. A [`Contribution`] that is kept alive without
//! being reported therefore blocks every later completion.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use futures::FutureExt;
use metrics::{counter, histogram};
use tracing::{debug, error, warn};

use crate::bail;
use crate::concurrency::alarm::{AlarmHandle, AlarmService};
use crate::concurrency::gate::{ReaderWriterGate, SharedPermit};
use crate::config::BatchRegisterConfig;
use crate::coordinator::listener::{BatchListener, ListenerSet, guarded_callback};
use crate::error::{BatchResult, ErrorKind};
use crate::metrics::{
    BATCHER_BATCH_SIZE, BATCHER_BATCHES_COMPLETED_TOTAL, BATCHER_FORCED_COMPLETIONS_TOTAL,
    COORDINATOR_LABEL, OUTCOME_LABEL, register_metrics,
};
use crate::transaction::base::{Transaction, TransactionManager};

/// Name used for this coordinator in logs and metrics.
const COORDINATOR_NAME: &str = "batch_register";

/// Shared listener handle accepted by the coordinator.
pub type SharedBatchListener<T> = Arc<dyn BatchListener<T>>;

/// Contribution to the current batch, returned by [`BatchRegisterCoordinator::register`].
///
/// Holds a shared gate permit that is released when the contribution is passed to
/// [`BatchRegisterCoordinator::report`]. Dropping a contribution without reporting it releases the
/// permit without contributing to the batch.
#[must_use = "a contribution must be reported, or the batch cannot complete while it is alive"]
pub struct Contribution<T> {
    transaction: Arc<T>,
    permit: SharedPermit,
}

impl<T> Contribution<T> {
    /// Returns the batch transaction to perform mutations in.
    pub fn transaction(&self) -> &Arc<T> {
        &self.transaction
    }
}

impl<T: Transaction> fmt::Debug for Contribution<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Contribution")
            .field("transaction_id", &self.transaction.id())
            .finish()
    }
}

#[derive(Debug, Copy, Clone)]
struct ScheduledAlarm {
    token: u64,
    handle: AlarmHandle,
}

/// Mutable state of the batch being accumulated.
struct Batch<T: Transaction> {
    transaction: Option<Arc<T>>,
    size: usize,
    listeners: ListenerSet<T>,
    alarm: Option<ScheduledAlarm>,
    next_alarm_token: u64,
    closed: bool,
}

/// State taken out of [`Batch`] when it completes.
struct CompletedBatch<T: Transaction> {
    transaction: Arc<T>,
    size: usize,
    listeners: ListenerSet<T>,
    alarm: Option<AlarmHandle>,
}

impl<T: Transaction> Batch<T> {
    fn new() -> Self {
        Self {
            transaction: None,
            size: 0,
            listeners: ListenerSet::new(),
            alarm: None,
            next_alarm_token: 0,
            closed: false,
        }
    }

    /// Resets the batch, returning what has to be committed, if anything.
    fn take_completed(&mut self) -> Option<CompletedBatch<T>> {
        let transaction = self.transaction.take()?;

        Some(CompletedBatch {
            transaction,
            size: std::mem::take(&mut self.size),
            listeners: std::mem::take(&mut self.listeners),
            alarm: self.alarm.take().map(|alarm| alarm.handle),
        })
    }
}

struct Inner<M: TransactionManager> {
    batch_size: usize,
    batch_timeout: Option<Duration>,
    manager: M,
    alarms: Arc<dyn AlarmService>,
    gate: ReaderWriterGate,
    batch: Mutex<Batch<M::Transaction>>,
}

impl<M: TransactionManager> Inner<M> {
    fn lock_batch(&self) -> MutexGuard<'_, Batch<M::Transaction>> {
        self.batch.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Coordinator accumulating contributions of concurrent producers into one shared transaction.
///
/// Cloning the coordinator yields another handle to the same batch.
pub struct BatchRegisterCoordinator<M: TransactionManager> {
    inner: Arc<Inner<M>>,
}

impl<M: TransactionManager> BatchRegisterCoordinator<M> {
    /// Creates a coordinator committing through `manager` and bounding staleness with `alarms`.
    ///
    /// `config` is expected to be validated; a zero batch size commits on every report.
    pub fn new(config: BatchRegisterConfig, manager: M, alarms: Arc<dyn AlarmService>) -> Self {
        register_metrics();

        let inner = Inner {
            batch_size: config.batch_size,
            batch_timeout: config.batch_timeout(),
            manager,
            alarms,
            gate: ReaderWriterGate::new(),
            batch: Mutex::new(Batch::new()),
        };

        Self {
            inner: Arc::new(inner),
        }
    }

    /// Joins the current batch, creating its transaction if none exists.
    ///
    /// Waits while a completion is in progress. The returned [`Contribution`] must be passed to
    /// [`BatchRegisterCoordinator::report`] exactly once.
    pub async fn register(&self) -> BatchResult<Contribution<M::Transaction>> {
        let permit = self.inner.gate.acquire_shared().await;

        let transaction = {
            let mut batch = self.inner.lock_batch();
            if batch.closed {
                bail!(
                    ErrorKind::CoordinatorClosed,
                    "Batch register coordinator is closed"
                );
            }

            match batch.transaction.clone() {
                Some(transaction) => transaction,
                None => {
                    let transaction = Arc::new(self.inner.manager.create_local_transaction()?);
                    debug!(
                        coordinator = COORDINATOR_NAME,
                        transaction_id = %transaction.id(),
                        "started new batch"
                    );
                    batch.transaction = Some(transaction.clone());
                    transaction
                }
            }
        };

        Ok(Contribution {
            transaction,
            permit,
        })
    }

    /// Reports the outcome of a contribution and releases its permit.
    ///
    /// Adds `count` to the batch size and `listener`, if any, to the batch listeners. When the
    /// batch reaches its size threshold it is completed before returning, and a commit failure is
    /// returned to this caller.
    pub async fn report(
        &self,
        contribution: Contribution<M::Transaction>,
        count: usize,
        listener: Option<SharedBatchListener<M::Transaction>>,
    ) -> BatchResult<()> {
        let should_complete = {
            let mut batch = self.inner.lock_batch();
            let was_empty = batch.size == 0;
            batch.size = batch.size.saturating_add(count);

            if let Some(listener) = listener {
                batch.listeners.insert(listener);
            }

            if was_empty {
                self.schedule_alarm(&mut batch);
            }

            batch.size >= self.inner.batch_size
        };

        // The permit must be released before completing, since completion waits for every shared
        // permit including this one.
        ReaderWriterGate::release_shared(contribution.permit);

        if should_complete {
            self.complete(false, None).await?;
        }

        Ok(())
    }

    /// Completes the current batch if it reached its size threshold, or if `force` is set and the
    /// batch is not empty.
    ///
    /// `listener` joins the batch being completed. When nothing is completed it is told the batch
    /// committed, since there is nothing pending for it to wait on. The returned future must be
    /// driven to completion: dropping it mid-commit loses the batch outcome.
    pub async fn complete(
        &self,
        force: bool,
        listener: Option<SharedBatchListener<M::Transaction>>,
    ) -> BatchResult<()> {
        let permit = self.inner.gate.acquire_exclusive().await;

        let completed = {
            let mut batch = self.inner.lock_batch();
            let reached_size = batch.size >= self.inner.batch_size;
            if (force && batch.size > 0) || reached_size {
                if !reached_size {
                    counter!(BATCHER_FORCED_COMPLETIONS_TOTAL).increment(1);
                }
                batch.take_completed()
            } else {
                None
            }
        };

        let Some(CompletedBatch {
            transaction,
            size,
            mut listeners,
            alarm,
        }) = completed
        else {
            drop(permit);
            if let Some(listener) = listener {
                guarded_callback("batch_committed", || listener.batch_committed());
            }
            return Ok(());
        };

        if let Some(listener) = listener {
            listeners.insert(listener);
        }

        debug!(
            coordinator = COORDINATOR_NAME,
            transaction_id = %transaction.id(),
            batch_size = size,
            listeners = listeners.len(),
            force,
            "completing batch"
        );

        for listener in listeners.iter() {
            guarded_callback("batch_precommit", || listener.batch_precommit(&transaction));
        }

        let result = transaction.commit().await;

        let outcome = match &result {
            Ok(()) => {
                for listener in listeners.iter() {
                    guarded_callback("batch_committed", || listener.batch_committed());
                }
                "committed"
            }
            Err(err) => {
                warn!(
                    coordinator = COORDINATOR_NAME,
                    transaction_id = %transaction.id(),
                    error = %err,
                    "batch commit failed"
                );
                for listener in listeners.iter() {
                    guarded_callback("batch_rolled_back", || listener.batch_rolled_back());
                }
                "rolled_back"
            }
        };

        if let Some(alarm) = alarm {
            self.inner.alarms.cancel(alarm);
        }

        counter!(
            BATCHER_BATCHES_COMPLETED_TOTAL,
            COORDINATOR_LABEL => COORDINATOR_NAME,
            OUTCOME_LABEL => outcome
        )
        .increment(1);
        histogram!(BATCHER_BATCH_SIZE).record(size as f64);

        ReaderWriterGate::release_exclusive(permit);

        result
    }

    /// Closes the coordinator.
    ///
    /// Later [`BatchRegisterCoordinator::register`] calls fail with
    /// [`ErrorKind::CoordinatorClosed`]. Any pending batch is completed and its outcome returned.
    pub async fn close(&self) -> BatchResult<()> {
        {
            let mut batch = self.inner.lock_batch();
            if batch.closed {
                return Ok(());
            }
            batch.closed = true;
        }

        let result = self.complete(true, None).await;

        let alarm = self.inner.lock_batch().alarm.take();
        if let Some(alarm) = alarm {
            self.inner.alarms.cancel(alarm.handle);
        }

        debug!(coordinator = COORDINATOR_NAME, "coordinator closed");

        result
    }

    /// Returns the total size reported to the current batch.
    pub fn pending_size(&self) -> usize {
        self.inner.lock_batch().size
    }

    /// Returns whether the coordinator was closed.
    pub fn is_closed(&self) -> bool {
        self.inner.lock_batch().closed
    }

    /// Returns whether a staleness alarm is currently scheduled.
    pub fn has_scheduled_alarm(&self) -> bool {
        self.inner.lock_batch().alarm.is_some()
    }

    /// Schedules the staleness alarm unless one is already scheduled or the timeout is disabled.
    fn schedule_alarm(&self, batch: &mut Batch<M::Transaction>) {
        let Some(batch_timeout) = self.inner.batch_timeout else {
            return;
        };

        if batch.alarm.is_some() {
            return;
        }

        let token = batch.next_alarm_token;
        batch.next_alarm_token += 1;

        let inner = Arc::downgrade(&self.inner);
        let handle = self.inner.alarms.schedule(
            batch_timeout,
            "batch_register_timeout",
            Box::new(move || Self::on_alarm(inner, token).boxed()),
        );

        batch.alarm = Some(ScheduledAlarm { token, handle });
    }

    /// Forces completion of the batch the alarm identified by `token` was scheduled for.
    async fn on_alarm(inner: Weak<Inner<M>>, token: u64) {
        let Some(inner) = inner.upgrade() else {
            return;
        };

        {
            let mut batch = inner.lock_batch();
            match batch.alarm {
                Some(alarm) if alarm.token == token => batch.alarm = None,
                // The alarm was cancelled or superseded after it fired.
                _ => return,
            }
        }

        let coordinator = Self { inner };
        if let Err(err) = coordinator.complete(true, None).await {
            error!(
                coordinator = COORDINATOR_NAME,
                error = %err,
                "forced batch completion failed"
            );
        }
    }
}

impl<M: TransactionManager> Clone for BatchRegisterCoordinator<M> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<M: TransactionManager> fmt::Debug for BatchRegisterCoordinator<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BatchRegisterCoordinator")
            .field("batch_size", &self.inner.batch_size)
            .field("batch_timeout", &self.inner.batch_timeout)
            .field("shared_holders", &self.inner.gate.shared_holders())
            .finish()
    }
}
