use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use futures::future::BoxFuture;
use tokio::runtime::Handle;
use tokio::task::AbortHandle;
use tokio::time::sleep;
use tracing::debug;

/// Callback invoked once when an alarm fires.
pub type AlarmCallback = Box<dyn FnOnce() -> BoxFuture<'static, ()> + Send>;

/// Identifies a scheduled alarm so that it can be cancelled.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct AlarmHandle(u64);

impl fmt::Display for AlarmHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "alarm-{}", self.0)
    }
}

/// Service scheduling one-shot callbacks after a delay.
///
/// Each scheduled callback runs at most once, on an unspecified task. Cancelling an alarm that
/// already fired is a no-op.
pub trait AlarmService: Send + Sync + fmt::Debug {
    /// Schedules `callback` to run once `delay` has elapsed.
    fn schedule(&self, delay: Duration, name: &'static str, callback: AlarmCallback)
    -> AlarmHandle;

    /// Cancels a scheduled alarm if it has not fired yet.
    fn cancel(&self, handle: AlarmHandle);
}

/// [`AlarmService`] backed by tokio timers.
///
/// Each alarm sleeps on its own task. When the sleep completes the callback is moved onto a
/// detached task, so cancelling the alarm afterwards cannot interrupt a running callback.
#[derive(Debug, Clone)]
pub struct TokioAlarmService {
    inner: Arc<TokioAlarmServiceInner>,
}

#[derive(Debug)]
struct TokioAlarmServiceInner {
    runtime: Handle,
    next_id: AtomicU64,
    pending: Mutex<HashMap<AlarmHandle, AbortHandle>>,
}

impl TokioAlarmServiceInner {
    fn take_pending(&self, handle: AlarmHandle) -> Option<AbortHandle> {
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&handle)
    }
}

impl TokioAlarmService {
    /// Creates a service spawning its timers on the given runtime.
    pub fn new(runtime: Handle) -> Self {
        Self {
            inner: Arc::new(TokioAlarmServiceInner {
                runtime,
                next_id: AtomicU64::new(0),
                pending: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Creates a service bound to the runtime of the calling task.
    ///
    /// # Panics
    ///
    /// Panics when called outside of a tokio runtime.
    pub fn current() -> Self {
        Self::new(Handle::current())
    }

    /// Returns the number of alarms that are scheduled and have not yet fired.
    pub fn pending(&self) -> usize {
        self.inner
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

impl AlarmService for TokioAlarmService {
    fn schedule(
        &self,
        delay: Duration,
        name: &'static str,
        callback: AlarmCallback,
    ) -> AlarmHandle {
        let handle = AlarmHandle(self.inner.next_id.fetch_add(1, Ordering::Relaxed));

        // The pending map is locked across the spawn so the timer task cannot observe the map
        // before its own entry is inserted.
        let mut pending = self
            .inner
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        let inner = self.inner.clone();
        let join_handle = self.inner.runtime.spawn(async move {
            debug!(alarm = %handle, task_name = name, ?delay, "waiting for alarm");
            sleep(delay).await;

            if inner.take_pending(handle).is_none() {
                return;
            }

            debug!(alarm = %handle, task_name = name, "alarm fired");
            inner.runtime.spawn(callback());
        });

        pending.insert(handle, join_handle.abort_handle());

        handle
    }

    fn cancel(&self, handle: AlarmHandle) {
        if let Some(abort_handle) = self.inner.take_pending(handle) {
            debug!(alarm = %handle, "alarm cancelled");
            abort_handle.abort();
        }
    }
}
