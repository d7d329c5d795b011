use std::time::Duration;
use std::{fmt, sync::Arc};

use tokio::sync::Notify;
use tokio::time::timeout;

/// Default time tests wait for an expected coordinator outcome.
pub const DEFAULT_NOTIFY_TIMEOUT: Duration = Duration::from_secs(30);

/// An [`Arc<Notify>`] whose waits panic after a timeout.
#[derive(Clone)]
pub struct TimedNotify {
    notify: Arc<Notify>,
    timeout_duration: Duration,
}

impl TimedNotify {
    pub fn new(notify: Arc<Notify>) -> Self {
        Self::with_timeout(notify, DEFAULT_NOTIFY_TIMEOUT)
    }

    pub fn with_timeout(notify: Arc<Notify>, timeout_duration: Duration) -> Self {
        Self {
            notify,
            timeout_duration,
        }
    }

    /// Waits until `condition` holds, re-checking it after every notification.
    ///
    /// # Panics
    ///
    /// Panics if `condition` does not hold before the timeout elapses.
    pub async fn wait_until(&self, mut condition: impl FnMut() -> bool) {
        let wait = async {
            loop {
                // Registered before checking so that a notification sent in between is not lost.
                let notified = self.notify.notified();
                if condition() {
                    return;
                }
                notified.await;
            }
        };

        if timeout(self.timeout_duration, wait).await.is_err() {
            panic!(
                "Test notification timed out after {:?}. \
                 The coordinator never reached the expected state.",
                self.timeout_duration
            );
        }
    }

    /// Wakes every task currently waiting.
    pub fn notify(&self) {
        self.notify.notify_waiters();
    }

    pub fn inner(&self) -> &Arc<Notify> {
        &self.notify
    }
}

impl Default for TimedNotify {
    fn default() -> Self {
        Self::new(Arc::new(Notify::new()))
    }
}

impl fmt::Debug for TimedNotify {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TimedNotify")
            .field("timeout_duration", &self.timeout_duration)
            .finish()
    }
}
