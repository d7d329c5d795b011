//! Reader-writer gate separating batch contributors from the batch completer.
//!
//! Many contributors may hold a shared permit at once, while completing a batch requires the
//! exclusive permit. Permits are owned values rather than scoped guards, so a shared permit can be
//! acquired in one call, carried across arbitrary caller work, and released later from any task or
//! thread.
//!
//! # Deadlock hazard
//!
//! A shared permit that is never released blocks every exclusive acquisition forever. The gate
//! does not time out or reclaim permits: callers own the responsibility of dropping each permit.
//! An exclusive acquisition that is waiting also blocks new shared acquisitions, so a leaked shared
//! permit eventually stalls contributors too.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use tokio::sync::{OwnedRwLockReadGuard, OwnedRwLockWriteGuard, RwLock};

/// Gate granting many shared permits or one exclusive permit.
///
/// Built on [`tokio::sync::RwLock`], whose fair queueing makes a pending exclusive acquisition
/// block later shared acquisitions. Cloning the gate yields another handle to the same gate.
#[derive(Debug, Clone, Default)]
pub struct ReaderWriterGate {
    lock: Arc<RwLock<()>>,
    shared_holders: Arc<AtomicUsize>,
}

impl ReaderWriterGate {
    /// Creates a gate with no permits outstanding.
    pub fn new() -> Self {
        Self::default()
    }

    /// Waits until no exclusive permit is held or pending, then returns a shared permit.
    pub async fn acquire_shared(&self) -> SharedPermit {
        let guard = self.lock.clone().read_owned().await;
        self.shared_holders.fetch_add(1, Ordering::AcqRel);

        SharedPermit {
            _guard: guard,
            shared_holders: self.shared_holders.clone(),
        }
    }

    /// Releases a shared permit.
    ///
    /// Equivalent to dropping the permit; provided so call sites can state the release explicitly.
    pub fn release_shared(permit: SharedPermit) {
        drop(permit);
    }

    /// Waits until every shared permit is released and no other exclusive permit is held.
    pub async fn acquire_exclusive(&self) -> ExclusivePermit {
        let guard = self.lock.clone().write_owned().await;

        ExclusivePermit { _guard: guard }
    }

    /// Releases an exclusive permit, unblocking waiting shared acquisitions.
    pub fn release_exclusive(permit: ExclusivePermit) {
        drop(permit);
    }

    /// Returns the number of shared permits currently held.
    pub fn shared_holders(&self) -> usize {
        self.shared_holders.load(Ordering::Acquire)
    }
}

/// Shared permit held by one contributor.
///
/// Not tied to the acquiring task: the permit may be moved anywhere and is released on drop.
#[derive(Debug)]
#[must_use = "dropping a shared permit releases it immediately"]
pub struct SharedPermit {
    _guard: OwnedRwLockReadGuard<()>,
    shared_holders: Arc<AtomicUsize>,
}

impl Drop for SharedPermit {
    fn drop(&mut self) {
        self.shared_holders.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Exclusive permit held by the single completer.
#[derive(Debug)]
#[must_use = "dropping an exclusive permit releases it immediately"]
pub struct ExclusivePermit {
    _guard: OwnedRwLockWriteGuard<()>,
}
