use std::sync::Arc;

use crate::concurrency::alarm::TokioAlarmService;
use crate::config::{BatchRegisterConfig, DrainQueueConfig};
use crate::coordinator::batch::BatchRegisterCoordinator;
use crate::coordinator::drain::DrainQueueCoordinator;
use crate::transaction::memory::MemoryStore;

/// Creates a batch register coordinator over a fresh store, returning both.
///
/// Must be called inside a tokio runtime.
pub fn batch_register_coordinator(
    batch_size: usize,
    batch_timeout_ms: u64,
) -> (BatchRegisterCoordinator<MemoryStore>, MemoryStore) {
    let store = MemoryStore::new();
    let config = BatchRegisterConfig {
        batch_size,
        batch_timeout_ms,
    };
    let coordinator = BatchRegisterCoordinator::new(
        config,
        store.clone(),
        Arc::new(TokioAlarmService::current()),
    );

    (coordinator, store)
}

/// Creates a drain queue coordinator over a fresh store, returning both.
///
/// Must be called inside a tokio runtime.
pub fn drain_queue_coordinator(
    batch_threshold: usize,
    max_commit_interval_ms: u64,
) -> (DrainQueueCoordinator<MemoryStore>, MemoryStore) {
    let store = MemoryStore::new();
    let config = DrainQueueConfig {
        batch_threshold,
        max_commit_interval_ms,
    };
    let coordinator = DrainQueueCoordinator::new(
        config,
        store.clone(),
        Arc::new(TokioAlarmService::current()),
    )
    .expect("drain queue coordinator requires a tokio runtime");

    (coordinator, store)
}
