//! Metrics definitions for batched commit monitoring.

use std::sync::Once;

use metrics::{Unit, describe_counter, describe_histogram};

/// Label for the coordinator name in metrics.
pub const COORDINATOR_LABEL: &str = "coordinator";

/// Label for the outcome of a batch or round in metrics.
pub const OUTCOME_LABEL: &str = "outcome";

// Batch register coordinator metrics

/// Counter for batches completed by the batch register coordinator, labelled by outcome.
pub const BATCHER_BATCHES_COMPLETED_TOTAL: &str = "batcher_batches_completed_total";

/// Counter for batches completed below the size threshold by the staleness alarm, an explicit
/// forced completion, or close.
pub const BATCHER_FORCED_COMPLETIONS_TOTAL: &str = "batcher_forced_completions_total";

/// Histogram for the reported size of each completed batch.
pub const BATCHER_BATCH_SIZE: &str = "batcher_batch_size";

// Drain queue coordinator metrics

/// Counter for drain rounds executed, labelled by outcome.
pub const BATCHER_DRAIN_ROUNDS_TOTAL: &str = "batcher_drain_rounds_total";

/// Histogram for the number of units executed per drain round.
pub const BATCHER_DRAIN_ROUND_UNITS: &str = "batcher_drain_round_units";

/// Counter for coordinators closed because of a fatal error.
pub const BATCHER_FATAL_CLOSES_TOTAL: &str = "batcher_fatal_closes_total";

// Store metrics

/// Counter for commits applied by the in-memory store.
pub const BATCHER_STORE_COMMITS_TOTAL: &str = "batcher_store_commits_total";

/// Counter for rollbacks applied by the in-memory store.
pub const BATCHER_STORE_ROLLBACKS_TOTAL: &str = "batcher_store_rollbacks_total";

static REGISTER_METRICS: Once = Once::new();

/// Registers descriptions for every metric emitted by this crate.
///
/// Safe to call more than once; descriptions are only registered on the first call.
pub fn register_metrics() {
    REGISTER_METRICS.call_once(|| {
        describe_counter!(
            BATCHER_BATCHES_COMPLETED_TOTAL,
            Unit::Count,
            "Batches completed by the batch register coordinator"
        );
        describe_counter!(
            BATCHER_FORCED_COMPLETIONS_TOTAL,
            Unit::Count,
            "Batches completed below the size threshold by the alarm, an explicit force or close"
        );
        describe_histogram!(
            BATCHER_BATCH_SIZE,
            Unit::Count,
            "Total reported size of each completed batch"
        );
        describe_counter!(
            BATCHER_DRAIN_ROUNDS_TOTAL,
            Unit::Count,
            "Rounds executed by the drain queue coordinator"
        );
        describe_histogram!(
            BATCHER_DRAIN_ROUND_UNITS,
            Unit::Count,
            "Units of work executed per drain round"
        );
        describe_counter!(
            BATCHER_FATAL_CLOSES_TOTAL,
            Unit::Count,
            "Coordinators closed because of a fatal error"
        );
        describe_counter!(
            BATCHER_STORE_COMMITS_TOTAL,
            Unit::Count,
            "Commits applied by the in-memory store"
        );
        describe_counter!(
            BATCHER_STORE_ROLLBACKS_TOTAL,
            Unit::Count,
            "Rollbacks applied by the in-memory store"
        );
    });
}
