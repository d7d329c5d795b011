//! Batched transactional commit coordination.
//!
//! Many concurrent producers each want their work persisted in a transaction, but committing one
//! transaction per producer is expensive. The coordinators in [`coordinator`] amortize commits by
//! grouping the work of many producers into one transaction, while bounding latency with the
//! alarms of [`concurrency::alarm`] and reporting the commit outcome back to every producer.
//!
//! The coordinators are generic over [`transaction::base::TransactionManager`];
//! [`transaction::memory::MemoryStore`] is an in-memory implementation.

pub mod concurrency;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod failpoints;
mod macros;
pub mod metrics;
#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;
pub mod transaction;
