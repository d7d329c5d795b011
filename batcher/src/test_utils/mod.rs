//! Testing utilities for the commit coordinators.
//!
//! - [`coordinator`] builds coordinators backed by a [`crate::transaction::memory::MemoryStore`].
//! - [`listener`] provides a batch listener recording every callback it receives.
//! - [`unit`] provides units of work that write, fail or panic, recording their outcome.
//! - [`failpoints`] scopes failpoint configuration to a test (feature `failpoints`).
//! - [`notify`] wraps [`tokio::sync::Notify`] with a timeout so that waiting tests fail instead of
//!   hanging.

pub mod coordinator;
#[cfg(feature = "failpoints")]
pub mod failpoints;
pub mod listener;
pub mod notify;
pub mod unit;
