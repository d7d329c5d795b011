//! Concurrency primitives shared by the commit coordinators.
//!
//! - [`gate`] provides the reader-writer gate separating batch contributors from the single
//!   batch completer. Its permits are owned values so that a contributor can hold one across two
//!   separate coordinator calls.
//! - [`alarm`] provides the one-shot alarm service both coordinators use to bound how long work
//!   waits before it is committed.

pub mod alarm;
pub mod gate;
