//! Commit coordinators amortizing transaction commits over many producers.
//!
//! - [`batch::BatchRegisterCoordinator`] lets producers mutate one shared transaction directly and
//!   commits it once enough contributions were reported or the batch became stale.
//! - [`drain::DrainQueueCoordinator`] queues self-contained units of work and executes them in
//!   rounds, each inside one transaction.
//!
//! Producers observe outcomes through the callbacks of [`listener::BatchListener`] and
//! [`listener::UnitOfWork`].

pub mod batch;
pub mod drain;
pub mod listener;
