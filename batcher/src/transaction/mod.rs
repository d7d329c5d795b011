//! Transaction abstraction consumed by the coordinators.
//!
//! [`base`] defines the [`base::Transaction`] and [`base::TransactionManager`] traits the
//! coordinators are generic over. [`memory`] provides an in-memory backing store implementing
//! them.

pub mod base;
pub mod memory;
