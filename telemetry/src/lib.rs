//! Tracing setup shared by services and tests embedding the coordinators.

pub mod logging;

pub use logging::{LogFlusher, TracingError, init_test_tracing, init_tracing};
