//! Typed configuration for the batching coordinators.
//!
//! Configuration is loaded from `configuration/base.*`, the environment specific file selected by
//! `APP_ENVIRONMENT`, and `APP_`-prefixed environment variables, see [`load::load_config`].

pub mod environment;
pub mod load;
pub mod shared;

pub use load::{Config, LoadConfigError, load_config};
