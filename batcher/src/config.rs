//! Coordinator configuration, re-exported from the `config` crate.

pub use ::config::shared::{
    BatchRegisterConfig, CoordinatorConfig, DrainQueueConfig, ValidationError,
};

use crate::batch_error;
use crate::error::{BatchError, ErrorKind};

impl From<ValidationError> for BatchError {
    #[track_caller]
    fn from(err: ValidationError) -> BatchError {
        batch_error!(
            ErrorKind::ConfigError,
            "Invalid coordinator configuration",
            err.to_string(),
            source: err
        )
    }
}
