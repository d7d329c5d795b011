//! Shared configuration types for the coordinators.

mod base;
mod batch;

pub use base::ValidationError;
pub use batch::{BatchRegisterConfig, DrainQueueConfig};

use serde::{Deserialize, Serialize};

use crate::load::Config;

/// Configuration root grouping the settings of both coordinators.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct CoordinatorConfig {
    #[serde(default)]
    pub batch_register: BatchRegisterConfig,
    #[serde(default)]
    pub drain_queue: DrainQueueConfig,
}

impl CoordinatorConfig {
    /// Validates the settings of both coordinators.
    pub fn validate(&self) -> Result<(), ValidationError> {
        self.batch_register.validate()?;
        self.drain_queue.validate()
    }
}

impl Config for CoordinatorConfig {
    const LIST_PARSE_KEYS: &'static [&'static str] = &[];
}
