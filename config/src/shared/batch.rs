use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::shared::ValidationError;

/// Batch register coordinator configuration.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct BatchRegisterConfig {
    /// Number of reported contributions after which a batch commits.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Maximum age, in milliseconds, of a non-empty batch before it is force completed.
    ///
    /// Zero disables forced completion.
    #[serde(default = "default_batch_timeout_ms")]
    pub batch_timeout_ms: u64,
}

impl BatchRegisterConfig {
    pub const DEFAULT_BATCH_SIZE: usize = 100;

    pub const DEFAULT_BATCH_TIMEOUT_MS: u64 = 1000;

    /// Ensures `batch_size` is non-zero.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.batch_size == 0 {
            return Err(ValidationError::InvalidFieldValue {
                field: "batch_register.batch_size".to_string(),
                constraint: "must be greater than 0".to_string(),
            });
        }

        Ok(())
    }

    /// Returns the staleness timeout, or [`None`] when forced completion is disabled.
    pub fn batch_timeout(&self) -> Option<Duration> {
        (self.batch_timeout_ms > 0).then(|| Duration::from_millis(self.batch_timeout_ms))
    }
}

impl Default for BatchRegisterConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            batch_timeout_ms: default_batch_timeout_ms(),
        }
    }
}

/// Drain queue coordinator configuration.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct DrainQueueConfig {
    /// Backlog length that must be exceeded before a round is dispatched eagerly.
    ///
    /// Zero dispatches a round for every unit enqueued while idle.
    #[serde(default = "default_batch_threshold")]
    pub batch_threshold: usize,
    /// Period, in milliseconds, of the alarm draining backlogs left below the threshold.
    ///
    /// Zero disables the alarm.
    #[serde(default = "default_max_commit_interval_ms")]
    pub max_commit_interval_ms: u64,
}

impl DrainQueueConfig {
    pub const DEFAULT_BATCH_THRESHOLD: usize = 50;

    pub const DEFAULT_MAX_COMMIT_INTERVAL_MS: u64 = 250;

    /// Any threshold and interval is accepted.
    pub fn validate(&self) -> Result<(), ValidationError> {
        Ok(())
    }

    /// Returns the alarm period, or [`None`] when the alarm is disabled.
    pub fn max_commit_interval(&self) -> Option<Duration> {
        (self.max_commit_interval_ms > 0)
            .then(|| Duration::from_millis(self.max_commit_interval_ms))
    }
}

impl Default for DrainQueueConfig {
    fn default() -> Self {
        Self {
            batch_threshold: default_batch_threshold(),
            max_commit_interval_ms: default_max_commit_interval_ms(),
        }
    }
}

fn default_batch_size() -> usize {
    BatchRegisterConfig::DEFAULT_BATCH_SIZE
}

fn default_batch_timeout_ms() -> u64 {
    BatchRegisterConfig::DEFAULT_BATCH_TIMEOUT_MS
}

fn default_batch_threshold() -> usize {
    DrainQueueConfig::DEFAULT_BATCH_THRESHOLD
}

fn default_max_commit_interval_ms() -> u64 {
    DrainQueueConfig::DEFAULT_MAX_COMMIT_INTERVAL_MS
}
