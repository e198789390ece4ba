//! Configuration types for the coordinator.

use figment::providers::{Env, Format, Toml};
use figment::Figment;
use serde::Deserialize;
use std::time::Duration;

use crate::error::{CoordError, Result};

/// Coordinator configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct CoordConfig {
    /// Trigger queue configuration.
    pub queue: QueueConfig,
    /// Retry configuration.
    pub retry: RetryConfig,
    /// Cleanup configuration.
    pub cleanup: CleanupConfig,
}

impl CoordConfig {
    /// Loads configuration from `meridian.toml` merged with `MERIDIAN_`
    /// prefixed environment variables.
    pub fn load() -> Result<Self> {
        Figment::new()
            .merge(Toml::file("meridian.toml"))
            .merge(Env::prefixed("MERIDIAN_").split("_"))
            .extract()
            .map_err(|e| CoordError::Config(e.to_string()))
    }
}

/// Trigger queue configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Maximum number of pending trigger tasks.
    pub capacity: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self { capacity: 1024 }
    }
}

/// Retry configuration.
///
/// The bring-up bound is deliberately large so the coordinator patiently
/// waits for workers that have not joined the session registry yet. The
/// recall bound covers individual worker RPCs.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Attempts while waiting for the worker roster to come up.
    pub connect_attempts: u32,
    /// Interval between bring-up attempts.
    #[serde(with = "serde_duration_millis")]
    pub connect_interval: Duration,
    /// Attempts per worker RPC.
    pub recall_attempts: u32,
    /// Interval between RPC attempts.
    #[serde(with = "serde_duration_millis")]
    pub recall_interval: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            connect_attempts: 100_000,
            connect_interval: Duration::from_millis(200),
            recall_attempts: 3,
            recall_interval: Duration::from_millis(500),
        }
    }
}

/// Cleanup configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CleanupConfig {
    /// How long a failed task's state stays readable before its keys are
    /// removed.
    #[serde(with = "serde_duration_millis")]
    pub failed_task_grace: Duration,
}

impl Default for CleanupConfig {
    fn default() -> Self {
        Self {
            failed_task_grace: Duration::from_secs(60),
        }
    }
}

/// Serde helper for Duration as milliseconds.
mod serde_duration_millis {
    use serde::{Deserialize, Deserializer};
    use std::time::Duration;

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}
