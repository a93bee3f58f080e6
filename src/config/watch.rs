use std::time::Duration;

use config::ConfigError;
use serde::Deserialize;
use serde::Serialize;

use crate::Error;
use crate::Result;

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct WatchConfig {
    /// Pause after a transient watch failure before polling again
    #[serde(default = "default_error_backoff_ms")]
    pub error_backoff_ms: u64,

    /// Server-side wait of one blocking query
    #[serde(default = "default_wait_time_secs")]
    pub wait_time_secs: u64,

    /// Events retained by the in-memory CAS keyspace for indexed watches
    #[serde(default = "default_history_size")]
    pub history_size: usize,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            error_backoff_ms: default_error_backoff_ms(),
            wait_time_secs: default_wait_time_secs(),
            history_size: default_history_size(),
        }
    }
}

impl WatchConfig {
    pub fn error_backoff(&self) -> Duration {
        Duration::from_millis(self.error_backoff_ms)
    }

    pub fn wait_time(&self) -> Duration {
        Duration::from_secs(self.wait_time_secs)
    }

    pub fn validate(&self) -> Result<()> {
        if self.error_backoff_ms == 0 {
            return Err(Error::Config(ConfigError::Message(
                "watch.error_backoff_ms must be > 0".into(),
            )));
        }

        if !(1..=600).contains(&self.wait_time_secs) {
            return Err(Error::Config(ConfigError::Message(format!(
                "watch.wait_time_secs must be between 1 and 600, got {}",
                self.wait_time_secs
            ))));
        }

        if self.history_size == 0 {
            return Err(Error::Config(ConfigError::Message(
                "watch.history_size must be > 0".into(),
            )));
        }

        Ok(())
    }
}

fn default_error_backoff_ms() -> u64 {
    1000
}
fn default_wait_time_secs() -> u64 {
    300
}
fn default_history_size() -> usize {
    1000
}
