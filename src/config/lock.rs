//! Lock lease configuration
//!
//! ```toml
//! [lock]
//! hold_ttl_secs = 900        # lease behind Acquire, re-armed at 1/4
//! min_session_ttl_ms = 10000 # session keyspaces refuse shorter sessions
//! refresh_jitter = true
//! monitor_retry_ms = 1000
//! ```

use std::time::Duration;

use config::ConfigError;
use serde::Deserialize;
use serde::Serialize;

use crate::Error;
use crate::Result;

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct LockConfig {
    /// Lease attached to locks taken with `Acquire`
    ///
    /// The lease is re-armed at a quarter of its length for as long as the
    /// lock is held, so a crashed holder releases it after at most one lease.
    ///
    /// Default: 900 (15 minutes)
    #[serde(default = "default_hold_ttl_secs")]
    pub hold_ttl_secs: u64,

    /// Session keyspaces clamp lock TTLs up to this value
    ///
    /// Default: 10000 (10 seconds)
    #[serde(default = "default_min_session_ttl_ms")]
    pub min_session_ttl_ms: u64,

    /// Randomize refresh intervals within [ttl/4, ttl/2)
    #[serde(default = "default_refresh_jitter")]
    pub refresh_jitter: bool,

    /// Delay before a lock monitor re-polls after a failed query
    #[serde(default = "default_monitor_retry_ms")]
    pub monitor_retry_ms: u64,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            hold_ttl_secs: default_hold_ttl_secs(),
            min_session_ttl_ms: default_min_session_ttl_ms(),
            refresh_jitter: default_refresh_jitter(),
            monitor_retry_ms: default_monitor_retry_ms(),
        }
    }
}

impl LockConfig {
    pub fn hold_ttl(&self) -> Duration {
        Duration::from_secs(self.hold_ttl_secs)
    }

    pub fn min_session_ttl(&self) -> Duration {
        Duration::from_millis(self.min_session_ttl_ms)
    }

    pub fn monitor_retry(&self) -> Duration {
        Duration::from_millis(self.monitor_retry_ms)
    }

    pub fn validate(&self) -> Result<()> {
        // A quarter of the lease must still be a usable refresh period
        if self.hold_ttl_secs < 4 {
            return Err(Error::Config(ConfigError::Message(format!(
                "lock.hold_ttl_secs must be >= 4, got {}",
                self.hold_ttl_secs
            ))));
        }

        if self.min_session_ttl_ms > self.hold_ttl_secs * 1000 {
            return Err(Error::Config(ConfigError::Message(format!(
                "lock.min_session_ttl_ms ({}) exceeds hold_ttl_secs ({})",
                self.min_session_ttl_ms, self.hold_ttl_secs
            ))));
        }

        if self.monitor_retry_ms == 0 {
            return Err(Error::Config(ConfigError::Message(
                "lock.monitor_retry_ms must be > 0".into(),
            )));
        }

        Ok(())
    }
}

fn default_hold_ttl_secs() -> u64 {
    15 * 60
}
fn default_min_session_ttl_ms() -> u64 {
    10_000
}
fn default_refresh_jitter() -> bool {
    true
}
fn default_monitor_retry_ms() -> u64 {
    1000
}
