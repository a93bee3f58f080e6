use std::fmt;
use std::time::Duration;

use serde::Deserialize;
use serde::Serialize;

use super::Entity;
use crate::constants::DEFAULT_GLOBAL_TTL;
use crate::constants::DEFAULT_MOUNT_PATH;
use crate::constants::DEFAULT_TIMEOUT;
use crate::constants::ROOT_GLOBAL;
use crate::constants::TIMEOUT_FIX_BASE;
use crate::constants::TTL_FIX_BASE;
use crate::Result;

/// Process-wide tunables shared by every node.
///
/// Stored in canonical form: durations are real durations, serialized as
/// integer nanoseconds. The published form counts `ttl` in seconds and
/// `timeout` in minutes, still carried in the `Duration` fields. Convert with
/// [`Global::published`] and [`Global::canonical`] exactly once each; applying
/// either twice scales the values twice.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Global {
    #[serde(rename = "Debug", default)]
    pub debug: bool,
    #[serde(rename = "Timeout", default, with = "nanos")]
    pub timeout: Duration,
    #[serde(rename = "TTL", default, with = "nanos")]
    pub ttl: Duration,
    #[serde(rename = "MountPath", default)]
    pub mount_path: String,
}

impl Global {
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy with durations divided down to their published units.
    pub fn published(&self) -> Self {
        Self {
            ttl: div_duration(self.ttl, TTL_FIX_BASE),
            timeout: div_duration(self.timeout, TIMEOUT_FIX_BASE),
            ..self.clone()
        }
    }

    /// Copy with published units multiplied back to real durations.
    ///
    /// Values already at or above their base are left alone.
    pub fn canonical(&self) -> Self {
        let mut canonical = self.clone();
        if self.ttl < TTL_FIX_BASE {
            canonical.ttl = mul_duration(self.ttl, TTL_FIX_BASE);
        }
        if self.timeout < TIMEOUT_FIX_BASE {
            canonical.timeout = mul_duration(self.timeout, TIMEOUT_FIX_BASE);
        }
        canonical
    }
}

// Published values reuse the nanosecond count as a plain number.
fn div_duration(
    value: Duration,
    base: Duration,
) -> Duration {
    Duration::from_nanos((value.as_nanos() / base.as_nanos()) as u64)
}

fn mul_duration(
    value: Duration,
    base: Duration,
) -> Duration {
    Duration::from_nanos((value.as_nanos() * base.as_nanos()).min(u64::MAX as u128) as u64)
}

impl fmt::Display for Global {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        write!(
            f,
            "debug={} ttl={:?} timeout={:?} mount_path={}",
            self.debug, self.ttl, self.timeout, self.mount_path
        )
    }
}

impl Entity for Global {
    fn prefix(&self) -> &'static str {
        ""
    }

    fn path(&self) -> Result<String> {
        Ok(ROOT_GLOBAL.to_string())
    }

    fn set_key(
        &mut self,
        _key: &str,
    ) -> Result<()> {
        Ok(())
    }

    /// Never fails; fills defaults for unset or out of range values.
    fn validate(&mut self) -> Result<()> {
        if self.mount_path.is_empty() {
            self.mount_path = DEFAULT_MOUNT_PATH.to_string();
        }
        if self.ttl < TTL_FIX_BASE {
            self.ttl = DEFAULT_GLOBAL_TTL;
        }
        if self.timeout < TIMEOUT_FIX_BASE {
            self.timeout = DEFAULT_TIMEOUT;
        }
        Ok(())
    }
}

mod nanos {
    use std::time::Duration;

    use serde::Deserialize;
    use serde::Deserializer;
    use serde::Serializer;

    pub fn serialize<S: Serializer>(
        value: &Duration,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_nanos().min(u64::MAX as u128) as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_nanos(u64::deserialize(deserializer)?))
    }
}
