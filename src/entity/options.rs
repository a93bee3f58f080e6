use std::collections::BTreeMap;

use serde::Deserialize;
use serde::Serialize;

use super::size_in_megabytes;
use super::Validator;
use crate::constants::DEFAULT_DRIVERS;
use crate::constants::DEFAULT_FILESYSTEMS;
use crate::constants::DRIVER_CEPH;
use crate::constants::DRIVER_NFS;
use crate::Error;
use crate::Result;

/// Driver-specific parameters handed through to the storage backend.
pub type DriverParams = BTreeMap<String, String>;

/// Options used once, when the volume is created.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateOptions {
    #[serde(default)]
    pub size: String,
    #[serde(default)]
    pub filesystem: String,
}

impl CreateOptions {
    /// Requested size in megabytes.
    pub fn actual_size(&self) -> Result<u64> {
        size_in_megabytes(&self.size)
    }
}

/// Options consulted on every mount and by periodic snapshot work.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuntimeOptions {
    #[serde(rename = "snapshots", default)]
    pub use_snapshots: bool,
    #[serde(default)]
    pub snapshot: SnapshotConfig,
    #[serde(rename = "rate-limit", default)]
    pub rate_limit: RateLimitConfig,
}

impl RuntimeOptions {
    pub(crate) fn check(
        &self,
        v: &mut Validator,
    ) {
        if !self.use_snapshots {
            return;
        }

        v.check(
            is_snapshot_frequency(&self.snapshot.frequency),
            "runtime.snapshot.frequency",
            format!("{:?} must be a number followed by a unit", self.snapshot.frequency),
        );
        v.check(self.snapshot.keep >= 1, "runtime.snapshot.keep", "must be at least 1");
    }
}

/// Digits followed by exactly one unit character, e.g. `30m`.
fn is_snapshot_frequency(frequency: &str) -> bool {
    let mut chars = frequency.chars();
    match chars.next_back() {
        Some(_) => {
            let count = chars.clone().count();
            count > 0 && chars.all(|c| c.is_ascii_digit())
        }
        None => false,
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotConfig {
    #[serde(default)]
    pub frequency: String,
    #[serde(default)]
    pub keep: u32,
}

/// Disk bandwidth limits, in bytes per second; zero means unlimited.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitConfig {
    #[serde(rename = "write-bps", default)]
    pub write_bps: u64,
    #[serde(rename = "read-bps", default)]
    pub read_bps: u64,
}

/// Storage drivers used for each class of operation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackendDrivers {
    #[serde(default)]
    pub crud: String,
    #[serde(default)]
    pub mount: String,
    #[serde(default)]
    pub snapshot: String,
}

impl BackendDrivers {
    /// Expands a `backend` shorthand into its driver set.
    pub fn from_shorthand(backend: &str) -> Option<Self> {
        DEFAULT_DRIVERS
            .iter()
            .find(|(name, ..)| *name == backend)
            .map(|(_, crud, mount, snapshot)| Self {
                crud: crud.to_string(),
                mount: mount.to_string(),
                snapshot: snapshot.to_string(),
            })
    }

    pub(crate) fn check(
        &self,
        v: &mut Validator,
    ) {
        v.non_empty("backends.mount", &self.mount)
            .one_of("backends.mount", &self.mount, &[DRIVER_CEPH, DRIVER_NFS])
            .one_of("backends.crud", &self.crud, &[DRIVER_CEPH, ""])
            .one_of("backends.snapshot", &self.snapshot, &[DRIVER_CEPH, ""]);
    }
}

pub fn default_filesystems() -> BTreeMap<String, String> {
    DEFAULT_FILESYSTEMS
        .iter()
        .map(|(name, cmd)| (name.to_string(), cmd.to_string()))
        .collect()
}

/// Flat option keys accepted on volume creation, and where they land.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum MergeKey {
    Unlocked,
    Size,
    Filesystem,
    Snapshots,
    SnapshotFrequency,
    SnapshotKeep,
    WriteBps,
    ReadBps,
}

impl MergeKey {
    pub(crate) fn parse(key: &str) -> Result<Self> {
        Ok(match key {
            "unlocked" => Self::Unlocked,
            "size" => Self::Size,
            "filesystem" => Self::Filesystem,
            "snapshots" => Self::Snapshots,
            "snapshots.frequency" => Self::SnapshotFrequency,
            "snapshots.keep" => Self::SnapshotKeep,
            "rate-limit.write.bps" => Self::WriteBps,
            "rate-limit.read.bps" => Self::ReadBps,
            other => {
                return Err(Error::InvalidVolume(format!("unknown option {other:?}")));
            }
        })
    }
}

pub(crate) fn parse_bool(
    key: &str,
    value: &str,
) -> Result<bool> {
    match value {
        "1" | "t" | "T" | "true" | "TRUE" | "True" => Ok(true),
        "0" | "f" | "F" | "false" | "FALSE" | "False" => Ok(false),
        _ => Err(Error::InvalidVolume(format!("option {key:?}: {value:?} is not a boolean"))),
    }
}

pub(crate) fn parse_number<T: std::str::FromStr>(
    key: &str,
    value: &str,
) -> Result<T> {
    value
        .parse()
        .map_err(|_| Error::InvalidVolume(format!("option {key:?}: {value:?} is not a number")))
}
