use std::fmt;

use serde::Deserialize;
use serde::Serialize;

use super::key_suffix;
use super::Entity;
use super::Lock;
use super::Volume;
use crate::constants::REASON_CREATE;
use crate::constants::REASON_MOUNT;
use crate::constants::REASON_REMOVE;
use crate::constants::REASON_SNAPSHOT;
use crate::constants::ROOT_USE_VOLUME;
use crate::Error;
use crate::Result;

/// Records which host holds a volume, and why.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Use {
    /// `<policy>/<volume>`
    #[serde(rename = "volume", default)]
    pub volume: String,
    #[serde(rename = "owner", default)]
    pub owner: String,
    #[serde(rename = "reason", default)]
    pub reason: String,
}

impl Use {
    /// Ownerless use for reading whoever holds `volume`.
    pub fn new(volume: &Volume) -> Self {
        Self {
            volume: volume.to_string(),
            ..Default::default()
        }
    }

    fn with_reason(
        reason: &str,
        owner: impl Into<String>,
        volume: &Volume,
    ) -> Self {
        Self {
            volume: volume.to_string(),
            owner: owner.into(),
            reason: reason.to_string(),
        }
    }

    pub fn create_owner(
        owner: impl Into<String>,
        volume: &Volume,
    ) -> Self {
        Self::with_reason(REASON_CREATE, owner, volume)
    }

    pub fn remove_owner(
        owner: impl Into<String>,
        volume: &Volume,
    ) -> Self {
        Self::with_reason(REASON_REMOVE, owner, volume)
    }

    /// Owner is typically a hostname.
    pub fn mount_owner(
        owner: impl Into<String>,
        volume: &Volume,
    ) -> Self {
        Self::with_reason(REASON_MOUNT, owner, volume)
    }

    pub fn snapshot_owner(
        owner: impl Into<String>,
        volume: &Volume,
    ) -> Self {
        Self::with_reason(REASON_SNAPSHOT, owner, volume)
    }
}

impl fmt::Display for Use {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        write!(f, "{:?}: owner: {:?}; reason {:?}", self.volume, self.owner, self.reason)
    }
}

impl Entity for Use {
    fn prefix(&self) -> &'static str {
        ROOT_USE_VOLUME
    }

    fn path(&self) -> Result<String> {
        self.check_volume()?;
        Ok(format!("{}/{}", ROOT_USE_VOLUME, self.volume))
    }

    fn set_key(
        &mut self,
        key: &str,
    ) -> Result<()> {
        self.volume = key_suffix(key, ROOT_USE_VOLUME).to_string();
        self.validate()
    }

    fn validate(&mut self) -> Result<()> {
        self.check_volume()
    }
}

impl Use {
    fn check_volume(&self) -> Result<()> {
        let mut parts = self.volume.split('/');
        match (parts.next(), parts.next(), parts.next()) {
            (Some(policy), Some(volume), None) if !policy.is_empty() && !volume.is_empty() => Ok(()),
            _ => Err(Error::InvalidVolume(format!("{:?} is not <policy>/<volume>", self.volume))),
        }
    }
}

impl Lock for Use {
    fn owner(&self) -> &str {
        &self.owner
    }

    fn reason(&self) -> &str {
        &self.reason
    }
}
