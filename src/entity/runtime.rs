use std::fmt;

use serde::Deserialize;
use serde::Serialize;

use super::key_parts;
use super::Entity;
use super::RuntimeOptions;
use super::Validator;
use crate::constants::ROOT_RUNTIME_OPTIONS;
use crate::Error;
use crate::Result;

/// Runtime options of one volume, stored apart from the volume record.
///
/// The identity fields are not part of the payload; they come from the key.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeRuntime {
    #[serde(skip)]
    policy: String,
    #[serde(skip)]
    volume: String,
    #[serde(flatten)]
    pub options: RuntimeOptions,
}

impl VolumeRuntime {
    pub fn new(
        policy: impl Into<String>,
        volume: impl Into<String>,
    ) -> Self {
        Self {
            policy: policy.into(),
            volume: volume.into(),
            options: RuntimeOptions::default(),
        }
    }

    pub fn with_options(
        policy: impl Into<String>,
        volume: impl Into<String>,
        options: RuntimeOptions,
    ) -> Self {
        Self {
            options,
            ..Self::new(policy, volume)
        }
    }

    pub fn policy(&self) -> &str {
        &self.policy
    }

    pub fn volume(&self) -> &str {
        &self.volume
    }
}

impl fmt::Display for VolumeRuntime {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        write!(f, "{}/{}", self.policy, self.volume)
    }
}

impl Entity for VolumeRuntime {
    fn prefix(&self) -> &'static str {
        ROOT_RUNTIME_OPTIONS
    }

    fn path(&self) -> Result<String> {
        if self.policy.is_empty() || self.volume.is_empty() {
            return Err(Error::InvalidPath("empty policy or volume name for runtime options".into()));
        }
        Ok(format!("{}/{}/{}", ROOT_RUNTIME_OPTIONS, self.policy, self.volume))
    }

    fn set_key(
        &mut self,
        key: &str,
    ) -> Result<()> {
        let [policy, volume] = key_parts::<2>(key, ROOT_RUNTIME_OPTIONS, "runtime options")?;
        self.policy = policy;
        self.volume = volume;
        Ok(())
    }

    fn validate(&mut self) -> Result<()> {
        let mut v = Validator::new(format!("runtime options {self}"));
        self.options.check(&mut v);
        v.finish()
    }
}
