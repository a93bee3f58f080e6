use std::collections::BTreeMap;
use std::fmt;

use serde::Deserialize;
use serde::Serialize;

use super::codec::is_false;
use super::codec::null_as_default;
use super::default_filesystems;
use super::key_parts;
use super::parse_bool;
use super::parse_number;
use super::BackendDrivers;
use super::CreateOptions;
use super::DriverParams;
use super::Entity;
use super::MergeKey;
use super::RuntimeOptions;
use super::Validator;
use crate::constants::DRIVER_CEPH;
use crate::constants::DRIVER_NFS;
use crate::constants::ROOT_POLICY;
use crate::Error;
use crate::Result;

/// Named storage and snapshot configuration that volumes are created from.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Policy {
    #[serde(default)]
    pub name: String,
    #[serde(default, skip_serializing_if = "is_false")]
    pub unlocked: bool,
    #[serde(rename = "create", default)]
    pub create: CreateOptions,
    #[serde(default, deserialize_with = "null_as_default")]
    pub runtime: RuntimeOptions,
    #[serde(rename = "driver", default, deserialize_with = "null_as_default")]
    pub driver: DriverParams,
    #[serde(rename = "filesystems", default, deserialize_with = "null_as_default")]
    pub filesystems: BTreeMap<String, String>,
    /// Explicit driver set; derived from `backend` when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backends: Option<BackendDrivers>,
    /// Shorthand naming a default driver set
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub backend: String,
}

impl Policy {
    /// Policy carrying only its name and the default filesystems.
    ///
    /// It will not pass validation until a backend is chosen.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            filesystems: default_filesystems(),
            ..Default::default()
        }
    }

    /// Applies flat string options (as passed on volume creation) onto this
    /// policy's create and runtime options.
    pub fn merge_options(
        &mut self,
        options: &BTreeMap<String, String>,
    ) -> Result<()> {
        for (key, value) in options {
            match MergeKey::parse(key)? {
                MergeKey::Unlocked => self.unlocked = parse_bool(key, value)?,
                MergeKey::Size => self.create.size = value.clone(),
                MergeKey::Filesystem => self.create.filesystem = value.clone(),
                MergeKey::Snapshots => self.runtime.use_snapshots = parse_bool(key, value)?,
                MergeKey::SnapshotFrequency => self.runtime.snapshot.frequency = value.clone(),
                MergeKey::SnapshotKeep => self.runtime.snapshot.keep = parse_number(key, value)?,
                MergeKey::WriteBps => self.runtime.rate_limit.write_bps = parse_number(key, value)?,
                MergeKey::ReadBps => self.runtime.rate_limit.read_bps = parse_number(key, value)?,
            }
        }
        Ok(())
    }

    fn reject(
        &self,
        field: &str,
        message: String,
    ) -> Result<()> {
        let mut v = Validator::new(format!("policy {:?}", self.name));
        v.check(false, field, message);
        v.finish()
    }
}

impl fmt::Display for Policy {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        f.write_str(&self.name)
    }
}

impl Entity for Policy {
    fn prefix(&self) -> &'static str {
        ROOT_POLICY
    }

    fn path(&self) -> Result<String> {
        if self.name.is_empty() {
            return Err(Error::InvalidPath("name is blank for this policy".into()));
        }
        Ok(format!("{}/{}", ROOT_POLICY, self.name))
    }

    fn set_key(
        &mut self,
        key: &str,
    ) -> Result<()> {
        let [name] = key_parts::<1>(key, ROOT_POLICY, "policy")?;
        self.name = name;
        Ok(())
    }

    fn validate(&mut self) -> Result<()> {
        let mut v = Validator::new(format!("policy {:?}", self.name));
        self.runtime.check(&mut v);
        v.non_empty("name", &self.name);
        if let Some(backends) = &self.backends {
            backends.check(&mut v);
        }
        if !self.backend.is_empty() {
            v.one_of("backend", &self.backend, &[DRIVER_CEPH, DRIVER_NFS]);
        }
        v.check(
            self.backends.is_some() || !self.backend.is_empty(),
            "backend",
            "one of backend or backends is required",
        );
        v.finish()?;

        let backends = match &self.backends {
            Some(backends) => backends.clone(),
            None => match BackendDrivers::from_shorthand(&self.backend) {
                Some(derived) => {
                    self.backends = Some(derived.clone());
                    derived
                }
                None => {
                    return self.reject("backend", format!("invalid backend {:?}", self.backend));
                }
            },
        };

        if !backends.crud.is_empty() && !matches!(self.create.actual_size(), Ok(size) if size > 0) {
            return self.reject(
                "create.size",
                format!(
                    "size {:?} must be non-zero for CRUD backend {:?}",
                    self.create.size, backends.crud
                ),
            );
        }

        Ok(())
    }
}
