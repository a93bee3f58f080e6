use std::collections::BTreeMap;
use std::fmt;

use futures::future::BoxFuture;
use serde::Deserialize;
use serde::Serialize;
use tracing::debug;

use super::codec::is_false;
use super::codec::null_as_default;
use super::key_parts;
use super::BackendDrivers;
use super::CreateOptions;
use super::DriverParams;
use super::Entity;
use super::Hook;
use super::Hooks;
use super::Policy;
use super::RuntimeOptions;
use super::Validator;
use super::VolumeRuntime;
use crate::constants::DEFAULT_FILESYSTEM;
use crate::constants::ROOT_VOLUME;
use crate::Error;
use crate::Result;
use crate::Store;

/// Parameters for creating a volume from a policy.
#[derive(Debug, Clone, Default)]
pub struct VolumeRequest {
    pub name: String,
    pub policy: Option<Policy>,
    /// Flat overrides; `mount` names the mount source, every other key must
    /// be a known create or runtime option
    pub options: BTreeMap<String, String>,
}

/// A volume and the options it was created with.
///
/// The record at `volumes/<policy>/<volume>` is paired with a
/// [`VolumeRuntime`] at `runtime-policies/<policy>/<volume>`. The store keeps
/// both in step through this type's hooks, which delegate to
/// [`Volume::load_runtime`], [`Volume::save_runtime`] and
/// [`Volume::delete_runtime`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Volume {
    #[serde(rename = "policy", default)]
    pub policy: String,
    #[serde(rename = "name", default)]
    pub name: String,
    #[serde(default, skip_serializing_if = "is_false")]
    pub unlocked: bool,
    #[serde(rename = "driver", default, deserialize_with = "null_as_default")]
    pub driver: DriverParams,
    #[serde(rename = "mount", default)]
    pub mount_source: String,
    #[serde(rename = "create", default)]
    pub create: CreateOptions,
    #[serde(default, deserialize_with = "null_as_default")]
    pub runtime: RuntimeOptions,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backends: Option<BackendDrivers>,
}

impl Volume {
    /// Volume identity only, suitable for Get and Delete.
    pub fn new(
        policy: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        Self {
            policy: policy.into(),
            name: name.into(),
            ..Default::default()
        }
    }

    /// Builds a volume from a copy of its policy with the request options
    /// merged in.
    pub fn create(request: VolumeRequest) -> Result<Self> {
        let VolumeRequest {
            name,
            policy,
            mut options,
        } = request;

        if name.is_empty() {
            return Err(Error::InvalidVolume("volume name was empty".into()));
        }
        let Some(mut policy) = policy else {
            return Err(Error::InvalidVolume(format!("policy for volume {name:?} was missing")));
        };

        let mount_source = options.remove("mount").unwrap_or_default();
        policy.merge_options(&options)?;
        policy.validate()?;

        let mut volume = Volume {
            policy: policy.name,
            name,
            unlocked: policy.unlocked,
            driver: policy.driver,
            mount_source,
            create: policy.create,
            runtime: policy.runtime,
            backends: policy.backends,
        };
        volume.validate()?;

        if volume.create.filesystem.is_empty() {
            volume.create.filesystem = DEFAULT_FILESYSTEM.to_string();
        }

        Ok(volume)
    }

    pub fn runtime_record(&self) -> VolumeRuntime {
        VolumeRuntime::with_options(&self.policy, &self.name, self.runtime.clone())
    }

    /// Replaces `runtime` with the options stored for this volume.
    pub async fn load_runtime(
        &mut self,
        store: &Store,
    ) -> Result<()> {
        let mut record = VolumeRuntime::new(&self.policy, &self.name);
        store.get(&mut record).await?;
        self.runtime = record.options;
        Ok(())
    }

    /// Writes `runtime` to its own record.
    pub async fn save_runtime(
        &self,
        store: &Store,
    ) -> Result<()> {
        store.set(&mut self.runtime_record()).await
    }

    pub async fn delete_runtime(
        &self,
        store: &Store,
    ) -> Result<()> {
        store.delete(&mut VolumeRuntime::new(&self.policy, &self.name)).await
    }
}

fn load_runtime_hook<'a>(
    store: &'a Store,
    volume: &'a mut Volume,
) -> BoxFuture<'a, Result<()>> {
    Box::pin(volume.load_runtime(store))
}

/// Volumes are create-only: an existing record makes Set fail with `Exists`.
fn create_only_hook<'a>(
    store: &'a Store,
    volume: &'a mut Volume,
) -> BoxFuture<'a, Result<()>> {
    Box::pin(async move {
        let mut existing = Volume::new(&volume.policy, &volume.name);
        match store.get(&mut existing).await {
            Ok(()) => return Err(Error::Exists(volume.to_string())),
            Err(e @ (Error::Transport(_) | Error::Io(_) | Error::TaskFailed(_))) => return Err(e),
            Err(e) => debug!(volume = %volume, "no usable volume record, creating: {}", e),
        }
        volume.save_runtime(store).await
    })
}

fn delete_runtime_hook<'a>(
    store: &'a Store,
    volume: &'a mut Volume,
) -> BoxFuture<'a, Result<()>> {
    Box::pin(volume.delete_runtime(store))
}

impl fmt::Display for Volume {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        write!(f, "{}/{}", self.policy, self.name)
    }
}

impl Entity for Volume {
    fn prefix(&self) -> &'static str {
        ROOT_VOLUME
    }

    fn path(&self) -> Result<String> {
        if self.policy.is_empty() || self.name.is_empty() {
            return Err(Error::InvalidVolume("volume or policy name is missing".into()));
        }
        Ok(format!("{}/{}/{}", ROOT_VOLUME, self.policy, self.name))
    }

    fn set_key(
        &mut self,
        key: &str,
    ) -> Result<()> {
        let [policy, name] = key_parts::<2>(key, ROOT_VOLUME, "volume")?;
        self.policy = policy;
        self.name = name;
        Ok(())
    }

    fn validate(&mut self) -> Result<()> {
        let mut v = Validator::new(format!("volume {self}"));
        v.non_empty("name", &self.name).non_empty("policy", &self.policy);
        match &self.backends {
            Some(backends) => backends.check(&mut v),
            None => {
                v.check(false, "backends", "is required");
            }
        }
        if let Err(e) = self.create.actual_size() {
            v.check(false, "create.size", e.to_string());
        }
        v.finish()
    }

    fn hooks(&self) -> Hooks<Self> {
        Hooks {
            post_get: Some(load_runtime_hook as Hook<Self>),
            pre_set: Some(create_only_hook as Hook<Self>),
            post_delete: Some(delete_runtime_hook as Hook<Self>),
            ..Default::default()
        }
    }
}
