//! Configuration management for the volume store.
//!
//! Provides hierarchical configuration loading and validation with:
//! - Default values as code base
//! - Configuration file support (`CONFIG_PATH`)
//! - Environment variable overrides (`VOLSTORE__` prefix)
//! - Section-wise validation
mod backend;
mod dump;
mod lock;
mod watch;
pub use backend::*;
pub use dump::*;
pub use lock::*;
pub use watch::*;

use std::env;

use config::Config;
use config::Environment;
use config::File;
use serde::Deserialize;
use serde::Serialize;

use crate::Result;

pub(crate) const ENV_PREFIX: &str = "VOLSTORE";

/// Main configuration container for a store client
///
/// Sources merge in this order (later overrides earlier):
/// 1. Default values from code
/// 2. Configuration file specified by `CONFIG_PATH`
/// 3. Environment variables with `VOLSTORE__` prefix
#[derive(Serialize, Deserialize, Clone, Debug, Default)]
pub struct StoreConfig {
    /// Which keyspace to talk to and where
    #[serde(default)]
    pub backend: BackendConfig,
    /// Lease and session parameters for locks
    #[serde(default)]
    pub lock: LockConfig,
    /// Watch loop parameters
    #[serde(default)]
    pub watch: WatchConfig,
    /// Keyspace dump output
    #[serde(default)]
    pub dump: DumpConfig,
}

impl StoreConfig {
    /// Loads configuration from hierarchical sources without validation.
    ///
    /// Callers MUST call `validate()` before using the result, which allows
    /// further overrides through `with_override_config()` first.
    ///
    /// # Examples
    /// ```ignore
    /// std::env::set_var("VOLSTORE__BACKEND__PREFIX", "volplugin-test");
    /// let cfg = StoreConfig::new()?.validate()?;
    /// ```
    pub fn new() -> Result<Self> {
        let mut builder = Config::builder().add_source(Config::try_from(&Self::default())?);

        if let Ok(config_path) = env::var("CONFIG_PATH") {
            builder = builder.add_source(File::with_name(&config_path).required(true));
        }

        builder = builder.add_source(
            Environment::with_prefix(ENV_PREFIX)
                .separator("__")
                .ignore_empty(true)
                .try_parsing(true),
        );

        let config: Self = builder.build()?.try_deserialize()?;
        Ok(config)
    }

    /// Applies overrides from another file, then the environment again.
    pub fn with_override_config(
        &self,
        path: &str,
    ) -> Result<Self> {
        let config: Self = Config::builder()
            .add_source(Config::try_from(self)?)
            .add_source(File::with_name(path))
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .ignore_empty(true)
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;
        Ok(config)
    }

    /// Validates every section and returns the validated instance.
    pub fn validate(self) -> Result<Self> {
        self.backend.validate()?;
        self.lock.validate()?;
        self.watch.validate()?;
        self.dump.validate()?;
        Ok(self)
    }
}
