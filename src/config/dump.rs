use std::path::PathBuf;

use config::ConfigError;
use serde::Deserialize;
use serde::Serialize;

use crate::Error;
use crate::Result;

#[derive(Serialize, Deserialize, Clone, Debug, Default)]
pub struct DumpConfig {
    /// Directory receiving dump archives when the caller passes none
    ///
    /// Falls back to the system temp directory.
    #[serde(default)]
    pub dir: Option<PathBuf>,
}

impl DumpConfig {
    pub fn resolve_dir(&self) -> PathBuf {
        self.dir.clone().unwrap_or_else(std::env::temp_dir)
    }

    pub fn validate(&self) -> Result<()> {
        if let Some(dir) = &self.dir {
            if dir.as_os_str().is_empty() {
                return Err(Error::Config(ConfigError::Message("dump.dir cannot be empty".into())));
            }
        }
        Ok(())
    }
}
