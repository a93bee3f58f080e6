use std::time::Duration;

use config::ConfigError;
use serde::Deserialize;
use serde::Serialize;

use crate::Error;
use crate::Result;

/// Native primitive family of the keyspace
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// Compare-and-swap keyspace with per-key TTLs (etcd v2 keys API)
    #[default]
    Cas,
    /// Session keyspace with TTL sessions and native locks (consul KV)
    Session,
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct BackendConfig {
    #[serde(default)]
    pub kind: BackendKind,

    /// Base URLs of the keyspace servers; the first one is used
    #[serde(default = "default_endpoints")]
    pub endpoints: Vec<String>,

    /// Root under which every managed key lives
    ///
    /// Session keyspaces reject a leading `/`.
    #[serde(default = "default_prefix")]
    pub prefix: String,

    /// Upper bound for one non-blocking request
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            kind: BackendKind::default(),
            endpoints: default_endpoints(),
            prefix: default_prefix(),
            request_timeout_ms: default_request_timeout_ms(),
        }
    }
}

impl BackendConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if self.endpoints.is_empty() {
            return Err(Error::Config(ConfigError::Message(
                "backend.endpoints must name at least one server".into(),
            )));
        }

        if self.prefix.trim_matches('/').is_empty() {
            return Err(Error::Config(ConfigError::Message(
                "backend.prefix cannot be empty".into(),
            )));
        }

        if self.kind == BackendKind::Session && self.prefix.starts_with('/') {
            return Err(Error::Config(ConfigError::Message(format!(
                "backend.prefix {:?} may not start with '/' for session keyspaces",
                self.prefix
            ))));
        }

        if self.request_timeout_ms == 0 {
            return Err(Error::Config(ConfigError::Message(
                "backend.request_timeout_ms must be > 0".into(),
            )));
        }

        Ok(())
    }
}

fn default_endpoints() -> Vec<String> {
    vec!["http://127.0.0.1:2379".to_string()]
}
fn default_prefix() -> String {
    "volplugin".to_string()
}
fn default_request_timeout_ms() -> u64 {
    10_000
}
