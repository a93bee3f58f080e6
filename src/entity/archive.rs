use std::fmt;

use serde::Deserialize;
use serde::Serialize;

use super::key_parts;
use super::Entity;
use super::Policy;
use crate::constants::ROOT_POLICY_ARCHIVE;
use crate::Error;
use crate::Result;

/// Historical copy of a policy, keyed by the unix time it was published.
///
/// The payload is exactly the policy's own payload.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PolicyRevision {
    pub policy: Policy,
    #[serde(skip)]
    pub revision: i64,
}

impl PolicyRevision {
    pub fn new(
        policy: Policy,
        revision: i64,
    ) -> Self {
        Self { policy, revision }
    }

    /// Identity only, for Get.
    pub fn at(
        name: impl Into<String>,
        revision: i64,
    ) -> Self {
        Self::new(Policy::new(name), revision)
    }
}

impl fmt::Display for PolicyRevision {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        write!(f, "{}@{}", self.policy.name, self.revision)
    }
}

impl Entity for PolicyRevision {
    fn prefix(&self) -> &'static str {
        ROOT_POLICY_ARCHIVE
    }

    fn path(&self) -> Result<String> {
        if self.policy.name.is_empty() || self.revision <= 0 {
            return Err(Error::InvalidPath(format!("incomplete policy revision {self}")));
        }
        Ok(format!("{}/{}/{}", ROOT_POLICY_ARCHIVE, self.policy.name, self.revision))
    }

    fn set_key(
        &mut self,
        key: &str,
    ) -> Result<()> {
        let [name, revision] = key_parts::<2>(key, ROOT_POLICY_ARCHIVE, "policy revision")?;
        self.revision = revision
            .parse()
            .map_err(|_| Error::InvalidPath(format!("revision {revision:?} is not a unix timestamp")))?;
        self.policy.name = name;
        Ok(())
    }

    fn validate(&mut self) -> Result<()> {
        self.policy.validate()
    }
}
