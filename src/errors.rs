//! Volume Store Error Taxonomy
//!
//! Every failure surfaced by the store falls into one closed set of variants,
//! whichever backend produced it. Structural failures (validation, missing or
//! duplicate records) and transport failures (native keyspace codes, HTTP)
//! are kept apart, and native codes are folded into the structural members
//! through a single translation table so callers never branch on backend.

use std::fmt;
use std::time::Duration;

use config::ConfigError;
use serde::Deserialize;
use tokio::task::JoinError;

#[doc(hidden)]
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// No record stored at the requested location
    #[error("{0}: does not exist")]
    NotExists(String),

    /// A record already occupies the requested location
    #[error("{0}: already exists")]
    Exists(String),

    /// Conditional write found a different previous value than expected
    #[error("lock mismatch: {0}")]
    LockMismatch(String),

    /// Lock is held by another payload, or the caller does not hold it
    #[error("lock failed: {0}")]
    LockFailed(String),

    /// Key could not be mapped onto an entity identity
    #[error("invalid path: {0}")]
    InvalidPath(String),

    /// Volume request or volume identity is malformed
    #[error("invalid volume: {0}")]
    InvalidVolume(String),

    /// Aggregated schema violations
    #[error(transparent)]
    Validation(#[from] ValidationError),

    /// Payload could not be encoded or decoded
    #[error(transparent)]
    Serialization(#[from] serde_json::Error),

    /// Native keyspace failures without a structural counterpart
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// Store configuration failures
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// Background task panicked or was aborted
    #[error(transparent)]
    TaskFailed(#[from] JoinError),
}

impl Error {
    pub fn is_not_exists(&self) -> bool {
        matches!(self, Error::NotExists(_))
    }

    pub fn is_exists(&self) -> bool {
        matches!(self, Error::Exists(_))
    }

    pub fn is_lock_failed(&self) -> bool {
        matches!(self, Error::LockFailed(_))
    }

    pub fn is_lock_mismatch(&self) -> bool {
        matches!(self, Error::LockMismatch(_))
    }

    pub fn is_validation(&self) -> bool {
        matches!(self, Error::Validation(_))
    }

    /// Wraps any error into a `LockFailed`, keeping its message.
    pub(crate) fn into_lock_failed(self) -> Error {
        match self {
            Error::LockFailed(_) => self,
            other => Error::LockFailed(other.to_string()),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// CAS keyspace reported a code outside the translation table
    #[error(transparent)]
    Cas(CasError),

    /// Session keyspace refused or failed a request
    #[error("session keyspace: {0}")]
    Session(String),

    #[error(transparent)]
    Http(#[from] reqwest::Error),

    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    /// Response status with a body no keyspace error decoder understood
    #[error("unexpected status {0}: {1}")]
    Status(u16, String),
}

/// etcd v2 style error codes.
pub mod cas_code {
    pub const KEY_NOT_FOUND: u64 = 100;
    pub const TEST_FAILED: u64 = 101;
    pub const NOT_FILE: u64 = 102;
    pub const NOT_DIR: u64 = 104;
    pub const NODE_EXIST: u64 = 105;
    pub const ROOT_RONLY: u64 = 107;
    pub const DIR_NOT_EMPTY: u64 = 108;
    pub const PREV_VALUE_REQUIRED: u64 = 201;
    pub const TTL_NAN: u64 = 202;
    pub const EVENT_INDEX_CLEARED: u64 = 401;
}

/// Error body returned by a CAS keyspace.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct CasError {
    #[serde(rename = "errorCode")]
    pub code: u64,
    pub message: String,
    /// Key the failure refers to
    #[serde(default)]
    pub cause: String,
    #[serde(default)]
    pub index: u64,
}

impl CasError {
    pub fn new(
        code: u64,
        cause: impl Into<String>,
        index: u64,
    ) -> Self {
        let message = match code {
            cas_code::KEY_NOT_FOUND => "Key not found",
            cas_code::TEST_FAILED => "Compare failed",
            cas_code::NOT_FILE => "Not a file",
            cas_code::NOT_DIR => "Not a directory",
            cas_code::NODE_EXIST => "Key already exists",
            cas_code::ROOT_RONLY => "Root is read only",
            cas_code::DIR_NOT_EMPTY => "Directory not empty",
            cas_code::PREV_VALUE_REQUIRED => "PrevValue is Required in POST form",
            cas_code::TTL_NAN => "The given TTL in POST form is not a number",
            cas_code::EVENT_INDEX_CLEARED => "The event in requested index is outdated and cleared",
            _ => "Unknown error",
        };
        Self {
            code,
            message: message.to_string(),
            cause: cause.into(),
            index,
        }
    }

    pub fn is(
        &self,
        code: u64,
    ) -> bool {
        self.code == code
    }
}

impl fmt::Display for CasError {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        write!(f, "{}: {} ({}) [{}]", self.code, self.message, self.cause, self.index)
    }
}

impl std::error::Error for CasError {}

impl From<CasError> for Error {
    fn from(e: CasError) -> Self {
        match e.code {
            cas_code::KEY_NOT_FOUND => Error::NotExists(e.cause),
            cas_code::NODE_EXIST => Error::Exists(e.cause),
            cas_code::PREV_VALUE_REQUIRED => Error::LockMismatch(e.to_string()),
            cas_code::TEST_FAILED => Error::LockFailed(e.to_string()),
            _ => Error::Transport(TransportError::Cas(e)),
        }
    }
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        Error::Transport(TransportError::Http(e))
    }
}

/// One field-level schema failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Violation {
    pub field: String,
    pub message: String,
}

impl Violation {
    pub fn new(
        field: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for Violation {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

/// All violations found while checking one entity.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{} failed validation: {}", .entity, render(.violations))]
pub struct ValidationError {
    pub entity: String,
    pub violations: Vec<Violation>,
}

fn render(violations: &[Violation]) -> String {
    violations.iter().map(ToString::to_string).collect::<Vec<_>>().join("; ")
}
