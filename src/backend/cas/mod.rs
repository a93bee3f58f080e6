//! Compare-and-swap keyspace backend (etcd v2 keys semantics).
//!
//! The keyspace offers hierarchical keys with explicit directories, a global
//! modification index, per-key TTLs and conditional writes. There is no
//! session object: holding a lock means this client's last conditional write
//! to the lock key succeeded and its TTL has not lapsed.
mod client;
mod etcd;
mod mem;
mod watch;

pub use client::*;
pub use etcd::*;
pub use mem::*;

#[cfg(test)]
mod client_test;
#[cfg(test)]
mod mem_test;

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;

use crate::EventKind;
use crate::Result;

/// A node as reported by the keyspace. Keys are absolute, with a leading `/`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CasNode {
    pub key: String,
    #[serde(default)]
    pub value: String,
    #[serde(default)]
    pub dir: bool,
    #[serde(default)]
    pub nodes: Vec<CasNode>,
    #[serde(default)]
    pub created_index: u64,
    #[serde(default)]
    pub modified_index: u64,
    /// Remaining lifetime in seconds
    #[serde(default)]
    pub ttl: Option<i64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum CasAction {
    Get,
    Set,
    Create,
    Update,
    CompareAndSwap,
    Delete,
    CompareAndDelete,
    Expire,
}

impl CasAction {
    pub fn kind(self) -> EventKind {
        match self {
            CasAction::Delete | CasAction::CompareAndDelete | CasAction::Expire => EventKind::Delete,
            _ => EventKind::Put,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CasResponse {
    pub action: CasAction,
    pub node: CasNode,
    #[serde(default)]
    pub prev_node: Option<CasNode>,
    /// Keyspace index when the response was produced
    #[serde(skip)]
    pub index: u64,
}

#[derive(Debug, Clone, Default)]
pub struct GetOptions {
    pub recursive: bool,
    pub sorted: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrevExist {
    Exist,
    NoExist,
}

#[derive(Debug, Clone, Default)]
pub struct SetOptions {
    pub prev_exist: Option<PrevExist>,
    pub prev_value: Option<String>,
    pub ttl: Option<Duration>,
    pub dir: bool,
}

#[derive(Debug, Clone, Default)]
pub struct DeleteOptions {
    pub prev_value: Option<String>,
    pub recursive: bool,
    pub dir: bool,
}

#[derive(Debug, Clone, Default)]
pub struct WatchOptions {
    pub recursive: bool,
    /// First index of interest; zero waits for the next change
    pub wait_index: u64,
}

/// Native primitive set of a CAS keyspace.
///
/// Failures carry the keyspace's own codes, already folded through the
/// crate-wide translation table.
#[async_trait]
pub trait CasKeyspace: Send + Sync + 'static {
    async fn get(
        &self,
        key: &str,
        opts: GetOptions,
    ) -> Result<CasResponse>;

    async fn set(
        &self,
        key: &str,
        value: &str,
        opts: SetOptions,
    ) -> Result<CasResponse>;

    async fn delete(
        &self,
        key: &str,
        opts: DeleteOptions,
    ) -> Result<CasResponse>;

    /// Blocks until the first change at or after `opts.wait_index`.
    async fn watch(
        &self,
        key: &str,
        opts: WatchOptions,
    ) -> Result<CasResponse>;

    /// Current keyspace index.
    async fn index(&self) -> Result<u64>;
}
