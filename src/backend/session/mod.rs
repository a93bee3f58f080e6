//! Session keyspace backend (consul KV and session semantics).
//!
//! Keys are flat strings; directories only exist by convention of `/` in
//! key names. Locks are native: a key may be acquired by one session at a
//! time, and a session that is destroyed or whose TTL lapses releases every
//! key it holds.
mod client;
mod consul;
mod lock;
mod mem;
mod watch;

pub use client::*;
pub use consul::*;
pub use mem::*;


use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;

use crate::Result;

/// One stored pair as reported by the keyspace. Keys carry no leading `/`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KvPair {
    pub key: String,
    pub value: Bytes,
    pub create_index: u64,
    pub modify_index: u64,
    /// Number of times the key was acquired
    pub lock_index: u64,
    /// Session currently holding the key
    pub session: Option<String>,
}

/// Blocking query parameters.
///
/// A zero `wait_index` answers immediately; otherwise the query returns once
/// the keyspace index moves past it or `wait_time` elapses.
#[derive(Debug, Clone, Default)]
pub struct QueryOptions {
    pub wait_index: u64,
    pub wait_time: Option<Duration>,
}

/// A query result with the keyspace index it reflects.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Indexed<T> {
    pub value: T,
    pub index: u64,
}

/// Native primitive set of a session keyspace.
#[async_trait]
pub trait SessionKeyspace: Send + Sync + 'static {
    async fn get(
        &self,
        key: &str,
        opts: QueryOptions,
    ) -> Result<Indexed<Option<KvPair>>>;

    /// Every pair whose key starts with `prefix`.
    async fn list(
        &self,
        prefix: &str,
        opts: QueryOptions,
    ) -> Result<Indexed<Vec<KvPair>>>;

    async fn put(
        &self,
        key: &str,
        value: Bytes,
    ) -> Result<()>;

    /// Removes `key` if present.
    async fn delete(
        &self,
        key: &str,
    ) -> Result<()>;

    async fn delete_tree(
        &self,
        prefix: &str,
    ) -> Result<()>;

    /// Writes `value` and binds `key` to `session` unless another session
    /// holds it. Returns whether the key is now held by `session`.
    async fn acquire(
        &self,
        key: &str,
        value: Bytes,
        session: &str,
    ) -> Result<bool>;

    /// Unbinds `key` when held by `session`.
    async fn release(
        &self,
        key: &str,
        session: &str,
    ) -> Result<bool>;

    /// Creates a session invalidated after `ttl` without renewal. With
    /// checks, the session is also tied to the node's health.
    async fn session_create(
        &self,
        ttl: Duration,
        with_checks: bool,
    ) -> Result<String>;

    /// Resets the session TTL; `false` once the session is gone.
    async fn session_renew(
        &self,
        id: &str,
    ) -> Result<bool>;

    async fn session_destroy(
        &self,
        id: &str,
    ) -> Result<()>;
}
