//! Backend abstraction beneath the entity store.
//!
//! A [`Backend`] speaks raw keys and bytes relative to its keyspace prefix
//! and realizes the lock contract with whatever its keyspace natively offers:
//! conditional writes with per-key TTLs ([`cas`]) or TTL sessions with native
//! locks ([`session`]). Native error codes are translated at this boundary,
//! so the store never branches on which backend it holds.
pub mod cas;
pub mod session;


use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
#[cfg(test)]
use mockall::automock;
use rand::Rng;
use tokio_util::sync::CancellationToken;

use crate::Node;
use crate::Result;

/// A stored leaf, keyed relative to the backend prefix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawEntry {
    pub key: String,
    pub value: Bytes,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Put,
    Delete,
}

/// One change observed by a native watch.
///
/// `value` is empty for deletes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawEvent {
    pub kind: EventKind,
    pub key: String,
    pub value: Bytes,
}

/// A native change feed, positioned at the moment it was created.
///
/// `next` blocks until the next change and is cancel-safe: dropping the
/// future abandons the in-flight request without losing position.
#[async_trait]
pub trait NativeWatch: Send {
    async fn next(&mut self) -> Result<RawEvent>;
}

/// Everything a backend needs to take, hold and release one lock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockRequest {
    /// Lock location relative to the backend prefix
    pub path: String,
    /// Serialized lock; also the lock identity
    pub payload: Bytes,
    /// Human readable form for logs
    pub display: String,
}

/// Stop signal of a lock taken with refresh.
///
/// Stopping ends renewal and releases the lock. Dropping the handle does
/// neither.
#[derive(Debug, Clone)]
pub struct RefreshHandle {
    stop: CancellationToken,
}

impl RefreshHandle {
    pub(crate) fn new(stop: CancellationToken) -> Self {
        Self { stop }
    }

    pub fn stop(&self) {
        self.stop.cancel();
    }

    pub fn is_stopped(&self) -> bool {
        self.stop.is_cancelled()
    }
}

#[cfg_attr(test, automock)]
#[async_trait]
pub trait Backend: Send + Sync + 'static {
    /// Keyspace root every path is relative to.
    fn prefix(&self) -> String;

    /// Fetches one leaf; `NotExists` when absent.
    async fn get(
        &self,
        path: &str,
    ) -> Result<RawEntry>;

    async fn put(
        &self,
        path: &str,
        value: Bytes,
    ) -> Result<()>;

    /// Removes one leaf; `NotExists` when absent.
    async fn delete(
        &self,
        path: &str,
    ) -> Result<()>;

    /// Every leaf below `path`, recursively; empty when the subtree is absent.
    async fn list(
        &self,
        path: &str,
    ) -> Result<Vec<RawEntry>>;

    /// Opens a change feed on `path`, or on its whole subtree.
    async fn watch(
        &self,
        path: &str,
        recursive: bool,
    ) -> Result<Box<dyn NativeWatch>>;

    /// Snapshot of the whole managed keyspace as a directory tree.
    async fn tree(&self) -> Result<Node>;

    /// Takes the lock and holds it until freed, under a long lease that is
    /// re-armed for as long as this process lives.
    async fn acquire(
        &self,
        req: LockRequest,
    ) -> Result<()>;

    /// Single attempt; the lock lapses after `ttl` unless re-acquired.
    async fn acquire_with_ttl(
        &self,
        req: LockRequest,
        ttl: Duration,
    ) -> Result<()>;

    /// Takes the lock and renews it every quarter `ttl` until the returned
    /// handle is stopped, which releases it.
    async fn acquire_and_refresh(
        &self,
        req: LockRequest,
        ttl: Duration,
    ) -> Result<RefreshHandle>;

    /// Releases the lock at `req.path`. Without `force` the held payload must
    /// equal `req.payload`.
    async fn free(
        &self,
        req: LockRequest,
        force: bool,
    ) -> Result<()>;
}

/// Delay between two renewals of a lease of length `ttl`.
///
/// A quarter of the TTL, stretched by up to another quarter when jittered.
pub(crate) fn refresh_interval(
    ttl: Duration,
    jitter: bool,
) -> Duration {
    let base = ttl / 4;
    if !jitter || base.is_zero() {
        return base;
    }
    base + base.mul_f64(rand::thread_rng().gen_range(0.0..1.0))
}

/// Joins a keyspace prefix and a relative path.
pub(crate) fn qualify(
    prefix: &str,
    path: &str,
) -> String {
    let path = path.trim_matches('/');
    if path.is_empty() {
        return prefix.trim_end_matches('/').to_string();
    }
    format!("{}/{}", prefix.trim_end_matches('/'), path)
}

/// Inverse of [`qualify`]: drops the prefix and surrounding slashes.
pub(crate) fn trim_path<'a>(
    prefix: &str,
    key: &'a str,
) -> &'a str {
    let key = key.trim_matches('/');
    key.strip_prefix(prefix.trim_matches('/')).unwrap_or(key).trim_matches('/')
}
