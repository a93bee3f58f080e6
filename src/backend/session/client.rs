use std::collections::HashMap;
use std::sync::atomic::AtomicU64;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tracing::debug;

use super::lock::HeldLock;
use super::watch::SessionWatch;
use super::ConsulApi;
use super::MemSessionKeyspace;
use super::QueryOptions;
use super::SessionKeyspace;
use crate::backend::qualify;
use crate::backend::trim_path;
use crate::Backend;
use crate::Error;
use crate::LockConfig;
use crate::LockRequest;
use crate::NativeWatch;
use crate::Node;
use crate::RawEntry;
use crate::RefreshHandle;
use crate::Result;
use crate::StoreConfig;
use crate::WatchConfig;

/// [`Backend`] over a session keyspace.
///
/// Each lock gets its own TTL session and a try-once native acquire bound to
/// it. The lock registry maps lock paths to the sessions this client holds;
/// it is checked against the keyspace before being trusted.
#[derive(Clone)]
pub struct SessionClient {
    pub(super) keyspace: Arc<dyn SessionKeyspace>,
    pub(super) prefix: String,
    pub(super) lock: LockConfig,
    pub(super) watch: WatchConfig,
    pub(super) locks: Arc<Mutex<HashMap<String, HeldLock>>>,
    pub(super) generation: Arc<AtomicU64>,
}

impl std::fmt::Debug for SessionClient {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result {
        f.debug_struct("SessionClient")
            .field("prefix", &self.prefix)
            .field("locks", &self.locks.lock().len())
            .finish()
    }
}

impl SessionClient {
    pub fn new(
        keyspace: Arc<dyn SessionKeyspace>,
        prefix: &str,
        lock: LockConfig,
        watch: WatchConfig,
    ) -> Result<Self> {
        if prefix.starts_with('/') {
            return Err(Error::InvalidPath(format!(
                "session keyspace paths may not start with / -- got {prefix:?}"
            )));
        }
        let prefix = prefix.trim_end_matches('/');
        if prefix.is_empty() {
            return Err(Error::InvalidPath("session keyspace prefix is empty".to_string()));
        }

        Ok(Self {
            keyspace,
            prefix: prefix.to_string(),
            lock,
            watch,
            locks: Arc::new(Mutex::new(HashMap::new())),
            generation: Arc::new(AtomicU64::new(0)),
        })
    }

    /// Client over the consul agents named in `config`.
    pub fn consul(config: &StoreConfig) -> Result<Self> {
        let api = ConsulApi::new(config.backend.endpoints.clone(), config.backend.request_timeout())?;
        Self::new(
            Arc::new(api),
            &config.backend.prefix,
            config.lock.clone(),
            config.watch.clone(),
        )
    }

    /// Client over a fresh in-process keyspace.
    pub fn in_memory(config: &StoreConfig) -> Result<Self> {
        Self::new(
            Arc::new(MemSessionKeyspace::new()),
            &config.backend.prefix,
            config.lock.clone(),
            config.watch.clone(),
        )
    }

    /// The raw keyspace, bypassing entity handling.
    pub fn keyspace(&self) -> Arc<dyn SessionKeyspace> {
        self.keyspace.clone()
    }

    pub(super) fn key(
        &self,
        path: &str,
    ) -> String {
        qualify(&self.prefix, path)
    }

    /// Number of locks this client holds sessions for.
    pub fn held_locks(&self) -> usize {
        self.locks.lock().len()
    }
}

#[async_trait]
impl Backend for SessionClient {
    fn prefix(&self) -> String {
        self.prefix.clone()
    }

    async fn get(
        &self,
        path: &str,
    ) -> Result<RawEntry> {
        let key = self.key(path);
        match self.keyspace.get(&key, QueryOptions::default()).await?.value {
            Some(pair) => Ok(RawEntry {
                key: trim_path(&self.prefix, &pair.key).to_string(),
                value: pair.value,
            }),
            None => Err(Error::NotExists(key)),
        }
    }

    async fn put(
        &self,
        path: &str,
        value: Bytes,
    ) -> Result<()> {
        self.keyspace.put(&self.key(path), value).await
    }

    async fn delete(
        &self,
        path: &str,
    ) -> Result<()> {
        let key = self.key(path);
        if self.keyspace.get(&key, QueryOptions::default()).await?.value.is_none() {
            return Err(Error::NotExists(key));
        }
        self.keyspace.delete(&key).await
    }

    async fn list(
        &self,
        path: &str,
    ) -> Result<Vec<RawEntry>> {
        let pairs = self
            .keyspace
            .list(&format!("{}/", self.key(path)), QueryOptions::default())
            .await?
            .value;

        Ok(pairs
            .into_iter()
            .filter(|p| !p.key.ends_with('/'))
            .map(|p| RawEntry {
                key: trim_path(&self.prefix, &p.key).to_string(),
                value: p.value,
            })
            .collect())
    }

    async fn watch(
        &self,
        path: &str,
        recursive: bool,
    ) -> Result<Box<dyn NativeWatch>> {
        let watch = SessionWatch::open(
            self.keyspace.clone(),
            self.prefix.clone(),
            self.key(path),
            recursive,
            self.watch.wait_time(),
        )
        .await?;
        Ok(Box::new(watch))
    }

    async fn tree(&self) -> Result<Node> {
        let pairs = self
            .keyspace
            .list(&format!("{}/", self.prefix), QueryOptions::default())
            .await?
            .value;
        debug!(prefix = %self.prefix, pairs = pairs.len(), "synthesizing keyspace tree");

        Ok(Node::from_flat(
            &format!("/{}", self.prefix),
            pairs
                .into_iter()
                .filter(|p| !p.key.ends_with('/'))
                .map(|p| (format!("/{}", p.key), p.value)),
        ))
    }

    async fn acquire(
        &self,
        req: LockRequest,
    ) -> Result<()> {
        self.lock_native(req, self.lock.hold_ttl(), true).await.map(|_| ())
    }

    async fn acquire_with_ttl(
        &self,
        req: LockRequest,
        ttl: Duration,
    ) -> Result<()> {
        if ttl.is_zero() {
            return Err(Error::LockFailed(format!("{}: ttl must be positive", req.display)));
        }
        self.lock_native(req, ttl, false).await.map(|_| ())
    }

    async fn acquire_and_refresh(
        &self,
        req: LockRequest,
        ttl: Duration,
    ) -> Result<RefreshHandle> {
        if ttl.is_zero() {
            return Err(Error::LockFailed(format!("{}: ttl must be positive", req.display)));
        }
        let done = self.lock_native(req, ttl, true).await?;
        Ok(RefreshHandle::new(done))
    }

    async fn free(
        &self,
        req: LockRequest,
        force: bool,
    ) -> Result<()> {
        self.unlock_native(req, force).await
    }
}
