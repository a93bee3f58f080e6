use std::collections::HashMap;
use std::io;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::trace;
use tracing::warn;

use super::watch::CasWatch;
use super::CasKeyspace;
use super::CasNode;
use super::DeleteOptions;
use super::EtcdKeysApi;
use super::GetOptions;
use super::MemCasKeyspace;
use super::PrevExist;
use super::SetOptions;
use crate::backend::qualify;
use crate::backend::refresh_interval;
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

/// Local record of a lock this client keeps alive.
#[derive(Debug)]
struct Holder {
    payload: Bytes,
    /// Ends the refresher without releasing
    stop: CancellationToken,
    generation: u64,
}

/// [`Backend`] over a CAS keyspace.
///
/// A lock is the lock key holding exactly the lock payload under a TTL.
/// Taking it is a conditional write against the same payload, falling back to
/// create-if-absent; keeping it is repeating that conditional write before
/// the TTL lapses. The holder registry only tracks which refreshers this
/// client runs; the keyspace decides who holds what.
#[derive(Clone)]
pub struct CasClient {
    keyspace: Arc<dyn CasKeyspace>,
    prefix: String,
    lock: LockConfig,
    holders: Arc<Mutex<HashMap<String, Holder>>>,
    generation: Arc<AtomicU64>,
}

impl std::fmt::Debug for CasClient {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result {
        f.debug_struct("CasClient")
            .field("prefix", &self.prefix)
            .field("holders", &self.holders.lock().len())
            .finish()
    }
}

impl CasClient {
    /// Wraps `keyspace`, creating the prefix directory when missing.
    pub async fn connect(
        keyspace: Arc<dyn CasKeyspace>,
        prefix: &str,
        lock: LockConfig,
    ) -> Result<Self> {
        let prefix = format!("/{}", prefix.trim_matches('/'));

        let opts = SetOptions {
            dir: true,
            prev_exist: Some(PrevExist::NoExist),
            ..Default::default()
        };
        match keyspace.set(&prefix, "", opts).await {
            Ok(_) => info!(%prefix, "created cas keyspace root"),
            Err(e) if e.is_exists() => trace!(%prefix, "cas keyspace root present"),
            Err(e) => return Err(e),
        }

        Ok(Self {
            keyspace,
            prefix,
            lock,
            holders: Arc::new(Mutex::new(HashMap::new())),
            generation: Arc::new(AtomicU64::new(0)),
        })
    }

    /// Client over the etcd v2 endpoints named in `config`.
    pub async fn etcd(config: &StoreConfig) -> Result<Self> {
        let api = EtcdKeysApi::new(config.backend.endpoints.clone(), config.backend.request_timeout())?;
        Self::connect(Arc::new(api), &config.backend.prefix, config.lock.clone()).await
    }

    /// Client over a fresh in-process keyspace.
    pub async fn in_memory(config: &StoreConfig) -> Result<Self> {
        let keyspace = MemCasKeyspace::new(config.watch.history_size);
        Self::connect(Arc::new(keyspace), &config.backend.prefix, config.lock.clone()).await
    }

    /// The raw keyspace, bypassing entity handling.
    pub fn keyspace(&self) -> Arc<dyn CasKeyspace> {
        self.keyspace.clone()
    }

    fn key(
        &self,
        path: &str,
    ) -> String {
        qualify(&self.prefix, path)
    }

    async fn do_acquire(
        &self,
        req: &LockRequest,
        ttl: Duration,
    ) -> Result<()> {
        let key = self.key(&req.path);
        let value = payload_str(&req.payload).map_err(|e| lock_failed(req, e))?;

        let refresh = SetOptions {
            prev_value: Some(value.to_string()),
            ttl: Some(ttl),
            ..Default::default()
        };
        match self.keyspace.set(&key, value, refresh).await {
            Ok(_) => Ok(()),
            Err(e) if e.is_not_exists() => {
                let create = SetOptions {
                    prev_exist: Some(PrevExist::NoExist),
                    ttl: Some(ttl),
                    ..Default::default()
                };
                self.keyspace
                    .set(&key, value, create)
                    .await
                    .map(|_| ())
                    .map_err(|e| lock_failed(req, e))
            }
            Err(e) => Err(lock_failed(req, e)),
        }
    }

    /// Repeats the conditional write without ever re-creating the key.
    async fn refresh(
        &self,
        req: &LockRequest,
        ttl: Duration,
    ) -> Result<()> {
        let value = payload_str(&req.payload)?;
        let opts = SetOptions {
            prev_value: Some(value.to_string()),
            ttl: Some(ttl),
            ..Default::default()
        };
        self.keyspace.set(&self.key(&req.path), value, opts).await.map(|_| ())
    }

    /// Registers a refresher for `req`, replacing any previous one at the
    /// same path. Cancelling `release` frees the lock.
    fn keep(
        &self,
        req: LockRequest,
        ttl: Duration,
        release: CancellationToken,
    ) {
        let stop = CancellationToken::new();
        let generation = self.generation.fetch_add(1, Ordering::Relaxed);

        let previous = self.holders.lock().insert(
            req.path.clone(),
            Holder {
                payload: req.payload.clone(),
                stop: stop.clone(),
                generation,
            },
        );
        if let Some(previous) = previous {
            previous.stop.cancel();
        }

        let client = self.clone();
        tokio::spawn(async move {
            loop {
                let interval = refresh_interval(ttl, client.lock.refresh_jitter);
                tokio::select! {
                    biased;
                    _ = stop.cancelled() => return,
                    _ = release.cancelled() => {
                        if let Err(e) = client.free(req.clone(), false).await {
                            error!(lock = %req.display, "error freeing refreshed lock: {}", e);
                        }
                        return;
                    }
                    _ = tokio::time::sleep(interval) => {}
                }

                match client.refresh(&req, ttl).await {
                    Ok(()) => trace!(lock = %req.display, ?ttl, "refreshed lock"),
                    Err(e) if e.is_not_exists() || e.is_lock_failed() => {
                        warn!(lock = %req.display, "lock lost before refresh: {}", e);
                        client.evict(&req.path, generation);
                        return;
                    }
                    Err(e) => error!(lock = %req.display, "could not refresh lock: {}", e),
                }
            }
        });
    }

    fn evict(
        &self,
        path: &str,
        generation: u64,
    ) {
        let mut holders = self.holders.lock();
        if holders.get(path).is_some_and(|h| h.generation == generation) {
            holders.remove(path);
        }
    }

    /// Stops the refresher at `path` when it keeps `payload`, or any
    /// refresher there when `payload` is `None`.
    fn forget(
        &self,
        path: &str,
        payload: Option<&Bytes>,
    ) {
        let mut holders = self.holders.lock();
        if holders.get(path).is_some_and(|h| payload.map_or(true, |p| &h.payload == p)) {
            if let Some(holder) = holders.remove(path) {
                holder.stop.cancel();
            }
        }
    }

    /// Number of locks this client is refreshing.
    pub fn held_locks(&self) -> usize {
        self.holders.lock().len()
    }
}

fn payload_str(payload: &Bytes) -> Result<&str> {
    std::str::from_utf8(payload).map_err(|e| Error::Io(io::Error::new(io::ErrorKind::InvalidData, e)))
}

fn lock_failed(
    req: &LockRequest,
    e: Error,
) -> Error {
    match e {
        Error::LockFailed(_) => e,
        other => Error::LockFailed(format!("{}: {}", req.display, other)),
    }
}

fn collect_leaves(
    prefix: &str,
    node: CasNode,
    out: &mut Vec<RawEntry>,
) {
    if node.dir {
        for child in node.nodes {
            collect_leaves(prefix, child, out);
        }
        return;
    }
    out.push(RawEntry {
        key: trim_path(prefix, &node.key).to_string(),
        value: Bytes::from(node.value),
    });
}

fn to_tree(node: CasNode) -> Node {
    Node {
        key: node.key,
        value: Bytes::from(node.value),
        dir: node.dir,
        nodes: node.nodes.into_iter().map(to_tree).collect(),
    }
}

#[async_trait]
impl Backend for CasClient {
    fn prefix(&self) -> String {
        self.prefix.clone()
    }

    async fn get(
        &self,
        path: &str,
    ) -> Result<RawEntry> {
        let resp = self.keyspace.get(&self.key(path), GetOptions::default()).await?;
        if resp.node.dir {
            return Err(Error::InvalidPath(format!("{path} is a directory")));
        }
        Ok(RawEntry {
            key: trim_path(&self.prefix, &resp.node.key).to_string(),
            value: Bytes::from(resp.node.value),
        })
    }

    async fn put(
        &self,
        path: &str,
        value: Bytes,
    ) -> Result<()> {
        let value = payload_str(&value)?;
        self.keyspace
            .set(&self.key(path), value, SetOptions::default())
            .await
            .map(|_| ())
    }

    async fn delete(
        &self,
        path: &str,
    ) -> Result<()> {
        self.keyspace
            .delete(&self.key(path), DeleteOptions::default())
            .await
            .map(|_| ())
    }

    async fn list(
        &self,
        path: &str,
    ) -> Result<Vec<RawEntry>> {
        let opts = GetOptions {
            recursive: true,
            sorted: true,
        };
        let node = match self.keyspace.get(&self.key(path), opts).await {
            Ok(resp) => resp.node,
            Err(e) if e.is_not_exists() => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };

        let mut out = Vec::new();
        collect_leaves(&self.prefix, node, &mut out);
        Ok(out)
    }

    async fn watch(
        &self,
        path: &str,
        recursive: bool,
    ) -> Result<Box<dyn NativeWatch>> {
        let watch = CasWatch::open(self.keyspace.clone(), self.prefix.clone(), self.key(path), recursive).await?;
        Ok(Box::new(watch))
    }

    async fn tree(&self) -> Result<Node> {
        let opts = GetOptions {
            recursive: true,
            sorted: true,
        };
        match self.keyspace.get(&self.prefix, opts).await {
            Ok(resp) => Ok(to_tree(resp.node)),
            Err(e) if e.is_not_exists() => Ok(Node::dir(self.prefix.clone(), Vec::new())),
            Err(e) => Err(e),
        }
    }

    async fn acquire(
        &self,
        req: LockRequest,
    ) -> Result<()> {
        debug!(lock = %req.display, "acquiring lock");
        let ttl = self.lock.hold_ttl();
        self.do_acquire(&req, ttl).await?;
        self.keep(req.clone(), ttl, CancellationToken::new());
        debug!(lock = %req.display, "acquired lock");
        Ok(())
    }

    async fn acquire_with_ttl(
        &self,
        req: LockRequest,
        ttl: Duration,
    ) -> Result<()> {
        if ttl.is_zero() {
            return Err(Error::LockFailed(format!("{}: ttl must be positive", req.display)));
        }

        debug!(lock = %req.display, ?ttl, "acquiring lock with ttl");
        self.do_acquire(&req, ttl).await?;
        // The new lease replaces whatever this client was refreshing
        self.forget(&req.path, Some(&req.payload));
        debug!(lock = %req.display, ?ttl, "acquired lock with ttl");
        Ok(())
    }

    async fn acquire_and_refresh(
        &self,
        req: LockRequest,
        ttl: Duration,
    ) -> Result<RefreshHandle> {
        if ttl.is_zero() {
            return Err(Error::LockFailed(format!("{}: ttl must be positive", req.display)));
        }

        debug!(lock = %req.display, ?ttl, "acquiring refreshed lock");
        self.do_acquire(&req, ttl).await?;

        let release = CancellationToken::new();
        self.keep(req, ttl, release.clone());
        Ok(RefreshHandle::new(release))
    }

    async fn free(
        &self,
        req: LockRequest,
        force: bool,
    ) -> Result<()> {
        debug!(lock = %req.display, force, "freeing lock");
        let opts = if force {
            DeleteOptions::default()
        } else {
            DeleteOptions {
                prev_value: Some(payload_str(&req.payload).map_err(|e| lock_failed(&req, e))?.to_string()),
                ..Default::default()
            }
        };

        match self.keyspace.delete(&self.key(&req.path), opts).await {
            Ok(_) => {
                self.forget(&req.path, if force { None } else { Some(&req.payload) });
                Ok(())
            }
            // the record is gone or now holds another payload
            Err(e) if e.is_not_exists() || e.is_lock_failed() => {
                self.forget(&req.path, Some(&req.payload));
                Err(e)
            }
            Err(e) => Err(e),
        }
    }
}
