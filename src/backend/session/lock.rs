//! Native session locks.
//!
//! A held lock is backed by three tasks sharing one `released` token:
//! - a monitor racing the TTL timer (non-refreshed locks), loss of the key
//!   and the caller's done signal
//! - a lost detector blocking on the lock key until another session owns it
//! - a renewer keeping the session alive (refreshed locks only)
//!
//! Whichever way the lock ends, its registry entry is evicted by generation
//! so a newer lock at the same path is never removed by an older monitor.

use std::sync::atomic::Ordering;
use std::time::Duration;

use bytes::Bytes;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::error;
use tracing::trace;
use tracing::warn;

use super::QueryOptions;
use super::SessionClient;
use crate::backend::refresh_interval;
use crate::Error;
use crate::LockRequest;
use crate::Result;

#[derive(Debug, Clone)]
pub(crate) struct HeldLock {
    pub(crate) payload: Bytes,
    pub(crate) session: String,
    pub(crate) generation: u64,
    /// Caller side stop signal; firing it frees the lock
    pub(crate) done: CancellationToken,
    /// Fired once the key is no longer held by `session`
    pub(crate) lost: CancellationToken,
    /// Ends every task attached to this lock
    pub(crate) released: CancellationToken,
}

impl SessionClient {
    /// Takes `req` under a fresh session. Returns the lock's done signal,
    /// which is the existing one when this client already holds `req`.
    pub(super) async fn lock_native(
        &self,
        req: LockRequest,
        ttl: Duration,
        refresh: bool,
    ) -> Result<CancellationToken> {
        let ttl = ttl.max(self.lock.min_session_ttl());
        let key = self.key(&req.path);
        debug!(lock = %req.display, ?ttl, refresh, "attempting to acquire lock");

        if let Some(done) = self.check_registry(&req, &key).await? {
            debug!(lock = %req.display, "lock already held by this client");
            return Ok(done);
        }

        let session = self.keyspace.session_create(ttl, refresh).await?;
        let acquired = match self.keyspace.acquire(&key, req.payload.clone(), &session).await {
            Ok(acquired) => acquired,
            Err(e) => {
                self.destroy_session(&session).await;
                return Err(Error::LockFailed(format!("{}: {}", req.display, e)));
            }
        };
        if !acquired {
            self.destroy_session(&session).await;
            return Err(Error::LockFailed(format!(
                "{}: held by another session",
                req.display
            )));
        }

        let held = HeldLock {
            payload: req.payload.clone(),
            session,
            generation: self.generation.fetch_add(1, Ordering::Relaxed),
            done: CancellationToken::new(),
            lost: CancellationToken::new(),
            released: CancellationToken::new(),
        };

        let previous = self.locks.lock().insert(req.path.clone(), held.clone());
        if let Some(previous) = previous {
            previous.released.cancel();
        }

        if refresh {
            self.spawn_renewer(&req, &held, ttl);
        }
        self.spawn_lost_detector(&req, &held, key);
        self.spawn_monitor(req.clone(), held.clone(), ttl, refresh);

        debug!(lock = %req.display, session = %held.session, "acquired lock");
        Ok(held.done)
    }

    /// Returns the done signal when the registry already holds `req`, fails
    /// when it verifiably holds a different payload, and evicts stale
    /// entries otherwise.
    async fn check_registry(
        &self,
        req: &LockRequest,
        key: &str,
    ) -> Result<Option<CancellationToken>> {
        let Some(held) = self.locks.lock().get(&req.path).cloned() else {
            return Ok(None);
        };

        if !held.lost.is_cancelled() {
            let persisted = self.keyspace.get(key, QueryOptions::default()).await?.value;
            let confirmed = persisted
                .is_some_and(|p| p.session.as_deref() == Some(held.session.as_str()) && p.value == held.payload);

            if confirmed {
                if held.payload == req.payload {
                    return Ok(Some(held.done));
                }
                return Err(Error::LockFailed(format!(
                    "invalid lock attempted at {:?}: already exists",
                    req.path
                )));
            }
        }

        trace!(path = %req.path, "evicting stale lock registry entry");
        self.evict(&req.path, held.generation);
        held.released.cancel();
        Ok(None)
    }

    pub(super) fn evict(
        &self,
        path: &str,
        generation: u64,
    ) {
        let mut locks = self.locks.lock();
        if locks.get(path).is_some_and(|l| l.generation == generation) {
            locks.remove(path);
        }
    }

    async fn destroy_session(
        &self,
        session: &str,
    ) {
        if let Err(e) = self.keyspace.session_destroy(session).await {
            warn!(%session, "could not destroy session: {}", e);
        }
    }

    fn spawn_renewer(
        &self,
        req: &LockRequest,
        held: &HeldLock,
        ttl: Duration,
    ) {
        let keyspace = self.keyspace.clone();
        let jitter = self.lock.refresh_jitter;
        let lock_name = req.display.clone();
        let held = held.clone();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    _ = held.released.cancelled() => return,
                    _ = tokio::time::sleep(refresh_interval(ttl, jitter)) => {}
                }

                match keyspace.session_renew(&held.session).await {
                    Ok(true) => trace!(lock = %lock_name, "renewed session"),
                    Ok(false) => {
                        warn!(lock = %lock_name, session = %held.session, "session vanished during renewal");
                        held.lost.cancel();
                        return;
                    }
                    Err(e) => error!(lock = %lock_name, "error during periodic renewal of lock: {}", e),
                }
            }
        });
    }

    fn spawn_lost_detector(
        &self,
        req: &LockRequest,
        held: &HeldLock,
        key: String,
    ) {
        let keyspace = self.keyspace.clone();
        let wait_time = self.watch.wait_time();
        let retry = self.lock.monitor_retry();
        let lock_name = req.display.clone();
        let held = held.clone();

        tokio::spawn(async move {
            let mut index = 0;
            loop {
                let opts = QueryOptions {
                    wait_index: index,
                    wait_time: Some(wait_time),
                };
                let answer = tokio::select! {
                    biased;
                    _ = held.released.cancelled() => return,
                    answer = keyspace.get(&key, opts) => answer,
                };

                match answer {
                    Ok(answer) => {
                        let ours = answer
                            .value
                            .is_some_and(|p| p.session.as_deref() == Some(held.session.as_str()));
                        if !ours {
                            debug!(lock = %lock_name, "lock lost");
                            held.lost.cancel();
                            return;
                        }
                        index = answer.index;
                    }
                    Err(e) => {
                        warn!(lock = %lock_name, "lock monitor query failed: {}", e);
                        tokio::select! {
                            _ = held.released.cancelled() => return,
                            _ = tokio::time::sleep(retry) => {}
                        }
                    }
                }
            }
        });
    }

    fn spawn_monitor(
        &self,
        req: LockRequest,
        held: HeldLock,
        ttl: Duration,
        refresh: bool,
    ) {
        let client = self.clone();

        tokio::spawn(async move {
            let expiry = async {
                if refresh {
                    std::future::pending::<()>().await;
                }
                tokio::time::sleep(ttl).await;
            };

            tokio::select! {
                biased;
                _ = held.released.cancelled() => {}
                _ = held.lost.cancelled() => {}
                _ = held.done.cancelled() => {
                    if let Err(e) = client.unlock_native(req.clone(), false).await {
                        error!(lock = %req.display, "error freeing lock: {}", e);
                    }
                }
                _ = expiry => {
                    debug!(lock = %req.display, ?ttl, "lock ttl elapsed, releasing");
                    let key = client.key(&req.path);
                    if let Err(e) = client.keyspace.release(&key, &held.session).await {
                        warn!(lock = %req.display, "could not release expired lock: {}", e);
                    }
                    client.destroy_session(&held.session).await;
                }
            }

            client.evict(&req.path, held.generation);
            held.released.cancel();
        });
    }

    /// Releases `req`. Without a registry entry only a forced free does
    /// anything: it deletes the persisted record.
    pub(super) async fn unlock_native(
        &self,
        req: LockRequest,
        force: bool,
    ) -> Result<()> {
        debug!(lock = %req.display, force, "attempting to free lock");
        let key = self.key(&req.path);
        let held = self.locks.lock().get(&req.path).cloned();

        let Some(held) = held else {
            if !force {
                return Err(Error::LockFailed(format!("{}: could not locate lock", req.display)));
            }
            if self.keyspace.get(&key, QueryOptions::default()).await?.value.is_none() {
                return Err(Error::NotExists(key));
            }
            return self.keyspace.delete(&key).await;
        };

        if held.payload != req.payload && !force {
            return Err(Error::LockFailed(format!(
                "{}: invalid lock requested to be freed (wrong host?)",
                req.display
            )));
        }

        let persisted = self.keyspace.get(&key, QueryOptions::default()).await?.value;
        let owned = !held.lost.is_cancelled()
            && persisted
                .as_ref()
                .is_some_and(|p| p.session.as_deref() == Some(held.session.as_str()) && p.value == held.payload);

        if !owned && !force {
            self.evict(&req.path, held.generation);
            held.released.cancel();
            self.destroy_session(&held.session).await;
            return Err(Error::LockFailed(format!(
                "{}: lock is no longer held by this client",
                req.display
            )));
        }

        if owned {
            if let Err(e) = self.keyspace.release(&key, &held.session).await {
                warn!(lock = %req.display, "could not release lock: {}", e);
            }
        }

        self.evict(&req.path, held.generation);
        held.released.cancel();
        self.keyspace.delete(&key).await?;
        self.destroy_session(&held.session).await;
        Ok(())
    }
}
