//! Entity store over a [`Backend`].
//!
//! [`Store`] drives entities through the [`Entity`] contract: validation and
//! hooks around each CRUD call, materialization of listed and watched
//! records from templates, and a lock façade that serializes [`Lock`]
//! entities into backend lock requests. Watches and backend handles belong
//! to the store instance, so independent stores can coexist in one process.
mod watch;

pub use watch::*;

#[cfg(test)]
mod store_test;

use std::fmt;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::backend::cas::CasClient;
use crate::backend::session::SessionClient;
use crate::dump::write_archive;
use crate::entity::decode;
use crate::entity::encode;
use crate::Backend;
use crate::BackendKind;
use crate::Entity;
use crate::Error;
use crate::EventKind;
use crate::Hook;
use crate::Lock;
use crate::LockRequest;
use crate::NativeWatch;
use crate::Policy;
use crate::PolicyRevision;
use crate::RefreshHandle;
use crate::Result;
use crate::StoreConfig;

/// Handle to one managed keyspace. Cheap to clone; clones share the backend
/// connection, the lock registry and the watch registry.
#[derive(Clone)]
pub struct Store {
    backend: Arc<dyn Backend>,
    watches: Arc<WatchRegistry>,
    config: Arc<StoreConfig>,
}

impl fmt::Debug for Store {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        f.debug_struct("Store")
            .field("prefix", &self.backend.prefix())
            .field("watches", &self.watches.len())
            .finish()
    }
}

impl Store {
    pub fn new(
        backend: Arc<dyn Backend>,
        config: StoreConfig,
    ) -> Self {
        Self {
            backend,
            watches: Arc::new(WatchRegistry::default()),
            config: Arc::new(config),
        }
    }

    /// Connects to the keyspace servers named in `config`.
    pub async fn connect(config: StoreConfig) -> Result<Self> {
        let backend: Arc<dyn Backend> = match config.backend.kind {
            BackendKind::Cas => Arc::new(CasClient::etcd(&config).await?),
            BackendKind::Session => Arc::new(SessionClient::consul(&config)?),
        };
        info!(kind = ?config.backend.kind, prefix = %backend.prefix(), "store connected");
        Ok(Self::new(backend, config))
    }

    /// Store over a fresh in-process keyspace of the configured kind.
    pub async fn in_memory(config: StoreConfig) -> Result<Self> {
        let backend: Arc<dyn Backend> = match config.backend.kind {
            BackendKind::Cas => Arc::new(CasClient::in_memory(&config).await?),
            BackendKind::Session => Arc::new(SessionClient::in_memory(&config)?),
        };
        Ok(Self::new(backend, config))
    }

    pub fn prefix(&self) -> String {
        self.backend.prefix()
    }

    /// Raw backend beneath the store, bypassing entity handling.
    pub fn backend(&self) -> Arc<dyn Backend> {
        self.backend.clone()
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    /// Number of active watches.
    pub fn watch_count(&self) -> usize {
        self.watches.len()
    }

    /// Decodes `value` into `entity`, then runs set_key, PostGet and validate.
    async fn materialize<E: Entity>(
        &self,
        entity: &mut E,
        key: &str,
        value: &[u8],
        post_get: Option<Hook<E>>,
    ) -> Result<()> {
        *entity = decode(value)?;
        entity.set_key(key)?;
        if let Some(post_get) = post_get {
            post_get(self, entity).await?;
        }
        entity.validate()
    }

    /// Replaces `entity` with the stored record at its path.
    pub async fn get<E: Entity>(
        &self,
        entity: &mut E,
    ) -> Result<()> {
        let hooks = entity.hooks();
        if let Some(pre_get) = hooks.pre_get {
            pre_get(self, entity).await?;
        }

        let path = entity.path()?;
        let raw = self.backend.get(&path).await?;
        self.materialize(entity, &raw.key, &raw.value, hooks.post_get).await
    }

    /// Validates `entity` and writes it at its path.
    pub async fn set<E: Entity>(
        &self,
        entity: &mut E,
    ) -> Result<()> {
        entity.validate()?;

        let hooks = entity.hooks();
        if let Some(pre_set) = hooks.pre_set {
            pre_set(self, entity).await?;
        }

        let path = entity.path()?;
        let payload = encode(entity)?;
        self.backend.put(&path, payload).await?;
        debug!(%path, entity = %entity, "stored entity");

        if let Some(post_set) = hooks.post_set {
            post_set(self, entity).await?;
        }
        Ok(())
    }

    /// Removes the record at `entity`'s path. A missing record is not an
    /// error.
    pub async fn delete<E: Entity>(
        &self,
        entity: &mut E,
    ) -> Result<()> {
        let hooks = entity.hooks();
        if let Some(pre_delete) = hooks.pre_delete {
            pre_delete(self, entity).await?;
        }

        let path = entity.path()?;
        match self.backend.delete(&path).await {
            Ok(()) => debug!(%path, "deleted entity"),
            Err(e) if e.is_not_exists() => debug!(%path, "entity already absent"),
            Err(e) => return Err(e),
        }

        if let Some(post_delete) = hooks.post_delete {
            post_delete(self, entity).await?;
        }
        Ok(())
    }

    /// Every record under `template`'s collection root.
    pub async fn list<E: Entity>(
        &self,
        template: &E,
    ) -> Result<Vec<E>> {
        self.list_path(template.prefix().to_string(), template).await
    }

    /// Every record under `prefix` within `template`'s collection root.
    pub async fn list_prefix<E: Entity>(
        &self,
        prefix: &str,
        template: &E,
    ) -> Result<Vec<E>> {
        let path = format!("{}/{}", template.prefix(), prefix.trim_matches('/'));
        self.list_path(path, template).await
    }

    async fn list_path<E: Entity>(
        &self,
        path: String,
        template: &E,
    ) -> Result<Vec<E>> {
        let post_get = template.hooks().post_get;
        let entries = self.backend.list(&path).await?;

        let mut out = Vec::with_capacity(entries.len());
        for raw in entries {
            let mut entity = template.clone();
            match self.materialize(&mut entity, &raw.key, &raw.value, post_get).await {
                Ok(()) => out.push(entity),
                Err(e) => warn!(key = %raw.key, "skipping malformed record: {}", e),
            }
        }
        Ok(out)
    }

    /// Watches the record at `entity`'s path, superseding any watch there.
    pub async fn watch<E: Entity>(
        &self,
        entity: &E,
    ) -> Result<Watch<E>> {
        let path = entity.path()?;
        self.watch_path(path, false, entity.clone()).await
    }

    /// Watches every record under `template`'s collection root.
    pub async fn watch_prefix<E: Entity>(
        &self,
        template: &E,
    ) -> Result<Watch<E>> {
        self.watch_path(template.prefix().to_string(), true, template.clone()).await
    }

    pub async fn watch_stop<E: Entity>(
        &self,
        entity: &E,
    ) -> Result<()> {
        let path = entity.path()?;
        self.watches.stop(&path).await;
        Ok(())
    }

    pub async fn watch_prefix_stop<E: Entity>(
        &self,
        template: &E,
    ) -> Result<()> {
        self.watches.stop(template.prefix()).await;
        Ok(())
    }

    async fn watch_path<E: Entity>(
        &self,
        path: String,
        recursive: bool,
        template: E,
    ) -> Result<Watch<E>> {
        if self.watches.stop(&path).await {
            debug!(%path, "superseded previous watch");
        }

        let native = self.backend.watch(&path, recursive).await?;
        let (event_tx, event_rx) = mpsc::channel(1);
        let (error_tx, error_rx) = mpsc::channel(1);
        let stop = CancellationToken::new();

        let task = tokio::spawn(run_watch(
            self.clone(),
            path.clone(),
            native,
            template,
            stop.clone(),
            event_tx,
            error_tx,
        ));
        self.watches.insert(path, stop, task).await;

        Ok(Watch {
            events: event_rx,
            errors: error_rx,
        })
    }

    /// Writes a gzip tarball of the whole managed keyspace into `dir`, or the
    /// configured dump directory, and returns its path.
    pub async fn dump(
        &self,
        dir: Option<&Path>,
    ) -> Result<PathBuf> {
        let dir = dir
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.config.dump.resolve_dir());
        let tree = self.backend.tree().await?;
        write_archive(tree, self.backend.prefix(), dir).await
    }

    /// Takes `lock` and holds it until freed.
    pub async fn acquire<L: Lock>(
        &self,
        lock: &L,
    ) -> Result<()> {
        self.backend.acquire(lock_request(lock)?).await
    }

    /// Takes `lock` once; it lapses after `ttl`.
    pub async fn acquire_with_ttl<L: Lock>(
        &self,
        lock: &L,
        ttl: Duration,
    ) -> Result<()> {
        self.backend.acquire_with_ttl(lock_request(lock)?, ttl).await
    }

    /// Takes `lock` and keeps it until the returned handle is stopped.
    ///
    /// Release such a lock through the handle, not [`Store::free`].
    pub async fn acquire_and_refresh<L: Lock>(
        &self,
        lock: &L,
        ttl: Duration,
    ) -> Result<RefreshHandle> {
        self.backend.acquire_and_refresh(lock_request(lock)?, ttl).await
    }

    /// Releases `lock`. Without `force` the held lock must be `lock`.
    pub async fn free<L: Lock>(
        &self,
        lock: &L,
        force: bool,
    ) -> Result<()> {
        self.backend.free(lock_request(lock)?, force).await
    }

    /// Stores `policy` and archives a copy keyed by the current unix time.
    pub async fn publish_policy(
        &self,
        policy: &mut Policy,
    ) -> Result<PolicyRevision> {
        self.set(policy).await?;

        let mut revision = PolicyRevision::new(policy.clone(), chrono::Utc::now().timestamp());
        self.set(&mut revision).await?;
        info!(policy = %policy.name, revision = revision.revision, "published policy");
        Ok(revision)
    }

    /// Archived revisions of a policy, oldest first.
    pub async fn list_policy_revisions(
        &self,
        name: &str,
    ) -> Result<Vec<PolicyRevision>> {
        let mut revisions = self.list_prefix(name, &PolicyRevision::at(name, 0)).await?;
        revisions.sort_by_key(|r| r.revision);
        Ok(revisions)
    }

    pub async fn get_policy_revision(
        &self,
        name: &str,
        revision: i64,
    ) -> Result<PolicyRevision> {
        let mut archived = PolicyRevision::at(name, revision);
        self.get(&mut archived).await?;
        Ok(archived)
    }
}

fn lock_request<L: Lock>(lock: &L) -> Result<LockRequest> {
    let path = lock.path().map_err(Error::into_lock_failed)?;
    let payload = encode(lock).map_err(Error::into_lock_failed)?;
    Ok(LockRequest {
        path,
        payload,
        display: lock.to_string(),
    })
}

/// Body of one watch task. Ends on stop, or once the receiver is gone.
async fn run_watch<E: Entity>(
    store: Store,
    path: String,
    mut native: Box<dyn NativeWatch>,
    template: E,
    stop: CancellationToken,
    events: mpsc::Sender<WatchEvent<E>>,
    errors: mpsc::Sender<Error>,
) {
    let post_get = template.hooks().post_get;
    let backoff = store.config.watch.error_backoff();

    loop {
        let next = tokio::select! {
            biased;
            _ = stop.cancelled() => return,
            _ = events.closed() => return,
            next = native.next() => next,
        };

        let raw = match next {
            Ok(raw) => raw,
            Err(e) => {
                warn!(%path, "watch poll failed: {}", e);
                let _ = errors.try_send(e);
                tokio::select! {
                    _ = stop.cancelled() => return,
                    _ = tokio::time::sleep(backoff) => continue,
                }
            }
        };

        let mut entity = template.clone();
        let built = match raw.kind {
            EventKind::Put => store.materialize(&mut entity, &raw.key, &raw.value, post_get).await,
            EventKind::Delete => entity.set_key(&raw.key),
        };
        if let Err(e) = built {
            warn!(%path, key = %raw.key, "dropping undecodable watch event: {}", e);
            let _ = errors.try_send(e);
            continue;
        }

        let event = WatchEvent {
            kind: raw.kind,
            entity,
        };
        tokio::select! {
            biased;
            _ = stop.cancelled() => return,
            sent = events.send(event) => {
                if sent.is_err() {
                    return;
                }
            }
        }
    }
}
