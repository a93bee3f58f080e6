//! In-process session keyspace.
//!
//! Flat pairs, a global index, sessions with lazily enforced TTLs and
//! blocking queries. Session expiry releases held keys, bumping their
//! modify index like any other write.

use std::collections::BTreeMap;
use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use rand::Rng;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::trace;

use super::Indexed;
use super::KvPair;
use super::QueryOptions;
use super::SessionKeyspace;
use crate::Error;
use crate::Result;
use crate::TransportError;

const DEFAULT_WAIT_TIME: Duration = Duration::from_secs(300);

#[derive(Debug)]
struct Session {
    ttl: Duration,
    expires: Instant,
}

#[derive(Debug)]
struct State {
    pairs: BTreeMap<String, KvPair>,
    sessions: HashMap<String, Session>,
    index: u64,
}

impl State {
    fn bump(&mut self) -> u64 {
        self.index += 1;
        self.index
    }

    /// Unbinds every key held by `session`.
    fn release_all(
        &mut self,
        session: &str,
    ) {
        let held: Vec<String> = self
            .pairs
            .values()
            .filter(|p| p.session.as_deref() == Some(session))
            .map(|p| p.key.clone())
            .collect();

        for key in held {
            let index = self.bump();
            if let Some(pair) = self.pairs.get_mut(&key) {
                pair.session = None;
                pair.modify_index = index;
            }
        }
    }

    fn purge_expired(
        &mut self,
        now: Instant,
    ) {
        let expired: Vec<String> = self
            .sessions
            .iter()
            .filter(|(_, s)| s.expires <= now)
            .map(|(id, _)| id.clone())
            .collect();

        for id in expired {
            trace!(session = %id, "session expired");
            self.sessions.remove(&id);
            self.release_all(&id);
        }
    }

    fn next_expiry(&self) -> Option<Instant> {
        self.sessions.values().map(|s| s.expires).min()
    }

    fn require_session(
        &self,
        session: &str,
    ) -> Result<()> {
        if self.sessions.contains_key(session) {
            return Ok(());
        }
        Err(Error::Transport(TransportError::Session(format!(
            "invalid session {session:?}"
        ))))
    }
}

/// In-memory [`SessionKeyspace`].
#[derive(Debug)]
pub struct MemSessionKeyspace {
    state: Mutex<State>,
    changed: Notify,
}

impl Default for MemSessionKeyspace {
    fn default() -> Self {
        Self::new()
    }
}

impl MemSessionKeyspace {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State {
                pairs: BTreeMap::new(),
                sessions: HashMap::new(),
                index: 1,
            }),
            changed: Notify::new(),
        }
    }

    fn with_state<T>(
        &self,
        f: impl FnOnce(&mut State, Instant) -> Result<T>,
    ) -> Result<T> {
        let now = Instant::now();
        let (result, changed) = {
            let mut state = self.state.lock();
            let before = state.index;
            state.purge_expired(now);
            let result = f(&mut state, now);
            (result, state.index != before)
        };
        if changed {
            self.changed.notify_waiters();
        }
        result
    }

    /// Answers `query` once the index passes `opts.wait_index` or the wait
    /// time runs out.
    async fn blocking<T>(
        &self,
        opts: QueryOptions,
        query: impl Fn(&State) -> T,
    ) -> Result<Indexed<T>> {
        let deadline = Instant::now() + opts.wait_time.unwrap_or(DEFAULT_WAIT_TIME);

        loop {
            let notified = self.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let (ready, next_expiry) = self.with_state(|state, now| {
                let ready = opts.wait_index == 0 || state.index > opts.wait_index || now >= deadline;
                let answer = ready.then(|| Indexed {
                    value: query(state),
                    index: state.index,
                });
                Ok((answer, state.next_expiry()))
            })?;

            if let Some(answer) = ready {
                return Ok(answer);
            }

            let wake = next_expiry.map_or(deadline, |at| at.min(deadline));
            tokio::select! {
                _ = &mut notified => {}
                _ = tokio::time::sleep_until(wake) => {}
            }
        }
    }

    /// Number of live sessions.
    pub fn session_count(&self) -> usize {
        let now = Instant::now();
        let mut state = self.state.lock();
        state.purge_expired(now);
        state.sessions.len()
    }
}

fn session_id() -> String {
    let mut rng = rand::thread_rng();
    format!(
        "{:08x}-{:04x}-{:04x}-{:04x}-{:012x}",
        rng.gen::<u32>(),
        rng.gen::<u16>(),
        rng.gen::<u16>(),
        rng.gen::<u16>(),
        rng.gen::<u64>() & 0xffff_ffff_ffff
    )
}

#[async_trait]
impl SessionKeyspace for MemSessionKeyspace {
    async fn get(
        &self,
        key: &str,
        opts: QueryOptions,
    ) -> Result<Indexed<Option<KvPair>>> {
        self.blocking(opts, |state| state.pairs.get(key).cloned()).await
    }

    async fn list(
        &self,
        prefix: &str,
        opts: QueryOptions,
    ) -> Result<Indexed<Vec<KvPair>>> {
        self.blocking(opts, |state| {
            state
                .pairs
                .range(prefix.to_string()..)
                .take_while(|(k, _)| k.starts_with(prefix))
                .map(|(_, p)| p.clone())
                .collect()
        })
        .await
    }

    async fn put(
        &self,
        key: &str,
        value: Bytes,
    ) -> Result<()> {
        self.with_state(|state, _| {
            let index = state.bump();
            let pair = state.pairs.entry(key.to_string()).or_insert_with(|| KvPair {
                key: key.to_string(),
                create_index: index,
                ..Default::default()
            });
            pair.value = value;
            pair.modify_index = index;
            Ok(())
        })
    }

    async fn delete(
        &self,
        key: &str,
    ) -> Result<()> {
        self.with_state(|state, _| {
            if state.pairs.remove(key).is_some() {
                state.bump();
            }
            Ok(())
        })
    }

    async fn delete_tree(
        &self,
        prefix: &str,
    ) -> Result<()> {
        self.with_state(|state, _| {
            let before = state.pairs.len();
            state.pairs.retain(|k, _| !k.starts_with(prefix));
            if state.pairs.len() != before {
                state.bump();
            }
            Ok(())
        })
    }

    async fn acquire(
        &self,
        key: &str,
        value: Bytes,
        session: &str,
    ) -> Result<bool> {
        self.with_state(|state, _| {
            state.require_session(session)?;

            if let Some(holder) = state.pairs.get(key).and_then(|p| p.session.as_deref()) {
                if holder != session {
                    return Ok(false);
                }
            }

            let index = state.bump();
            let pair = state.pairs.entry(key.to_string()).or_insert_with(|| KvPair {
                key: key.to_string(),
                create_index: index,
                ..Default::default()
            });
            if pair.session.is_none() {
                pair.lock_index += 1;
                pair.session = Some(session.to_string());
            }
            pair.value = value;
            pair.modify_index = index;
            Ok(true)
        })
    }

    async fn release(
        &self,
        key: &str,
        session: &str,
    ) -> Result<bool> {
        self.with_state(|state, _| {
            let held = state
                .pairs
                .get(key)
                .is_some_and(|p| p.session.as_deref() == Some(session));
            if !held {
                return Ok(false);
            }

            let index = state.bump();
            if let Some(pair) = state.pairs.get_mut(key) {
                pair.session = None;
                pair.modify_index = index;
            }
            Ok(true)
        })
    }

    async fn session_create(
        &self,
        ttl: Duration,
        _with_checks: bool,
    ) -> Result<String> {
        self.with_state(|state, now| {
            let id = session_id();
            state.sessions.insert(id.clone(), Session { ttl, expires: now + ttl });
            Ok(id)
        })
    }

    async fn session_renew(
        &self,
        id: &str,
    ) -> Result<bool> {
        self.with_state(|state, now| match state.sessions.get_mut(id) {
            Some(session) => {
                session.expires = now + session.ttl;
                Ok(true)
            }
            None => Ok(false),
        })
    }

    async fn session_destroy(
        &self,
        id: &str,
    ) -> Result<()> {
        self.with_state(|state, _| {
            if state.sessions.remove(id).is_some() {
                state.release_all(id);
            }
            Ok(())
        })
    }
}
