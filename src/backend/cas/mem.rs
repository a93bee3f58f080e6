//! In-process CAS keyspace.
//!
//! Mirrors the etcd v2 keys API closely enough to run the store and its lock
//! subsystem without a server: explicit directories, a global index, lazily
//! expired TTLs (emitting `expire` events) and a bounded event history for
//! indexed watches. Time is tokio time, so paused-clock tests drive expiry.

use std::collections::BTreeMap;
use std::collections::VecDeque;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::trace;

use super::CasAction;
use super::CasKeyspace;
use super::CasNode;
use super::CasResponse;
use super::DeleteOptions;
use super::GetOptions;
use super::PrevExist;
use super::SetOptions;
use super::WatchOptions;
use crate::cas_code;
use crate::CasError;
use crate::Result;

const DEFAULT_HISTORY_SIZE: usize = 1000;

#[derive(Debug, Clone, Default)]
struct MemNode {
    value: String,
    dir: bool,
    children: BTreeMap<String, MemNode>,
    created_index: u64,
    modified_index: u64,
    expires: Option<Instant>,
}

impl MemNode {
    fn root() -> Self {
        Self {
            dir: true,
            ..Default::default()
        }
    }

    fn render(
        &self,
        key: &str,
        depth: Depth,
        now: Instant,
    ) -> CasNode {
        let nodes = match (self.dir, depth) {
            (true, Depth::Recursive) => self.render_children(key, Depth::Recursive, now),
            (true, Depth::Children) => self.render_children(key, Depth::Node, now),
            _ => Vec::new(),
        };

        CasNode {
            key: key.to_string(),
            value: self.value.clone(),
            dir: self.dir,
            nodes,
            created_index: self.created_index,
            modified_index: self.modified_index,
            ttl: self
                .expires
                .map(|at| at.saturating_duration_since(now).as_secs_f64().ceil() as i64),
        }
    }

    fn render_children(
        &self,
        key: &str,
        depth: Depth,
        now: Instant,
    ) -> Vec<CasNode> {
        self.children
            .iter()
            .map(|(name, child)| child.render(&join(key, name), depth, now))
            .collect()
    }

    fn next_expiry(&self) -> Option<Instant> {
        let own = self.expires;
        let below = self.children.values().filter_map(MemNode::next_expiry).min();
        match (own, below) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    fn collect_expired(
        &self,
        key: &str,
        now: Instant,
        out: &mut Vec<String>,
    ) {
        for (name, child) in &self.children {
            let child_key = join(key, name);
            if child.expires.is_some_and(|at| at <= now) {
                out.push(child_key);
            } else if child.dir {
                child.collect_expired(&child_key, now, out);
            }
        }
    }
}

enum Poll {
    Ready(CasResponse),
    Wait(Option<Instant>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Depth {
    Node,
    Children,
    Recursive,
}

fn segments(key: &str) -> Vec<&str> {
    key.split('/').filter(|s| !s.is_empty()).collect()
}

fn canonical(segments: &[&str]) -> String {
    format!("/{}", segments.join("/"))
}

fn join(
    parent: &str,
    name: &str,
) -> String {
    if parent == "/" {
        format!("/{name}")
    } else {
        format!("{parent}/{name}")
    }
}

fn watched(
    event_key: &str,
    key: &str,
    recursive: bool,
) -> bool {
    event_key == key || (recursive && (key == "/" || event_key.starts_with(&format!("{key}/"))))
}

#[derive(Debug)]
struct State {
    root: MemNode,
    index: u64,
    history: VecDeque<CasResponse>,
    history_size: usize,
    /// Highest index that fell out of `history`
    cleared_through: u64,
}

impl State {
    fn find(
        &self,
        segments: &[&str],
    ) -> Option<&MemNode> {
        segments
            .iter()
            .try_fold(&self.root, |node, name| node.children.get(*name))
    }

    fn parent_mut(
        &mut self,
        segments: &[&str],
    ) -> Option<&mut MemNode> {
        let (_, parents) = segments.split_last()?;
        parents
            .iter()
            .try_fold(&mut self.root, |node, name| node.children.get_mut(*name))
    }

    fn record(
        &mut self,
        event: CasResponse,
    ) {
        self.history.push_back(event);
        while self.history.len() > self.history_size {
            if let Some(dropped) = self.history.pop_front() {
                self.cleared_through = dropped.index;
            }
        }
    }

    fn remove(
        &mut self,
        segments: &[&str],
    ) -> Option<MemNode> {
        let name = segments.last()?;
        self.parent_mut(segments)?.children.remove(*name)
    }

    /// Drops expired nodes, recording an `expire` event for each.
    fn purge_expired(
        &mut self,
        now: Instant,
    ) -> bool {
        let mut expired = Vec::new();
        self.root.collect_expired("/", now, &mut expired);

        for key in &expired {
            let segs = segments(key);
            if let Some(old) = self.remove(&segs) {
                self.index += 1;
                trace!(key = %key, index = self.index, "cas key expired");
                let event = CasResponse {
                    action: CasAction::Expire,
                    node: CasNode {
                        key: key.clone(),
                        dir: old.dir,
                        created_index: old.created_index,
                        modified_index: self.index,
                        ..Default::default()
                    },
                    prev_node: Some(old.render(key, Depth::Node, now)),
                    index: self.index,
                };
                self.record(event);
            }
        }

        !expired.is_empty()
    }

    fn error(
        &self,
        code: u64,
        key: &str,
    ) -> crate::Error {
        CasError::new(code, key, self.index).into()
    }
}

/// In-memory [`CasKeyspace`].
#[derive(Debug)]
pub struct MemCasKeyspace {
    state: Mutex<State>,
    changed: Notify,
}

impl Default for MemCasKeyspace {
    fn default() -> Self {
        Self::new(DEFAULT_HISTORY_SIZE)
    }
}

impl MemCasKeyspace {
    /// `history_size` bounds how far back an indexed watch may start.
    pub fn new(history_size: usize) -> Self {
        Self {
            state: Mutex::new(State {
                root: MemNode::root(),
                index: 0,
                history: VecDeque::new(),
                history_size: history_size.max(1),
                cleared_through: 0,
            }),
            changed: Notify::new(),
        }
    }

    /// Runs `f` against freshly purged state, waking watchers if anything
    /// changed.
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
}

#[async_trait]
impl CasKeyspace for MemCasKeyspace {
    async fn get(
        &self,
        key: &str,
        opts: GetOptions,
    ) -> Result<CasResponse> {
        self.with_state(|state, now| {
            let segs = segments(key);
            let path = canonical(&segs);
            let node = state.find(&segs).ok_or_else(|| state.error(cas_code::KEY_NOT_FOUND, &path))?;
            let depth = if opts.recursive { Depth::Recursive } else { Depth::Children };
            Ok(CasResponse {
                action: CasAction::Get,
                node: node.render(&path, depth, now),
                prev_node: None,
                index: state.index,
            })
        })
    }

    async fn set(
        &self,
        key: &str,
        value: &str,
        opts: SetOptions,
    ) -> Result<CasResponse> {
        self.with_state(|state, now| {
            let segs = segments(key);
            let path = canonical(&segs);
            if segs.is_empty() {
                return Err(state.error(cas_code::ROOT_RONLY, &path));
            }

            let existing = state.find(&segs).cloned();

            if let Some(prev_value) = &opts.prev_value {
                match &existing {
                    None => return Err(state.error(cas_code::KEY_NOT_FOUND, &path)),
                    Some(node) if node.dir => return Err(state.error(cas_code::NOT_FILE, &path)),
                    Some(node) if &node.value != prev_value => {
                        return Err(state.error(cas_code::TEST_FAILED, &path));
                    }
                    Some(_) => {}
                }
            }

            match (opts.prev_exist, &existing) {
                (Some(PrevExist::NoExist), Some(_)) => return Err(state.error(cas_code::NODE_EXIST, &path)),
                (Some(PrevExist::Exist), None) => return Err(state.error(cas_code::KEY_NOT_FOUND, &path)),
                _ => {}
            }

            if let Some(node) = &existing {
                if node.dir != opts.dir || (node.dir && opts.prev_exist != Some(PrevExist::Exist)) {
                    return Err(state.error(cas_code::NOT_FILE, &path));
                }
            }

            for depth in 1..segs.len() {
                if let Some(ancestor) = state.find(&segs[..depth]) {
                    if !ancestor.dir {
                        return Err(state.error(cas_code::NOT_DIR, &canonical(&segs[..depth])));
                    }
                }
            }

            let action = match (&opts.prev_value, opts.prev_exist) {
                (Some(_), _) => CasAction::CompareAndSwap,
                (None, Some(PrevExist::NoExist)) => CasAction::Create,
                (None, Some(PrevExist::Exist)) => CasAction::Update,
                (None, None) => CasAction::Set,
            };

            state.index += 1;
            let index = state.index;

            let mut parent = &mut state.root;
            for name in &segs[..segs.len() - 1] {
                parent = parent.children.entry(name.to_string()).or_insert_with(|| MemNode {
                    dir: true,
                    created_index: index,
                    modified_index: index,
                    ..Default::default()
                });
            }

            let node = MemNode {
                value: if opts.dir { String::new() } else { value.to_string() },
                dir: opts.dir,
                children: existing.as_ref().map(|n| n.children.clone()).unwrap_or_default(),
                created_index: existing.as_ref().map_or(index, |n| n.created_index),
                modified_index: index,
                expires: opts.ttl.map(|ttl| now + ttl),
            };
            let rendered = node.render(&path, Depth::Node, now);
            parent.children.insert(segs[segs.len() - 1].to_string(), node);

            let response = CasResponse {
                action,
                node: rendered,
                prev_node: existing.map(|n| n.render(&path, Depth::Node, now)),
                index,
            };
            state.record(response.clone());
            Ok(response)
        })
    }

    async fn delete(
        &self,
        key: &str,
        opts: DeleteOptions,
    ) -> Result<CasResponse> {
        self.with_state(|state, now| {
            let segs = segments(key);
            let path = canonical(&segs);
            if segs.is_empty() {
                return Err(state.error(cas_code::ROOT_RONLY, &path));
            }

            let existing = state
                .find(&segs)
                .ok_or_else(|| state.error(cas_code::KEY_NOT_FOUND, &path))?;

            if existing.dir {
                if !(opts.dir || opts.recursive) || opts.prev_value.is_some() {
                    return Err(state.error(cas_code::NOT_FILE, &path));
                }
                if !opts.recursive && !existing.children.is_empty() {
                    return Err(state.error(cas_code::DIR_NOT_EMPTY, &path));
                }
            }

            if let Some(prev_value) = &opts.prev_value {
                if &existing.value != prev_value {
                    return Err(state.error(cas_code::TEST_FAILED, &path));
                }
            }

            let Some(old) = state.remove(&segs) else {
                return Err(state.error(cas_code::KEY_NOT_FOUND, &path));
            };
            state.index += 1;

            let response = CasResponse {
                action: if opts.prev_value.is_some() {
                    CasAction::CompareAndDelete
                } else {
                    CasAction::Delete
                },
                node: CasNode {
                    key: path.clone(),
                    dir: old.dir,
                    created_index: old.created_index,
                    modified_index: state.index,
                    ..Default::default()
                },
                prev_node: Some(old.render(&path, Depth::Node, now)),
                index: state.index,
            };
            state.record(response.clone());
            Ok(response)
        })
    }

    async fn watch(
        &self,
        key: &str,
        opts: WatchOptions,
    ) -> Result<CasResponse> {
        let path = canonical(&segments(key));
        let mut wait_index = opts.wait_index;

        loop {
            let notified = self.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let poll = self.with_state(|state, _| {
                if wait_index == 0 {
                    wait_index = state.index + 1;
                }
                if wait_index <= state.cleared_through {
                    return Err(state.error(cas_code::EVENT_INDEX_CLEARED, &path));
                }
                if let Some(event) = state
                    .history
                    .iter()
                    .find(|e| e.index >= wait_index && watched(&e.node.key, &path, opts.recursive))
                {
                    return Ok(Poll::Ready(CasResponse {
                        index: state.index,
                        ..event.clone()
                    }));
                }
                Ok(Poll::Wait(state.root.next_expiry()))
            })?;

            match poll {
                Poll::Ready(event) => return Ok(event),
                Poll::Wait(Some(at)) => {
                    tokio::select! {
                        _ = &mut notified => {}
                        _ = tokio::time::sleep_until(at) => {}
                    }
                }
                Poll::Wait(None) => notified.await,
            }
        }
    }

    async fn index(&self) -> Result<u64> {
        self.with_state(|state, _| Ok(state.index))
    }
}
