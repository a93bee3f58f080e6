use std::collections::HashMap;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tracing::trace;

use super::Indexed;
use super::KvPair;
use super::QueryOptions;
use super::SessionKeyspace;
use crate::backend::trim_path;
use crate::EventKind;
use crate::NativeWatch;
use crate::RawEvent;
use crate::Result;

/// Change feed built from blocking queries.
///
/// Each answer is a snapshot, diffed against the previous one by modify
/// index. Writes that land between two answers coalesce: a key written
/// several times yields one put carrying its last value, and a key created
/// and removed within the window yields nothing.
pub(crate) struct SessionWatch {
    keyspace: Arc<dyn SessionKeyspace>,
    prefix: String,
    key: String,
    recursive: bool,
    wait_time: Duration,
    index: u64,
    known: HashMap<String, u64>,
    pending: VecDeque<RawEvent>,
}

impl SessionWatch {
    pub(crate) async fn open(
        keyspace: Arc<dyn SessionKeyspace>,
        prefix: String,
        key: String,
        recursive: bool,
        wait_time: Duration,
    ) -> Result<Self> {
        let mut watch = Self {
            keyspace,
            prefix,
            key,
            recursive,
            wait_time,
            index: 0,
            known: HashMap::new(),
            pending: VecDeque::new(),
        };

        let seed = watch.query(QueryOptions::default()).await?;
        watch.index = seed.index;
        watch.known = seed.value.into_iter().map(|p| (p.key, p.modify_index)).collect();
        Ok(watch)
    }

    async fn query(
        &self,
        opts: QueryOptions,
    ) -> Result<Indexed<Vec<KvPair>>> {
        if self.recursive {
            return self.keyspace.list(&format!("{}/", self.key), opts).await;
        }
        let Indexed { value, index } = self.keyspace.get(&self.key, opts).await?;
        Ok(Indexed {
            value: value.into_iter().collect(),
            index,
        })
    }

    /// Queues the changes between the last answer and `pairs`, an answer
    /// taken at keyspace index `index`.
    ///
    /// Changed keys are ordered by modify index. A vanished key carries no
    /// index of its own, so its delete is placed at `index`: after every
    /// older put, and before a put written at `index` itself, which must be
    /// the last write the answer reflects.
    fn diff(
        &mut self,
        pairs: Vec<KvPair>,
        index: u64,
    ) {
        let current: HashMap<String, u64> = pairs.iter().map(|p| (p.key.clone(), p.modify_index)).collect();

        let mut changes: Vec<(u64, EventKind, String, Bytes)> = pairs
            .into_iter()
            .filter(|p| self.known.get(&p.key) != Some(&p.modify_index))
            .map(|p| (p.modify_index, EventKind::Put, p.key, p.value))
            .collect();
        changes.extend(
            self.known
                .keys()
                .filter(|k| !current.contains_key(*k))
                .map(|k| (index, EventKind::Delete, k.clone(), Bytes::new())),
        );
        changes.sort_by(|a, b| {
            let rank = |kind: &EventKind| matches!(kind, EventKind::Put);
            (a.0, rank(&a.1), &a.2).cmp(&(b.0, rank(&b.1), &b.2))
        });

        for (_, kind, key, value) in changes {
            self.pending.push_back(RawEvent {
                kind,
                key: trim_path(&self.prefix, &key).to_string(),
                value,
            });
        }

        self.known = current;
    }
}

#[async_trait]
impl NativeWatch for SessionWatch {
    async fn next(&mut self) -> Result<RawEvent> {
        loop {
            if let Some(event) = self.pending.pop_front() {
                return Ok(event);
            }

            let opts = QueryOptions {
                wait_index: self.index.max(1),
                wait_time: Some(self.wait_time),
            };
            let answer = self.query(opts).await?;

            if answer.index == self.index {
                trace!(key = %self.key, "blocking query timed out without changes");
                continue;
            }
            // An index moving backwards means the keyspace was reset
            self.index = if answer.index < self.index { 0 } else { answer.index };
            self.diff(answer.value, answer.index);
        }
    }
}
