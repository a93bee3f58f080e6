use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tracing::warn;

use super::CasKeyspace;
use super::WatchOptions;
use crate::backend::trim_path;
use crate::cas_code;
use crate::Error;
use crate::EventKind;
use crate::NativeWatch;
use crate::RawEvent;
use crate::Result;
use crate::TransportError;

/// Indexed change feed over a CAS keyspace.
///
/// Positioned at the keyspace index seen when it was opened, so changes made
/// between opening and the first `next` are not missed.
pub(crate) struct CasWatch {
    keyspace: Arc<dyn CasKeyspace>,
    prefix: String,
    key: String,
    recursive: bool,
    after_index: u64,
}

impl CasWatch {
    pub(crate) async fn open(
        keyspace: Arc<dyn CasKeyspace>,
        prefix: String,
        key: String,
        recursive: bool,
    ) -> Result<Self> {
        let after_index = keyspace.index().await?;
        Ok(Self {
            keyspace,
            prefix,
            key,
            recursive,
            after_index,
        })
    }
}

#[async_trait]
impl NativeWatch for CasWatch {
    async fn next(&mut self) -> Result<RawEvent> {
        loop {
            let opts = WatchOptions {
                recursive: self.recursive,
                wait_index: self.after_index + 1,
            };

            let resp = match self.keyspace.watch(&self.key, opts).await {
                Ok(resp) => resp,
                Err(Error::Transport(TransportError::Cas(e))) if e.is(cas_code::EVENT_INDEX_CLEARED) => {
                    warn!(key = %self.key, index = e.index, "watch fell behind the event history, skipping ahead");
                    self.after_index = e.index;
                    return Err(Error::Transport(TransportError::Cas(e)));
                }
                Err(e) => return Err(e),
            };

            self.after_index = resp.node.modified_index.max(self.after_index + 1);

            if resp.node.dir {
                continue;
            }

            let kind = resp.action.kind();
            let value = match kind {
                EventKind::Put => Bytes::from(resp.node.value),
                EventKind::Delete => Bytes::new(),
            };

            return Ok(RawEvent {
                kind,
                key: trim_path(&self.prefix, &resp.node.key).to_string(),
                value,
            });
        }
    }
}
