use std::collections::HashMap;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::warn;

use crate::Error;
use crate::EventKind;

/// One change delivered by a watch.
///
/// For deletes `entity` is a copy of the watch template with only its
/// identity fields set.
#[derive(Debug, Clone, PartialEq)]
pub struct WatchEvent<E> {
    pub kind: EventKind,
    pub entity: E,
}

/// Receiving side of a watch.
///
/// `events` holds one event, so an event produced before the watch is
/// stopped may still be received once; nothing produced after stop is.
/// `errors` holds at most one pending failure; further failures are dropped
/// until it is drained.
#[derive(Debug)]
pub struct Watch<E> {
    pub events: mpsc::Receiver<WatchEvent<E>>,
    pub errors: mpsc::Receiver<Error>,
}

struct ActiveWatch {
    stop: CancellationToken,
    task: JoinHandle<()>,
}

impl ActiveWatch {
    async fn shutdown(self) {
        self.stop.cancel();
        if let Err(e) = self.task.await {
            if e.is_panic() {
                warn!("watch task panicked: {}", e);
            }
        }
    }
}

/// Active watches of one store, at most one per path.
#[derive(Default)]
pub(crate) struct WatchRegistry {
    active: Mutex<HashMap<String, ActiveWatch>>,
}

impl WatchRegistry {
    /// Tears down the watch on `path`, waiting for its task to end.
    ///
    /// Returns whether a watch was registered.
    pub(crate) async fn stop(
        &self,
        path: &str,
    ) -> bool {
        let removed = self.active.lock().remove(path);
        match removed {
            Some(watch) => {
                debug!(%path, "stopping watch");
                watch.shutdown().await;
                true
            }
            None => false,
        }
    }

    /// Registers a running watch. A watch that raced in on the same path is
    /// torn down.
    pub(crate) async fn insert(
        &self,
        path: String,
        stop: CancellationToken,
        task: JoinHandle<()>,
    ) {
        let raced = self.active.lock().insert(path, ActiveWatch { stop, task });
        if let Some(raced) = raced {
            raced.shutdown().await;
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.active.lock().len()
    }
}
