//! Watcher-backed in-memory cache of one metadata folder.
//!
//! The cache subscribes to store notifications before the initial listing
//! so no change can slip between the two. Notifications are applied
//! idempotently (they are at-least-once). On session loss the cache is
//! frozen and flagged stale: readers get an empty view until a full
//! re-list succeeds after reconnect.

use crate::interface::{CoordinationStore, NodeEvent, SessionEvent, StoreError};
use crate::MetadataNode;
use hashbrown::HashMap;
use observability_deps::tracing::{debug, info, warn};
use parking_lot::RwLock;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;

#[derive(Debug)]
pub(crate) struct NodeCache<T> {
    entries: Arc<RwLock<HashMap<String, T>>>,
    stale: Arc<AtomicBool>,
    watcher: JoinHandle<()>,
}

impl<T: MetadataNode> NodeCache<T> {
    pub(crate) async fn new(store: Arc<dyn CoordinationStore>, folder: String) -> Self {
        let entries = Arc::new(RwLock::new(HashMap::new()));
        let stale = Arc::new(AtomicBool::new(false));

        let node_events = store.watch();
        let session_events = store.session_events();

        if let Err(e) = resync(&store, &folder, &entries).await {
            warn!(folder=%folder, e=%e, "initial metadata cache sync failed, cache starts stale");
            stale.store(true, Ordering::Release);
        }

        let watcher = tokio::task::spawn(run_watcher(
            Arc::clone(&store),
            folder,
            Arc::clone(&entries),
            Arc::clone(&stale),
            node_events,
            session_events,
        ));

        Self {
            entries,
            stale,
            watcher,
        }
    }

    /// A point-in-time view of the cached entities. Empty while stale.
    pub(crate) fn list(&self) -> Vec<T> {
        if self.stale.load(Ordering::Acquire) {
            return vec![];
        }
        self.entries.read().values().cloned().collect()
    }

    pub(crate) fn is_stale(&self) -> bool {
        self.stale.load(Ordering::Acquire)
    }
}

impl<T> Drop for NodeCache<T> {
    fn drop(&mut self) {
        self.watcher.abort();
    }
}

async fn resync<T: MetadataNode>(
    store: &Arc<dyn CoordinationStore>,
    folder: &str,
    entries: &RwLock<HashMap<String, T>>,
) -> Result<(), StoreError> {
    let children = store.list(folder).await?;
    let mut rebuilt = HashMap::with_capacity(children.len());
    for (path, value) in children {
        match serde_json::from_slice::<T>(&value.data) {
            Ok(entity) => {
                rebuilt.insert(path, entity);
            }
            Err(e) => warn!(path=%path, e=%e, "skipping undecodable node during cache sync"),
        }
    }
    *entries.write() = rebuilt;
    Ok(())
}

async fn run_watcher<T: MetadataNode>(
    store: Arc<dyn CoordinationStore>,
    folder: String,
    entries: Arc<RwLock<HashMap<String, T>>>,
    stale: Arc<AtomicBool>,
    mut node_events: broadcast::Receiver<NodeEvent>,
    mut session_events: broadcast::Receiver<SessionEvent>,
) {
    let prefix = format!("{}/", folder.trim_end_matches('/'));

    loop {
        tokio::select! {
            event = node_events.recv() => match event {
                Ok(event) => {
                    // changes are folded in on reconnect instead
                    if !stale.load(Ordering::Acquire) {
                        apply_event(&store, &prefix, &entries, event).await;
                    }
                }
                Err(RecvError::Lagged(missed)) => {
                    debug!(folder=%folder, missed, "cache watch lagged, resyncing");
                    if resync(&store, &folder, &entries).await.is_err() {
                        stale.store(true, Ordering::Release);
                    }
                }
                Err(RecvError::Closed) => return,
            },
            event = session_events.recv() => match event {
                Ok(SessionEvent::Disconnected) => {
                    info!(folder=%folder, "session lost, freezing metadata cache");
                    stale.store(true, Ordering::Release);
                }
                Ok(SessionEvent::Reconnected) | Err(RecvError::Lagged(_)) => {
                    match resync(&store, &folder, &entries).await {
                        Ok(()) => {
                            info!(folder=%folder, "metadata cache rebuilt after reconnect");
                            stale.store(false, Ordering::Release);
                        }
                        Err(e) => {
                            warn!(folder=%folder, e=%e, "cache rebuild failed, staying stale");
                            stale.store(true, Ordering::Release);
                        }
                    }
                }
                Err(RecvError::Closed) => return,
            },
        }
    }
}

async fn apply_event<T: MetadataNode>(
    store: &Arc<dyn CoordinationStore>,
    prefix: &str,
    entries: &RwLock<HashMap<String, T>>,
    event: NodeEvent,
) {
    let path = event.path();
    if !path.starts_with(prefix) || path[prefix.len()..].contains('/') {
        return;
    }

    match event {
        NodeEvent::Created { ref path } | NodeEvent::Updated { ref path } => {
            match store.get(path).await {
                Ok(value) => match serde_json::from_slice::<T>(&value.data) {
                    Ok(entity) => {
                        entries.write().insert(path.clone(), entity);
                    }
                    Err(e) => warn!(path=%path, e=%e, "undecodable node left out of cache"),
                },
                // deleted while the notification was in flight
                Err(StoreError::NotFound { .. }) => {
                    entries.write().remove(path);
                }
                Err(e) => warn!(path=%path, e=%e, "failed to refresh cached node"),
            }
        }
        NodeEvent::Deleted { ref path } => {
            entries.write().remove(path);
        }
    }
}
