//! In-memory [`CoordinationStore`] implementation.
//!
//! Used by tests and single-node deployments. Mirrors the semantics a real
//! coordination service client provides: versioned persistent nodes,
//! tree-wide change notifications, and session events, plus hooks to
//! simulate session loss and transport failure.

use crate::interface::{
    AlreadyExistsSnafu, CoordinationStore, NodeEvent, NotFoundSnafu, SessionEvent, StoreError,
    UnavailableSnafu, VersionMismatchSnafu, VersionedValue,
};
use async_trait::async_trait;
use parking_lot::Mutex;
use snafu::prelude::*;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::broadcast;

/// Buffered notifications per subscriber before it is considered lagged.
const EVENT_CHANNEL_CAPACITY: usize = 1024;

#[derive(Debug, Clone)]
struct Node {
    data: Vec<u8>,
    version: u64,
}

/// An in-process coordination store.
#[derive(Debug)]
pub struct MemCoordinationStore {
    nodes: Mutex<BTreeMap<String, Node>>,
    node_events: broadcast::Sender<NodeEvent>,
    session_events: broadcast::Sender<SessionEvent>,
    connected: AtomicBool,
    fail_requests: AtomicBool,
}

impl Default for MemCoordinationStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemCoordinationStore {
    /// Create an empty, connected store.
    pub fn new() -> Self {
        let (node_events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let (session_events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            nodes: Mutex::new(BTreeMap::new()),
            node_events,
            session_events,
            connected: AtomicBool::new(true),
            fail_requests: AtomicBool::new(false),
        }
    }

    /// Drop the session: requests fail with [`StoreError::Unavailable`] and
    /// a [`SessionEvent::Disconnected`] is broadcast.
    pub fn simulate_disconnect(&self) {
        self.connected.store(false, Ordering::Release);
        let _ = self.session_events.send(SessionEvent::Disconnected);
    }

    /// Re-establish the session and broadcast
    /// [`SessionEvent::Reconnected`].
    pub fn simulate_reconnect(&self) {
        self.connected.store(true, Ordering::Release);
        let _ = self.session_events.send(SessionEvent::Reconnected);
    }

    /// Make every request fail with [`StoreError::Unavailable`] without
    /// touching the session, to exercise retry paths.
    pub fn set_fail_requests(&self, fail: bool) {
        self.fail_requests.store(fail, Ordering::Release);
    }

    fn check_available(&self) -> Result<(), StoreError> {
        if !self.connected.load(Ordering::Acquire) {
            return UnavailableSnafu {
                message: "session lost",
            }
            .fail();
        }
        if self.fail_requests.load(Ordering::Acquire) {
            return UnavailableSnafu {
                message: "injected transport failure",
            }
            .fail();
        }
        Ok(())
    }

    fn notify(&self, event: NodeEvent) {
        // nobody listening is fine
        let _ = self.node_events.send(event);
    }
}

#[async_trait]
impl CoordinationStore for MemCoordinationStore {
    async fn create(&self, path: &str, data: Vec<u8>) -> Result<(), StoreError> {
        self.check_available()?;

        let mut nodes = self.nodes.lock();
        ensure!(
            !nodes.contains_key(path),
            AlreadyExistsSnafu { path }
        );
        nodes.insert(path.to_string(), Node { data, version: 0 });
        drop(nodes);

        self.notify(NodeEvent::Created {
            path: path.to_string(),
        });
        Ok(())
    }

    async fn get(&self, path: &str) -> Result<VersionedValue, StoreError> {
        self.check_available()?;

        let nodes = self.nodes.lock();
        nodes
            .get(path)
            .map(|n| VersionedValue {
                data: n.data.clone(),
                version: n.version,
            })
            .context(NotFoundSnafu { path })
    }

    async fn update(
        &self,
        path: &str,
        data: Vec<u8>,
        expected_version: Option<u64>,
    ) -> Result<u64, StoreError> {
        self.check_available()?;

        let mut nodes = self.nodes.lock();
        let node = nodes
            .get_mut(path)
            .context(NotFoundSnafu { path })?;
        if let Some(expected) = expected_version {
            ensure!(
                node.version == expected,
                VersionMismatchSnafu {
                    path,
                    expected,
                    actual: node.version,
                }
            );
        }
        node.data = data;
        node.version += 1;
        let version = node.version;
        drop(nodes);

        self.notify(NodeEvent::Updated {
            path: path.to_string(),
        });
        Ok(version)
    }

    async fn delete(&self, path: &str) -> Result<(), StoreError> {
        self.check_available()?;

        let mut nodes = self.nodes.lock();
        nodes
            .remove(path)
            .context(NotFoundSnafu { path })?;
        drop(nodes);

        self.notify(NodeEvent::Deleted {
            path: path.to_string(),
        });
        Ok(())
    }

    async fn list(&self, folder: &str) -> Result<Vec<(String, VersionedValue)>, StoreError> {
        self.check_available()?;

        let prefix = format!("{}/", folder.trim_end_matches('/'));
        let nodes = self.nodes.lock();
        Ok(nodes
            .iter()
            .filter(|(path, _)| {
                path.strip_prefix(&prefix)
                    .map(|rest| !rest.is_empty() && !rest.contains('/'))
                    .unwrap_or(false)
            })
            .map(|(path, node)| {
                (
                    path.clone(),
                    VersionedValue {
                        data: node.data.clone(),
                        version: node.version,
                    },
                )
            })
            .collect())
    }

    fn watch(&self) -> broadcast::Receiver<NodeEvent> {
        self.node_events.subscribe()
    }

    fn session_events(&self) -> broadcast::Receiver<SessionEvent> {
        self.session_events.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[tokio::test]
    async fn create_get_delete() {
        let store = MemCoordinationStore::new();

        store.create("/t/a", b"one".to_vec()).await.unwrap();
        let value = store.get("/t/a").await.unwrap();
        assert_eq!(value.data, b"one");
        assert_eq!(value.version, 0);

        assert_matches!(
            store.create("/t/a", b"two".to_vec()).await,
            Err(StoreError::AlreadyExists { .. })
        );

        store.delete("/t/a").await.unwrap();
        assert_matches!(store.get("/t/a").await, Err(StoreError::NotFound { .. }));
        assert_matches!(store.delete("/t/a").await, Err(StoreError::NotFound { .. }));
    }

    #[tokio::test]
    async fn update_versions() {
        let store = MemCoordinationStore::new();
        store.create("/t/a", b"one".to_vec()).await.unwrap();

        let v1 = store.update("/t/a", b"two".to_vec(), Some(0)).await.unwrap();
        assert_eq!(v1, 1);

        assert_matches!(
            store.update("/t/a", b"three".to_vec(), Some(0)).await,
            Err(StoreError::VersionMismatch {
                expected: 0,
                actual: 1,
                ..
            })
        );

        // unconditional update always wins
        let v2 = store.update("/t/a", b"three".to_vec(), None).await.unwrap();
        assert_eq!(v2, 2);
    }

    #[tokio::test]
    async fn list_returns_direct_children_only() {
        let store = MemCoordinationStore::new();
        store.create("/t/a", b"a".to_vec()).await.unwrap();
        store.create("/t/b", b"b".to_vec()).await.unwrap();
        store.create("/t/b/nested", b"n".to_vec()).await.unwrap();
        store.create("/other/c", b"c".to_vec()).await.unwrap();

        let children = store.list("/t").await.unwrap();
        let paths: Vec<_> = children.iter().map(|(p, _)| p.as_str()).collect();
        assert_eq!(paths, vec!["/t/a", "/t/b"]);
    }

    #[tokio::test]
    async fn watch_sees_changes() {
        let store = MemCoordinationStore::new();
        let mut events = store.watch();

        store.create("/t/a", b"a".to_vec()).await.unwrap();
        store.update("/t/a", b"b".to_vec(), None).await.unwrap();
        store.delete("/t/a").await.unwrap();

        assert_eq!(
            events.recv().await.unwrap(),
            NodeEvent::Created {
                path: "/t/a".to_string()
            }
        );
        assert_eq!(
            events.recv().await.unwrap(),
            NodeEvent::Updated {
                path: "/t/a".to_string()
            }
        );
        assert_eq!(
            events.recv().await.unwrap(),
            NodeEvent::Deleted {
                path: "/t/a".to_string()
            }
        );
    }

    #[tokio::test]
    async fn disconnect_fails_requests() {
        let store = MemCoordinationStore::new();
        let mut session = store.session_events();

        store.simulate_disconnect();
        assert_matches!(
            store.get("/t/a").await,
            Err(StoreError::Unavailable { .. })
        );
        assert_eq!(session.recv().await.unwrap(), SessionEvent::Disconnected);

        store.simulate_reconnect();
        assert_matches!(store.get("/t/a").await, Err(StoreError::NotFound { .. }));
        assert_eq!(session.recv().await.unwrap(), SessionEvent::Reconnected);
    }

    #[tokio::test]
    async fn injected_failures() {
        let store = MemCoordinationStore::new();
        store.set_fail_requests(true);
        assert_matches!(
            store.create("/t/a", vec![]).await,
            Err(StoreError::Unavailable { .. })
        );

        store.set_fail_requests(false);
        store.create("/t/a", vec![]).await.unwrap();
    }
}
