//! The abstraction over the coordination service.
//!
//! The cluster keeps its metadata in a strongly-consistent hierarchical KV
//! store: string paths, opaque byte payloads, per-node versioning, and
//! change notifications. [`CoordinationStore`] is the seam the typed stores
//! are built on; the wire client for a real deployment lives outside this
//! crate, [`MemCoordinationStore`](crate::mem::MemCoordinationStore) backs
//! tests and single-node setups.

use async_trait::async_trait;
use snafu::Snafu;
use std::fmt::Debug;
use tokio::sync::broadcast;

/// A node payload together with the store-assigned version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionedValue {
    /// Opaque payload bytes.
    pub data: Vec<u8>,
    /// Version, incremented by the store on every update.
    pub version: u64,
}

/// A change notification for one node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeEvent {
    /// The node at `path` was created.
    Created {
        /// Absolute node path.
        path: String,
    },
    /// The payload at `path` changed.
    Updated {
        /// Absolute node path.
        path: String,
    },
    /// The node at `path` was removed.
    Deleted {
        /// Absolute node path.
        path: String,
    },
}

impl NodeEvent {
    /// The path this event refers to.
    pub fn path(&self) -> &str {
        match self {
            Self::Created { path } | Self::Updated { path } | Self::Deleted { path } => path,
        }
    }
}

/// Connection-level events.
///
/// Observers must treat `Disconnected` as invalidating any state derived
/// from watches: notifications may have been lost while the session was
/// down. On `Reconnected` derived state has to be rebuilt from a full read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEvent {
    /// The session with the coordination service was lost.
    Disconnected,
    /// A session was (re-)established.
    Reconnected,
}

/// Errors raised by a [`CoordinationStore`].
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum StoreError {
    /// Create of a path that already holds a node.
    #[snafu(display("node already exists: {path}"))]
    AlreadyExists {
        /// Absolute node path.
        path: String,
    },

    /// Read/update/delete of a path with no node.
    #[snafu(display("node not found: {path}"))]
    NotFound {
        /// Absolute node path.
        path: String,
    },

    /// Conditional update lost the race.
    #[snafu(display("version conflict at {path}: expected {expected}, actual {actual}"))]
    VersionMismatch {
        /// Absolute node path.
        path: String,
        /// Version the caller based its update on.
        expected: u64,
        /// Version the store currently holds.
        actual: u64,
    },

    /// Transport-level failure. Retryable.
    #[snafu(display("coordination store unavailable: {message}"))]
    Unavailable {
        /// Human-readable cause.
        message: String,
    },
}

/// A strongly-consistent hierarchical KV store with watches.
///
/// Paths are `/`-separated strings; all nodes are persistent. Watch
/// notifications are at-least-once: consumers must apply them
/// idempotently.
#[async_trait]
pub trait CoordinationStore: Debug + Send + Sync + 'static {
    /// Create a node. Fails with [`StoreError::AlreadyExists`] if present.
    async fn create(&self, path: &str, data: Vec<u8>) -> Result<(), StoreError>;

    /// Fetch a node's payload and version.
    async fn get(&self, path: &str) -> Result<VersionedValue, StoreError>;

    /// Replace a node's payload, optionally conditional on
    /// `expected_version`. Returns the new version.
    async fn update(
        &self,
        path: &str,
        data: Vec<u8>,
        expected_version: Option<u64>,
    ) -> Result<u64, StoreError>;

    /// Remove a node. Fails with [`StoreError::NotFound`] if absent.
    async fn delete(&self, path: &str) -> Result<(), StoreError>;

    /// The direct children of `folder`, with their payloads.
    async fn list(&self, folder: &str) -> Result<Vec<(String, VersionedValue)>, StoreError>;

    /// Subscribe to node change notifications for the whole tree.
    fn watch(&self) -> broadcast::Receiver<NodeEvent>;

    /// Subscribe to connection-level events.
    fn session_events(&self) -> broadcast::Receiver<SessionEvent>;
}
