//! Store for [`SnapshotMetadata`] records.

use crate::core::TypedStore;
use crate::interface::CoordinationStore;
use crate::Result;
use backoff::BackoffConfig;
use data_types::SnapshotMetadata;
use std::sync::Arc;

/// Folder holding one node per published snapshot.
pub const SNAPSHOT_STORE_FOLDER: &str = "/snapshots";

/// Access to the cluster's published snapshots.
///
/// Snapshots are immutable: the store intentionally exposes no update
/// operation. Deleting a snapshot that does not exist is an error; callers
/// that want cleanup to be best-effort must check first.
#[derive(Debug)]
pub struct SnapshotMetadataStore {
    inner: TypedStore<SnapshotMetadata>,
}

impl SnapshotMetadataStore {
    /// Create a store rooted at [`SNAPSHOT_STORE_FOLDER`].
    pub async fn new(store: Arc<dyn CoordinationStore>, backoff_config: BackoffConfig) -> Self {
        Self {
            inner: TypedStore::new(store, SNAPSHOT_STORE_FOLDER, backoff_config).await,
        }
    }

    /// Publish a snapshot.
    pub async fn create(&self, snapshot: &SnapshotMetadata) -> Result<()> {
        self.inner.create(snapshot).await
    }

    /// Fetch a snapshot by name.
    pub async fn get(&self, name: &str) -> Result<SnapshotMetadata> {
        self.inner.get(name).await
    }

    /// Remove a snapshot. Errors if the snapshot does not exist.
    pub async fn delete(&self, name: &str) -> Result<()> {
        self.inner.delete(name).await
    }

    /// Point-in-time view of the cached snapshot list.
    ///
    /// Eventually consistent; empty while the coordination session is down.
    pub fn list_cached(&self) -> Vec<SnapshotMetadata> {
        self.inner.list_cached()
    }

    /// Whether the cache is currently frozen due to session loss.
    pub fn is_cache_stale(&self) -> bool {
        self.inner.is_cache_stale()
    }
}
