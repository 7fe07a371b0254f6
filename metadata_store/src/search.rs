//! Store for [`SearchMetadata`] registrations.

use crate::core::TypedStore;
use crate::interface::CoordinationStore;
use crate::Result;
use backoff::BackoffConfig;
use data_types::SearchMetadata;
use std::sync::Arc;

/// Folder holding one node per queryable chunk endpoint.
pub const SEARCH_STORE_FOLDER: &str = "/search";

/// Access to the chunk query-endpoint registrations.
///
/// Registrations are mutable while a chunk is live (its address can move)
/// and removed when the chunk closes. Removal is idempotent: a chunk may be
/// unregistered both by its rollover and by shutdown.
#[derive(Debug)]
pub struct SearchMetadataStore {
    inner: TypedStore<SearchMetadata>,
}

impl SearchMetadataStore {
    /// Create a store rooted at [`SEARCH_STORE_FOLDER`].
    pub async fn new(store: Arc<dyn CoordinationStore>, backoff_config: BackoffConfig) -> Self {
        Self {
            inner: TypedStore::new(store, SEARCH_STORE_FOLDER, backoff_config).await,
        }
    }

    /// Register a queryable chunk endpoint.
    pub async fn create(&self, search: &SearchMetadata) -> Result<()> {
        self.inner.create(search).await
    }

    /// Fetch a registration by name.
    pub async fn get(&self, name: &str) -> Result<SearchMetadata> {
        self.inner.get(name).await
    }

    /// Re-advertise an existing registration, e.g. after an address change.
    pub async fn update(&self, search: &SearchMetadata) -> Result<()> {
        self.inner.update(search, None).await.map(|_| ())
    }

    /// Remove a registration. A no-op when it is already gone.
    pub async fn delete(&self, name: &str) -> Result<()> {
        self.inner.delete_idempotent(name).await
    }

    /// Point-in-time view of the cached registrations.
    pub fn list_cached(&self) -> Vec<SearchMetadata> {
        self.inner.list_cached()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mem::MemCoordinationStore;
    use crate::Error;
    use assert_matches::assert_matches;

    async fn store() -> SearchMetadataStore {
        let mem: Arc<dyn CoordinationStore> = Arc::new(MemCoordinationStore::new());
        SearchMetadataStore::new(mem, BackoffConfig::default()).await
    }

    #[tokio::test]
    async fn register_update_unregister() {
        let search = store().await;

        let mut registration = SearchMetadata::new("chunk_0_1", "chunk_0_1", "http://n1:8080");
        search.create(&registration).await.unwrap();

        registration.url = "http://n2:8080".to_string();
        search.update(&registration).await.unwrap();
        assert_eq!(
            search.get("chunk_0_1").await.unwrap().url,
            "http://n2:8080"
        );

        search.delete("chunk_0_1").await.unwrap();
        assert_matches!(search.get("chunk_0_1").await, Err(Error::NotFound { .. }));

        // removing again is fine
        search.delete("chunk_0_1").await.unwrap();
    }

    #[tokio::test]
    async fn update_requires_existing_registration() {
        let search = store().await;
        let registration = SearchMetadata::new("chunk_0_1", "chunk_0_1", "http://n1:8080");
        assert_matches!(
            search.update(&registration).await,
            Err(Error::NotFound { .. })
        );
    }
}
