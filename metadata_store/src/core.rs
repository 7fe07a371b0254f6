//! The typed layer shared by every entity store.

use crate::cache::NodeCache;
use crate::interface::{CoordinationStore, StoreError};
use crate::{Error, MetadataNode, Result, SerializationSnafu};
use backoff::{Backoff, BackoffConfig};
use observability_deps::tracing::error;
use snafu::ResultExt;
use std::ops::ControlFlow;
use std::sync::Arc;

/// Binds one entity type to a store folder, the JSON codec and a
/// watcher-backed cache.
///
/// All operations are `pub(crate)`: the entity stores wrap this and expose
/// only the subset that is legal for their type, so an illegal operation
/// (say, updating a snapshot) does not compile.
#[derive(Debug)]
pub(crate) struct TypedStore<T> {
    store: Arc<dyn CoordinationStore>,
    store_folder: String,
    backoff_config: BackoffConfig,
    cache: NodeCache<T>,
}

impl<T: MetadataNode> TypedStore<T> {
    pub(crate) async fn new(
        store: Arc<dyn CoordinationStore>,
        store_folder: impl Into<String>,
        backoff_config: BackoffConfig,
    ) -> Self {
        let store_folder = store_folder.into().trim_end_matches('/').to_string();
        let cache = NodeCache::new(Arc::clone(&store), store_folder.clone()).await;
        Self {
            store,
            store_folder,
            backoff_config,
            cache,
        }
    }

    fn node_path(&self, name: &str) -> String {
        format!("{}/{}", self.store_folder, name)
    }

    /// Run `operation` against the coordination store, retrying transport
    /// failures with backoff until the configured deadline. All other
    /// errors are terminal.
    async fn with_retries<B, F, Fut>(&self, task_name: &str, mut operation: F) -> Result<B>
    where
        B: Send,
        F: FnMut() -> Fut + Send,
        Fut: std::future::Future<Output = Result<B, StoreError>> + Send,
    {
        Backoff::new(&self.backoff_config)
            .retry_with_deadline(task_name, move || {
                let fut = operation();
                async move {
                    match fut.await {
                        Err(e @ StoreError::Unavailable { .. }) => ControlFlow::Continue(e),
                        other => ControlFlow::Break(other),
                    }
                }
            })
            .await
            .map_err(Error::from_store)
    }

    pub(crate) async fn create(&self, entity: &T) -> Result<()> {
        let path = self.node_path(entity.node_name());
        let payload = serde_json::to_string(entity)
            .context(SerializationSnafu)?
            .into_bytes();

        self.with_retries("metadata create", || {
            let path = path.clone();
            let payload = payload.clone();
            async move { self.store.create(&path, payload).await }
        })
        .await
    }

    pub(crate) async fn get(&self, name: &str) -> Result<T> {
        self.get_with_version(name).await.map(|(entity, _)| entity)
    }

    pub(crate) async fn get_with_version(&self, name: &str) -> Result<(T, u64)> {
        let path = self.node_path(name);
        let value = self
            .with_retries("metadata get", || {
                let path = path.clone();
                async move { self.store.get(&path).await }
            })
            .await?;

        match serde_json::from_slice::<T>(&value.data) {
            Ok(entity) => Ok((entity, value.version)),
            Err(e) => {
                error!(
                    path=%path,
                    payload=%String::from_utf8_lossy(&value.data),
                    e=%e,
                    "undecodable metadata node",
                );
                Err(Error::Corrupt { path, source: e })
            }
        }
    }

    pub(crate) async fn update(&self, entity: &T, expected_version: Option<u64>) -> Result<u64> {
        let path = self.node_path(entity.node_name());
        let payload = serde_json::to_string(entity)
            .context(SerializationSnafu)?
            .into_bytes();

        self.with_retries("metadata update", || {
            let path = path.clone();
            let payload = payload.clone();
            async move { self.store.update(&path, payload, expected_version).await }
        })
        .await
    }

    pub(crate) async fn delete(&self, name: &str) -> Result<()> {
        let path = self.node_path(name);
        self.with_retries("metadata delete", || {
            let path = path.clone();
            async move { self.store.delete(&path).await }
        })
        .await
    }

    pub(crate) async fn delete_idempotent(&self, name: &str) -> Result<()> {
        match self.delete(name).await {
            Ok(()) | Err(Error::NotFound { .. }) => Ok(()),
            Err(e) => Err(e),
        }
    }

    pub(crate) fn list_cached(&self) -> Vec<T> {
        self.cache.list()
    }

    pub(crate) fn is_cache_stale(&self) -> bool {
        self.cache.is_stale()
    }
}
