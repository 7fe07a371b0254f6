//! Allocation of new live chunks.

use crate::chunk::{IndexSnafu, ReadWriteChunk, Result};
use crate::{IndexError, LogIndexer};
use logdb_time::TimeProvider;
use metadata_store::SearchMetadataStore;
use snafu::ResultExt;
use std::fmt::Debug;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Creates the index behind a new chunk.
pub trait IndexerFactory: Debug + Send + Sync {
    /// Build a fresh, empty index for the chunk called `chunk_id`.
    fn create(&self, chunk_id: &str) -> Result<Arc<dyn LogIndexer>, IndexError>;
}

/// Builds new writable chunks bound to a partition and this process'
/// metadata stores.
#[derive(Debug)]
pub struct ChunkFactory {
    name_prefix: String,
    counter: AtomicU64,
    indexer_factory: Arc<dyn IndexerFactory>,
    search_metadata_store: Arc<SearchMetadataStore>,
    query_url: String,
    time_provider: Arc<dyn TimeProvider>,
}

impl ChunkFactory {
    /// Create a factory naming chunks `<name_prefix>_<partition>_<n>`.
    pub fn new(
        name_prefix: impl Into<String>,
        indexer_factory: Arc<dyn IndexerFactory>,
        search_metadata_store: Arc<SearchMetadataStore>,
        query_url: impl Into<String>,
        time_provider: Arc<dyn TimeProvider>,
    ) -> Self {
        Self {
            name_prefix: name_prefix.into(),
            counter: AtomicU64::new(0),
            indexer_factory,
            search_metadata_store,
            query_url: query_url.into(),
            time_provider,
        }
    }

    /// Allocate a new live chunk for `partition_id`.
    pub fn make_chunk(&self, partition_id: &str) -> Result<Arc<ReadWriteChunk>> {
        let sequence = self.counter.fetch_add(1, Ordering::Relaxed);
        let chunk_id = format!("{}_{partition_id}_{sequence}", self.name_prefix);

        let indexer = self
            .indexer_factory
            .create(&chunk_id)
            .context(IndexSnafu {
                chunk_id: chunk_id.clone(),
            })?;

        Ok(Arc::new(ReadWriteChunk::new(
            chunk_id,
            partition_id,
            indexer,
            Arc::clone(&self.search_metadata_store),
            self.query_url.clone(),
            Arc::clone(&self.time_provider),
        )))
    }
}
