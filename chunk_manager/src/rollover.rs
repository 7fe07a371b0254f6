//! Rollover: sealing, uploading and publishing a chunk.

use crate::chunk::{ChunkError, ReadWriteChunk, Result};
use metadata_store::SnapshotMetadataStore;
use object_store::ObjectStore;
use observability_deps::tracing::info;
use std::fmt::Debug;
use std::sync::Arc;

/// Decides when the live chunk should be rolled over.
pub trait ChunkRollOverStrategy: Debug + Send + Sync {
    /// Called after every indexed message with the live totals.
    fn should_roll_over(&self, bytes_indexed: u64, messages_indexed: u64) -> bool;
}

/// Roll over once either threshold is crossed.
#[derive(Debug, Clone, Copy)]
pub struct SizeOrCountBasedRolloverStrategy {
    max_bytes_per_chunk: u64,
    max_messages_per_chunk: u64,
}

impl SizeOrCountBasedRolloverStrategy {
    /// Create a strategy. Both thresholds must be positive.
    pub fn new(max_bytes_per_chunk: u64, max_messages_per_chunk: u64) -> Self {
        assert!(max_bytes_per_chunk > 0, "max_bytes_per_chunk must be > 0");
        assert!(
            max_messages_per_chunk > 0,
            "max_messages_per_chunk must be > 0"
        );
        Self {
            max_bytes_per_chunk,
            max_messages_per_chunk,
        }
    }
}

impl ChunkRollOverStrategy for SizeOrCountBasedRolloverStrategy {
    fn should_roll_over(&self, bytes_indexed: u64, messages_indexed: u64) -> bool {
        bytes_indexed >= self.max_bytes_per_chunk
            || messages_indexed >= self.max_messages_per_chunk
    }
}

/// Never rolls over on its own; useful when rollover is driven externally
/// (and in tests).
#[derive(Debug, Clone, Copy, Default)]
pub struct NeverRolloverStrategy;

impl ChunkRollOverStrategy for NeverRolloverStrategy {
    fn should_roll_over(&self, _bytes_indexed: u64, _messages_indexed: u64) -> bool {
        false
    }
}

/// Seal `chunk`, upload its files, publish the snapshot, and withdraw the
/// live query registration.
///
/// Snapshot publication happens strictly after every file is durable in
/// object storage. The snapshot id equals the chunk id, so republishing an
/// already-published chunk is treated as success.
pub(crate) async fn roll_over_chunk(
    chunk: &Arc<ReadWriteChunk>,
    object_store: &Arc<dyn ObjectStore>,
    chunk_data_prefix: &str,
    snapshot_store: &Arc<SnapshotMetadataStore>,
) -> Result<()> {
    let chunk_id = chunk.id();

    let files = chunk.seal()?;
    let snapshot = chunk.upload(object_store, chunk_data_prefix, &files).await?;

    match snapshot_store.create(&snapshot).await {
        Ok(()) => {}
        Err(metadata_store::Error::AlreadyExists { .. }) => {
            info!(chunk_id=%chunk_id, "snapshot already published");
        }
        Err(e) => {
            return Err(ChunkError::Metadata {
                chunk_id,
                source: e,
            })
        }
    }

    chunk.mark_uploaded()?;
    chunk.unregister_search_metadata().await?;

    info!(
        chunk_id=%chunk_id,
        snapshot_path=%snapshot.snapshot_path(),
        messages=snapshot.max_offset(),
        "chunk rolled over",
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::TestIndexer;
    use crate::LogIndexer;
    use backoff::BackoffConfig;
    use data_types::{ChunkState, LogMessage};
    use logdb_time::{MockProvider, Time, TimeProvider};
    use metadata_store::interface::CoordinationStore;
    use metadata_store::mem::MemCoordinationStore;
    use metadata_store::SearchMetadataStore;
    use object_store::memory::InMemory;
    use serde_json::json;

    #[test]
    fn threshold_strategy_fires_on_either_limit() {
        let strategy = SizeOrCountBasedRolloverStrategy::new(1000, 10);

        assert!(!strategy.should_roll_over(999, 9));
        assert!(strategy.should_roll_over(1000, 1));
        assert!(strategy.should_roll_over(1, 10));
        assert!(strategy.should_roll_over(1000, 10));
    }

    #[test]
    fn never_strategy_never_fires() {
        let strategy = NeverRolloverStrategy;
        assert!(!strategy.should_roll_over(u64::MAX, u64::MAX));
    }

    #[tokio::test]
    async fn republishing_a_sealed_chunk_is_idempotent() {
        let mem: Arc<dyn CoordinationStore> = Arc::new(MemCoordinationStore::new());
        let search_store = Arc::new(
            SearchMetadataStore::new(Arc::clone(&mem), BackoffConfig::default()).await,
        );
        let snapshot_store = Arc::new(
            metadata_store::SnapshotMetadataStore::new(mem, BackoffConfig::default()).await,
        );
        let object_store: Arc<dyn ObjectStore> = Arc::new(InMemory::new());
        let dir = tempfile::tempdir().unwrap();
        let indexer = Arc::new(TestIndexer::new(dir.path().to_path_buf()));
        let time: Arc<dyn TimeProvider> =
            Arc::new(MockProvider::new(Time::from_timestamp_millis(1_000)));

        let chunk = Arc::new(crate::ReadWriteChunk::new(
            "log_0_0",
            "0",
            indexer as Arc<dyn LogIndexer>,
            search_store,
            "http://indexer-1:8080",
            time,
        ));
        chunk.post_create().await.unwrap();
        chunk
            .add_message(&LogMessage::new("a", 500, json!({})), 10, 3)
            .unwrap();

        roll_over_chunk(&chunk, &object_store, "chunks", &snapshot_store)
            .await
            .unwrap();
        let first = snapshot_store.get("log_0_0").await.unwrap();

        // a second pass over the same sealed chunk publishes nothing new
        roll_over_chunk(&chunk, &object_store, "chunks", &snapshot_store)
            .await
            .unwrap();
        let second = snapshot_store.get("log_0_0").await.unwrap();

        assert_eq!(first, second);
        assert_eq!(chunk.state(), ChunkState::Uploaded);
    }
}
