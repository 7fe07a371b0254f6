//! A chunk: the unit of indexed log data.
//!
//! A chunk owns a local inverted index (behind the [`LogIndexer`] seam),
//! bookkeeping about what it holds, and its query-endpoint registration.
//! It starts `Live`, is sealed to `ReadOnly` at rollover, becomes
//! `Uploaded` once its files and snapshot are durable, and ends `Closed`
//! when local resources are released.

use crate::{IndexError, LogIndexer};
use bytes::Bytes;
use data_types::{ChunkInfo, ChunkState, LogMessage, SearchMetadata, SnapshotMetadata};
use logdb_time::TimeProvider;
use metadata_store::SearchMetadataStore;
use object_store::{path::Path as ObjectStorePath, ObjectStore};
use parking_lot::RwLock;
use snafu::{ensure, OptionExt, ResultExt, Snafu};
use std::path::PathBuf;
use std::sync::Arc;

/// Errors raised by chunk operations.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
#[allow(missing_docs)]
pub enum ChunkError {
    #[snafu(display("chunk {chunk_id} is {actual}, operation requires {expected}"))]
    WrongState {
        chunk_id: String,
        expected: ChunkState,
        actual: ChunkState,
    },

    #[snafu(display("illegal chunk state transition for {chunk_id}: {from} -> {to}"))]
    IllegalTransition {
        chunk_id: String,
        from: ChunkState,
        to: ChunkState,
    },

    #[snafu(display("chunk {chunk_id} holds no messages, nothing to snapshot"))]
    EmptyChunk { chunk_id: String },

    #[snafu(display("index operation failed for chunk {chunk_id}: {source}"))]
    Index {
        chunk_id: String,
        source: IndexError,
    },

    #[snafu(display("index file has no usable name: {path}"))]
    InvalidIndexFileName { path: String },

    #[snafu(display("failed to read local index file {path}: {source}"))]
    ReadIndexFile {
        path: String,
        source: std::io::Error,
    },

    #[snafu(display("object store upload failed for chunk {chunk_id}: {source}"))]
    Upload {
        chunk_id: String,
        source: object_store::Error,
    },

    #[snafu(display("metadata operation failed for chunk {chunk_id}: {source}"))]
    Metadata {
        chunk_id: String,
        source: metadata_store::Error,
    },

    #[snafu(display("snapshot for chunk {chunk_id} failed validation: {source}"))]
    Snapshot {
        chunk_id: String,
        source: data_types::Error,
    },
}

/// Result with [`ChunkError`].
pub type Result<T, E = ChunkError> = std::result::Result<T, E>;

/// A chunk bound to one partition, writable while `Live`.
///
/// The write path is thread-safe; lifecycle transitions are expected to be
/// driven by a single owner (the chunk manager).
#[derive(Debug)]
pub struct ReadWriteChunk {
    info: RwLock<ChunkInfo>,
    state: RwLock<ChunkState>,
    indexer: Arc<dyn LogIndexer>,
    search_metadata_store: Arc<SearchMetadataStore>,
    query_url: String,
    time_provider: Arc<dyn TimeProvider>,
}

impl ReadWriteChunk {
    /// Open a new live chunk.
    pub fn new(
        chunk_id: impl Into<String>,
        partition_id: impl Into<String>,
        indexer: Arc<dyn LogIndexer>,
        search_metadata_store: Arc<SearchMetadataStore>,
        query_url: impl Into<String>,
        time_provider: Arc<dyn TimeProvider>,
    ) -> Self {
        let now_ms = time_provider.now().timestamp_millis();
        Self {
            info: RwLock::new(ChunkInfo::new(chunk_id, partition_id, now_ms)),
            state: RwLock::new(ChunkState::Live),
            indexer,
            search_metadata_store,
            query_url: query_url.into(),
            time_provider,
        }
    }

    /// The chunk id; doubles as the snapshot id after rollover.
    pub fn id(&self) -> String {
        self.info.read().chunk_id.clone()
    }

    /// Snapshot of the chunk's bookkeeping.
    pub fn info(&self) -> ChunkInfo {
        self.info.read().clone()
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ChunkState {
        *self.state.read()
    }

    /// Advertise this chunk as queryable at the configured address.
    pub async fn post_create(&self) -> Result<()> {
        let chunk_id = self.id();
        let registration =
            SearchMetadata::new(chunk_id.clone(), chunk_id.clone(), self.query_url.clone());
        self.search_metadata_store
            .create(&registration)
            .await
            .context(MetadataSnafu { chunk_id })
    }

    /// Index one message. Only legal while `Live`.
    pub fn add_message(&self, message: &LogMessage, size_bytes: u64, offset: i64) -> Result<()> {
        let state = self.state();
        ensure!(
            state == ChunkState::Live,
            WrongStateSnafu {
                chunk_id: self.id(),
                expected: ChunkState::Live,
                actual: state,
            }
        );

        self.indexer
            .add_document(message)
            .context(IndexSnafu { chunk_id: self.id() })?;

        let now_ms = self.time_provider.now().timestamp_millis();
        self.info.write().update_for_message(
            now_ms,
            message.timestamp_epoch_ms,
            offset,
            size_bytes,
        );
        Ok(())
    }

    /// Stamp the last-updated time, e.g. when the chunk is handed to the
    /// rollover queue.
    pub fn stamp_last_updated(&self) {
        let now_ms = self.time_provider.now().timestamp_millis();
        self.info.write().chunk_last_updated_time_epoch_ms = now_ms;
    }

    /// Seal the chunk: no further writes, index flushed to local files.
    ///
    /// Idempotent on an already-sealed or already-uploaded chunk so that a
    /// republish of the same chunk reproduces the same file set.
    pub fn seal(&self) -> Result<Vec<PathBuf>> {
        match self.state() {
            ChunkState::Live => {
                self.transition(ChunkState::ReadOnly)?;
                let now_ms = self.time_provider.now().timestamp_millis();
                let mut info = self.info.write();
                info.chunk_snapshot_time_epoch_ms = now_ms;
                info.chunk_last_updated_time_epoch_ms = now_ms;
            }
            ChunkState::ReadOnly | ChunkState::Uploaded => {}
            actual => {
                return WrongStateSnafu {
                    chunk_id: self.id(),
                    expected: ChunkState::Live,
                    actual,
                }
                .fail()
            }
        }

        self.indexer
            .commit()
            .context(IndexSnafu { chunk_id: self.id() })?;
        self.indexer
            .seal()
            .context(IndexSnafu { chunk_id: self.id() })
    }

    /// Upload the sealed files under `<chunk_data_prefix>/<chunk_id>/` and
    /// build the snapshot record describing them.
    pub async fn upload(
        &self,
        object_store: &Arc<dyn ObjectStore>,
        chunk_data_prefix: &str,
        files: &[PathBuf],
    ) -> Result<SnapshotMetadata> {
        let info = self.info();
        let chunk_id = info.chunk_id.clone();

        let state = self.state();
        ensure!(
            state == ChunkState::ReadOnly || state == ChunkState::Uploaded,
            WrongStateSnafu {
                chunk_id: chunk_id.clone(),
                expected: ChunkState::ReadOnly,
                actual: state,
            }
        );
        ensure!(
            info.num_messages > 0,
            EmptyChunkSnafu {
                chunk_id: chunk_id.clone(),
            }
        );

        for file in files {
            let file_name = file
                .file_name()
                .and_then(|name| name.to_str())
                .context(InvalidIndexFileNameSnafu {
                    path: file.display().to_string(),
                })?;
            let data = tokio::fs::read(file).await.context(ReadIndexFileSnafu {
                path: file.display().to_string(),
            })?;
            let location =
                ObjectStorePath::from(format!("{chunk_data_prefix}/{chunk_id}/{file_name}"));
            object_store
                .put(&location, Bytes::from(data))
                .await
                .context(UploadSnafu {
                    chunk_id: chunk_id.clone(),
                })?;
        }

        let snapshot_path = format!("{chunk_data_prefix}/{chunk_id}");
        SnapshotMetadata::new(
            chunk_id.clone(),
            snapshot_path,
            info.data_start_time_epoch_ms,
            info.data_end_time_epoch_ms,
            info.partition_id.clone(),
            info.max_offset,
        )
        .context(SnapshotSnafu { chunk_id })
    }

    /// Mark the chunk durable. Idempotent.
    pub fn mark_uploaded(&self) -> Result<()> {
        if self.state() == ChunkState::Uploaded {
            return Ok(());
        }
        self.transition(ChunkState::Uploaded)
    }

    /// Withdraw the query-endpoint registration. A no-op when it is
    /// already gone.
    pub async fn unregister_search_metadata(&self) -> Result<()> {
        let chunk_id = self.id();
        self.search_metadata_store
            .delete(&chunk_id)
            .await
            .context(MetadataSnafu { chunk_id })
    }

    /// Release local resources and withdraw the registration.
    pub async fn close(&self) -> Result<()> {
        self.transition(ChunkState::Closed)?;
        self.unregister_search_metadata().await?;
        self.indexer
            .close()
            .context(IndexSnafu { chunk_id: self.id() })
    }

    fn transition(&self, to: ChunkState) -> Result<()> {
        let mut state = self.state.write();
        ensure!(
            state.can_transition_to(to),
            IllegalTransitionSnafu {
                chunk_id: self.info.read().chunk_id.clone(),
                from: *state,
                to,
            }
        );
        *state = to;
        Ok(())
    }
}
