//! The chunk manager state machine.

use crate::chunk::{ChunkError, ReadWriteChunk};
use crate::factory::ChunkFactory;
use crate::rollover::{roll_over_chunk, ChunkRollOverStrategy};
use data_types::LogMessage;
use metadata_store::SnapshotMetadataStore;
use metric::{Registry, U64Counter, U64Gauge};
use object_store::ObjectStore;
use observability_deps::tracing::{error, info, warn};
use snafu::{ensure, ResultExt, Snafu};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// How long [`ChunkManager::wait_for_rollovers`] waits for in-flight
/// rollovers to drain.
pub const DEFAULT_DRAIN_DEADLINE: Duration = Duration::from_secs(600);

/// Errors raised by the [`ChunkManager`].
#[derive(Debug, Snafu)]
#[allow(missing_docs)]
pub enum Error {
    /// The manager is read-only, or a previous rollover failed and
    /// durability can no longer be guaranteed. The upstream consumer must
    /// re-dispatch from the last committed offset.
    #[snafu(display("ingestion stopped: manager is read-only or a rollover failed"))]
    IngestionStopped,

    /// Strict mode admits one rollover at a time. The write is refused
    /// before it reaches the index, so the caller can redeliver the same
    /// offset later without indexing it twice.
    #[snafu(display("a rollover is already in flight, refusing write to chunk {chunk_id}"))]
    RolloverInProgress { chunk_id: String },

    /// The rollover worker is gone; no further rollovers can be submitted.
    #[snafu(display("rollover worker is shut down"))]
    WorkerShutDown,

    #[snafu(display("chunk operation failed: {source}"))]
    Chunk { source: ChunkError },
}

/// Result with this module's [`Error`].
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// How rollover submissions behave while one is already running.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RolloverMode {
    /// One rollover in flight at a time; a second submission is an error.
    /// Used by the steady-state indexer, where a backed-up upload means
    /// something is wrong.
    Strict,
    /// Rollovers queue on the single-threaded worker. Used during
    /// recovery, where many chunks can be ready for upload at once.
    Queued,
}

/// Configuration for a [`ChunkManager`].
#[derive(Debug, Clone)]
pub struct ChunkManagerConfig {
    /// Object-storage prefix chunk files are uploaded under.
    pub chunk_data_prefix: String,
    /// Rollover admission behavior.
    pub rollover_mode: RolloverMode,
    /// Deadline for draining rollovers at shutdown.
    pub drain_deadline: Duration,
}

impl ChunkManagerConfig {
    /// Config with the default drain deadline.
    pub fn new(chunk_data_prefix: impl Into<String>, rollover_mode: RolloverMode) -> Self {
        Self {
            chunk_data_prefix: chunk_data_prefix.into(),
            rollover_mode,
            drain_deadline: DEFAULT_DRAIN_DEADLINE,
        }
    }
}

#[derive(Debug, Default)]
struct ManagerState {
    chunks: Vec<Arc<ReadWriteChunk>>,
    active: Option<Arc<ReadWriteChunk>>,
}

/// Owns the chunks of one indexer process.
///
/// Exactly one chunk is live at any time; the live-chunk reference and the
/// rollover transition form the critical section guarded by the internal
/// state lock. Rollover work itself runs on a dedicated worker task so the
/// write path never blocks on uploads.
#[derive(Debug)]
pub struct ChunkManager {
    config: ChunkManagerConfig,
    factory: Arc<ChunkFactory>,
    strategy: Arc<dyn ChunkRollOverStrategy>,

    state: tokio::sync::Mutex<ManagerState>,
    read_only: AtomicBool,
    rollover_failed: Arc<AtomicBool>,
    rollovers_in_flight: Arc<AtomicUsize>,

    rollover_tx: parking_lot::Mutex<Option<mpsc::UnboundedSender<Arc<ReadWriteChunk>>>>,
    worker: parking_lot::Mutex<Option<JoinHandle<()>>>,

    live_messages_indexed: U64Gauge,
    live_bytes_indexed: U64Gauge,
}

impl ChunkManager {
    /// Create a manager and start its rollover worker.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(
        config: ChunkManagerConfig,
        factory: Arc<ChunkFactory>,
        strategy: Arc<dyn ChunkRollOverStrategy>,
        object_store: Arc<dyn ObjectStore>,
        snapshot_store: Arc<SnapshotMetadataStore>,
        metric_registry: &Registry,
    ) -> Self {
        let live_messages_indexed = metric_registry
            .register_metric::<U64Gauge>(
                "live_messages_indexed",
                "messages indexed into the current live chunk",
            )
            .recorder(metric::Attributes::default());
        let live_bytes_indexed = metric_registry
            .register_metric::<U64Gauge>(
                "live_bytes_indexed",
                "bytes indexed into the current live chunk",
            )
            .recorder(metric::Attributes::default());

        let rollover_count = metric_registry.register_metric::<U64Counter>(
            "chunk_rollover_count",
            "completed chunk rollovers by outcome",
        );
        let rollovers_completed = rollover_count.recorder(&[("outcome", "success")]);
        let rollovers_failed = rollover_count.recorder(&[("outcome", "failure")]);

        let rollover_failed = Arc::new(AtomicBool::new(false));
        let rollovers_in_flight = Arc::new(AtomicUsize::new(0));

        let (rollover_tx, rollover_rx) = mpsc::unbounded_channel();
        let worker = tokio::task::spawn(rollover_worker(
            rollover_rx,
            object_store,
            config.chunk_data_prefix.clone(),
            snapshot_store,
            Arc::clone(&rollover_failed),
            Arc::clone(&rollovers_in_flight),
            rollovers_completed,
            rollovers_failed,
        ));

        Self {
            config,
            factory,
            strategy,
            state: Default::default(),
            read_only: AtomicBool::new(false),
            rollover_failed,
            rollovers_in_flight,
            rollover_tx: parking_lot::Mutex::new(Some(rollover_tx)),
            worker: parking_lot::Mutex::new(Some(worker)),
            live_messages_indexed,
            live_bytes_indexed,
        }
    }

    /// Index one message, allocating a fresh live chunk if none exists and
    /// rolling over afterwards if the strategy fires.
    pub async fn add_message(
        &self,
        message: &LogMessage,
        size_bytes: u64,
        partition_id: &str,
        offset: i64,
    ) -> Result<()> {
        ensure!(
            !self.read_only.load(Ordering::Acquire)
                && !self.rollover_failed.load(Ordering::Acquire),
            IngestionStoppedSnafu
        );

        let mut state = self.state.lock().await;

        let active = match state.active.as_ref() {
            Some(chunk) => Arc::clone(chunk),
            None => {
                let chunk = self.factory.make_chunk(partition_id).context(ChunkSnafu)?;
                chunk.post_create().await.context(ChunkSnafu)?;
                info!(chunk_id=%chunk.id(), partition_id, "opened new live chunk");
                state.chunks.push(Arc::clone(&chunk));
                state.active = Some(Arc::clone(&chunk));
                chunk
            }
        };

        // In strict mode a write that would trigger a rollover while one is
        // still in flight is refused up front, before it reaches the index:
        // the offset stays unindexed and can be redelivered. In-flight
        // rollovers only ever start under the state lock held here, so the
        // count cannot rise between this check and the submission below.
        if self.config.rollover_mode == RolloverMode::Strict
            && self.rollovers_in_flight.load(Ordering::Acquire) > 0
            && self.strategy.should_roll_over(
                self.live_bytes_indexed.fetch() + size_bytes,
                self.live_messages_indexed.fetch() + 1,
            )
        {
            return RolloverInProgressSnafu {
                chunk_id: active.id(),
            }
            .fail();
        }

        active
            .add_message(message, size_bytes, offset)
            .context(ChunkSnafu)?;
        self.live_messages_indexed.inc(1);
        self.live_bytes_indexed.inc(size_bytes);

        if self.strategy.should_roll_over(
            self.live_bytes_indexed.fetch(),
            self.live_messages_indexed.fetch(),
        ) {
            self.roll_over_active(&mut state, active)?;
        }

        Ok(())
    }

    /// Hand the given chunk to the rollover worker and clear the live slot.
    fn roll_over_active(&self, state: &mut ManagerState, chunk: Arc<ReadWriteChunk>) -> Result<()> {
        state.active = None;
        self.live_messages_indexed.set(0);
        self.live_bytes_indexed.set(0);
        chunk.stamp_last_updated();

        self.rollovers_in_flight.fetch_add(1, Ordering::AcqRel);
        let sent = self
            .rollover_tx
            .lock()
            .as_ref()
            .map(|tx| tx.send(Arc::clone(&chunk)).is_ok())
            .unwrap_or(false);
        if !sent {
            self.rollovers_in_flight.fetch_sub(1, Ordering::AcqRel);
            return WorkerShutDownSnafu.fail();
        }

        info!(chunk_id=%chunk.id(), "submitted chunk for rollover");
        Ok(())
    }

    /// Stop accepting writes, roll over the live chunk if any, and wait for
    /// all submitted rollovers to finish.
    ///
    /// Returns `true` iff every rollover succeeded within the drain
    /// deadline.
    pub async fn wait_for_rollovers(&self) -> bool {
        self.read_only.store(true, Ordering::Release);

        {
            let mut state = self.state.lock().await;
            if let Some(active) = state.active.as_ref().map(Arc::clone) {
                if active.info().num_messages == 0 {
                    // a chunk that never indexed anything has nothing to
                    // publish; it is released by shut_down
                    state.active = None;
                } else if let Err(e) = self.roll_over_active(&mut state, active) {
                    error!(e=%e, "failed to submit final rollover");
                    return false;
                }
            }
        }

        // closing the channel lets the worker drain the queue and exit
        *self.rollover_tx.lock() = None;

        let worker = self.worker.lock().take();
        if let Some(worker) = worker {
            match tokio::time::timeout(self.config.drain_deadline, worker).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    error!(e=%e, "rollover worker panicked");
                    return false;
                }
                Err(_) => {
                    error!(
                        deadline=?self.config.drain_deadline,
                        "timed out waiting for rollovers to drain",
                    );
                    return false;
                }
            }
        }

        !self.rollover_failed.load(Ordering::Acquire)
    }

    /// Close every chunk best-effort. Errors are logged, never returned, so
    /// a partial failure does not leak the remaining chunks.
    pub async fn shut_down(&self) {
        self.read_only.store(true, Ordering::Release);
        let state = self.state.lock().await;
        for chunk in &state.chunks {
            if let Err(e) = chunk.close().await {
                warn!(chunk_id=%chunk.id(), e=%e, "failed to close chunk");
            }
        }
    }

    /// Whether a rollover has failed; latched until restart.
    pub fn has_rollover_failed(&self) -> bool {
        self.rollover_failed.load(Ordering::Acquire)
    }

    /// Number of rollovers currently submitted but not finished.
    pub fn rollovers_in_flight(&self) -> usize {
        self.rollovers_in_flight.load(Ordering::Acquire)
    }

    /// The current live chunk, if one exists.
    pub async fn active_chunk(&self) -> Option<Arc<ReadWriteChunk>> {
        self.state.lock().await.active.as_ref().map(Arc::clone)
    }

    /// Every chunk this manager has opened, in creation order.
    pub async fn chunk_list(&self) -> Vec<Arc<ReadWriteChunk>> {
        self.state.lock().await.chunks.iter().map(Arc::clone).collect()
    }
}

/// Drains the rollover queue one chunk at a time. Uploads are the
/// bottleneck, so a single worker is deliberate; admission control happens
/// at submission time via [`RolloverMode`].
#[allow(clippy::too_many_arguments)]
async fn rollover_worker(
    mut rollover_rx: mpsc::UnboundedReceiver<Arc<ReadWriteChunk>>,
    object_store: Arc<dyn ObjectStore>,
    chunk_data_prefix: String,
    snapshot_store: Arc<SnapshotMetadataStore>,
    rollover_failed: Arc<AtomicBool>,
    rollovers_in_flight: Arc<AtomicUsize>,
    rollovers_completed: U64Counter,
    rollovers_failed: U64Counter,
) {
    while let Some(chunk) = rollover_rx.recv().await {
        let chunk_id = chunk.id();
        match roll_over_chunk(&chunk, &object_store, &chunk_data_prefix, &snapshot_store).await {
            Ok(()) => rollovers_completed.inc(1),
            Err(e) => {
                error!(chunk_id=%chunk_id, e=%e, "chunk rollover failed, stopping ingestion");
                rollovers_failed.inc(1);
                rollover_failed.store(true, Ordering::Release);
            }
        }
        rollovers_in_flight.fetch_sub(1, Ordering::AcqRel);
    }
}
