//! Shared data types for the logdb cluster: metadata entities stored in the
//! coordination service, chunk bookkeeping, and the records flowing through
//! the ingest path.
#![deny(rustdoc::broken_intra_doc_links, rustdoc::bare_urls, rust_2018_idioms)]
#![warn(
    missing_debug_implementations,
    missing_docs,
    clippy::explicit_iter_loop,
    clippy::use_self,
    clippy::clone_on_ref_ptr
)]

use serde::{Deserialize, Serialize};
use snafu::{ensure, Snafu};
use std::collections::BTreeMap;

/// Sentinel accepted by partition-assignment updates meaning "keep the
/// currently configured throughput".
pub const THROUGHPUT_UNCHANGED: i64 = -1;

/// Validation errors raised by entity constructors.
#[derive(Debug, Snafu)]
#[allow(missing_docs)]
pub enum Error {
    #[snafu(display("invalid time range: start {start} > end {end}"))]
    InvalidTimeRange { start: i64, end: i64 },

    #[snafu(display("partition id may not be empty"))]
    EmptyPartitionId,

    #[snafu(display("name may not be empty"))]
    EmptyName,

    #[snafu(display("max offset may not be negative, got {max_offset}"))]
    NegativeMaxOffset { max_offset: i64 },

    #[snafu(display("throughput may not be negative, got {throughput_bytes}"))]
    NegativeThroughput { throughput_bytes: i64 },
}

/// Result with this crate's [`Error`].
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Advertises a rolled-over chunk's object-storage location to the cluster.
///
/// Immutable once written: the only legal terminal operation is deletion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotMetadata {
    name: String,
    snapshot_id: String,
    snapshot_path: String,
    start_time_epoch_ms: i64,
    end_time_epoch_ms: i64,
    partition_id: String,
    max_offset: i64,
}

impl SnapshotMetadata {
    /// Create a validated snapshot record.
    ///
    /// The `name` is derived from the last path segment of
    /// `snapshot_path`.
    pub fn new(
        snapshot_id: impl Into<String>,
        snapshot_path: impl Into<String>,
        start_time_epoch_ms: i64,
        end_time_epoch_ms: i64,
        partition_id: impl Into<String>,
        max_offset: i64,
    ) -> Result<Self> {
        let snapshot_path = snapshot_path.into();
        let partition_id = partition_id.into();

        ensure!(
            start_time_epoch_ms <= end_time_epoch_ms,
            InvalidTimeRangeSnafu {
                start: start_time_epoch_ms,
                end: end_time_epoch_ms,
            }
        );
        ensure!(!partition_id.is_empty(), EmptyPartitionIdSnafu);
        ensure!(max_offset >= 0, NegativeMaxOffsetSnafu { max_offset });

        let name = snapshot_path
            .trim_end_matches('/')
            .rsplit('/')
            .next()
            .unwrap_or_default()
            .to_string();
        ensure!(!name.is_empty(), EmptyNameSnafu);

        Ok(Self {
            name,
            snapshot_id: snapshot_id.into(),
            snapshot_path,
            start_time_epoch_ms,
            end_time_epoch_ms,
            partition_id,
            max_offset,
        })
    }

    /// Node name, the last path segment of the storage path.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Globally unique snapshot id.
    pub fn snapshot_id(&self) -> &str {
        &self.snapshot_id
    }

    /// Object-storage URI of the uploaded chunk.
    pub fn snapshot_path(&self) -> &str {
        &self.snapshot_path
    }

    /// Timestamp of the earliest message in the chunk.
    pub fn start_time_epoch_ms(&self) -> i64 {
        self.start_time_epoch_ms
    }

    /// Timestamp of the latest message in the chunk.
    pub fn end_time_epoch_ms(&self) -> i64 {
        self.end_time_epoch_ms
    }

    /// The input-stream partition the chunk was built from.
    pub fn partition_id(&self) -> &str {
        &self.partition_id
    }

    /// Last consumed offset for the partition contained in the chunk.
    pub fn max_offset(&self) -> i64 {
        self.max_offset
    }
}

/// Advertises that a live or loaded chunk is queryable at a network address.
///
/// Mutable while the chunk is live; deleted when the chunk closes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchMetadata {
    /// Node name, unique per advertised chunk.
    pub name: String,
    /// Name of the snapshot (chunk) this endpoint serves.
    pub snapshot_name: String,
    /// Network address the chunk is queryable at.
    pub url: String,
}

impl SearchMetadata {
    /// Create a new search registration.
    pub fn new(
        name: impl Into<String>,
        snapshot_name: impl Into<String>,
        url: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            snapshot_name: snapshot_name.into(),
            url: url.into(),
        }
    }
}

/// Per-tenant provisioning record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceMetadata {
    /// Unique tenant name.
    pub name: String,
    /// Owning team or user.
    pub owner: String,
    /// Provisioned ingest budget in bytes per second.
    pub throughput_bytes: i64,
    /// Partitions assigned to this tenant, sorted and deduplicated.
    pub partition_ids: Vec<String>,
}

impl ServiceMetadata {
    /// Create a validated tenant record.
    pub fn new(
        name: impl Into<String>,
        owner: impl Into<String>,
        throughput_bytes: i64,
        partition_ids: Vec<String>,
    ) -> Result<Self> {
        let name = name.into();
        ensure!(!name.is_empty(), EmptyNameSnafu);
        ensure!(
            throughput_bytes >= 0,
            NegativeThroughputSnafu { throughput_bytes }
        );

        let mut metadata = Self {
            name,
            owner: owner.into(),
            throughput_bytes,
            partition_ids: vec![],
        };
        metadata.set_partition_ids(partition_ids);
        Ok(metadata)
    }

    /// Replace the partition assignment, keeping it sorted and unique.
    pub fn set_partition_ids(&mut self, mut partition_ids: Vec<String>) {
        partition_ids.sort();
        partition_ids.dedup();
        self.partition_ids = partition_ids;
    }
}

/// Lifecycle states of a chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChunkState {
    /// Accepting writes; at most one chunk per manager is in this state.
    Live,
    /// Sealed: index flushed, no further writes.
    ReadOnly,
    /// All files durable in object storage and the snapshot published.
    Uploaded,
    /// Local resources released.
    Closed,
}

impl ChunkState {
    /// Whether moving from `self` to `next` is a legal lifecycle step.
    pub fn can_transition_to(&self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Live, Self::ReadOnly)
                | (Self::ReadOnly, Self::Uploaded)
                | (Self::Live, Self::Closed)
                | (Self::ReadOnly, Self::Closed)
                | (Self::Uploaded, Self::Closed)
        )
    }
}

impl std::fmt::Display for ChunkState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Live => write!(f, "LIVE"),
            Self::ReadOnly => write!(f, "READ_ONLY"),
            Self::Uploaded => write!(f, "UPLOADED"),
            Self::Closed => write!(f, "CLOSED"),
        }
    }
}

/// Bookkeeping carried by every chunk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkInfo {
    /// Unique chunk id; doubles as the snapshot id once rolled over.
    pub chunk_id: String,
    /// The input-stream partition this chunk consumes.
    pub partition_id: String,
    /// When the chunk was created.
    pub chunk_creation_time_epoch_ms: i64,
    /// When the chunk last changed (write or lifecycle transition).
    pub chunk_last_updated_time_epoch_ms: i64,
    /// Earliest message timestamp indexed, `i64::MAX` until the first write.
    pub data_start_time_epoch_ms: i64,
    /// Latest message timestamp indexed, `0` until the first write.
    pub data_end_time_epoch_ms: i64,
    /// When the chunk was sealed for snapshotting, `0` while live.
    pub chunk_snapshot_time_epoch_ms: i64,
    /// Offset of the first message indexed, `-1` until the first write.
    pub first_offset: i64,
    /// Highest offset indexed so far, `-1` until the first write.
    pub max_offset: i64,
    /// Number of messages indexed. Monotonically non-decreasing.
    pub num_messages: u64,
    /// Estimated bytes indexed.
    pub size_bytes: u64,
}

impl ChunkInfo {
    /// Create bookkeeping for a freshly opened chunk.
    pub fn new(
        chunk_id: impl Into<String>,
        partition_id: impl Into<String>,
        created_at_epoch_ms: i64,
    ) -> Self {
        Self {
            chunk_id: chunk_id.into(),
            partition_id: partition_id.into(),
            chunk_creation_time_epoch_ms: created_at_epoch_ms,
            chunk_last_updated_time_epoch_ms: created_at_epoch_ms,
            data_start_time_epoch_ms: i64::MAX,
            data_end_time_epoch_ms: 0,
            chunk_snapshot_time_epoch_ms: 0,
            first_offset: -1,
            max_offset: -1,
            num_messages: 0,
            size_bytes: 0,
        }
    }

    /// Record one indexed message.
    pub fn update_for_message(
        &mut self,
        now_epoch_ms: i64,
        message_timestamp_epoch_ms: i64,
        offset: i64,
        size_bytes: u64,
    ) {
        self.num_messages += 1;
        self.size_bytes += size_bytes;
        self.data_start_time_epoch_ms = self
            .data_start_time_epoch_ms
            .min(message_timestamp_epoch_ms);
        self.data_end_time_epoch_ms = self.data_end_time_epoch_ms.max(message_timestamp_epoch_ms);
        if self.first_offset < 0 {
            self.first_offset = offset;
        }
        self.max_offset = self.max_offset.max(offset);
        self.chunk_last_updated_time_epoch_ms = now_epoch_ms;
    }
}

/// A document to be indexed into a chunk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogMessage {
    /// Unique document id.
    pub id: String,
    /// Event time of the message.
    pub timestamp_epoch_ms: i64,
    /// Arbitrary structured payload.
    pub source: serde_json::Value,
}

impl LogMessage {
    /// Create a new message.
    pub fn new(
        id: impl Into<String>,
        timestamp_epoch_ms: i64,
        source: serde_json::Value,
    ) -> Self {
        Self {
            id: id.into(),
            timestamp_epoch_ms,
            source,
        }
    }
}

/// An inbound record from the message bus, prior to admission and indexing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Span {
    /// Producer-assigned span id.
    pub id: String,
    /// The tenant this span belongs to; empty when the producer omitted it.
    pub service_name: String,
    /// Event time of the span.
    pub timestamp_epoch_ms: i64,
    /// Span duration in microseconds.
    pub duration_micros: i64,
    /// Free-form key-value annotations.
    pub tags: BTreeMap<String, String>,
}

impl Span {
    /// Estimated wire size of this span, used for permit accounting.
    pub fn size_bytes(&self) -> u64 {
        let tag_bytes: usize = self.tags.iter().map(|(k, v)| k.len() + v.len()).sum();
        // fixed-width fields plus the variable-length strings
        (16 + self.id.len() + self.service_name.len() + tag_bytes) as u64
    }
}
