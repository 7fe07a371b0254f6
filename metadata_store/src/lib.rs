//! Typed, namespaced metadata storage for the logdb cluster, layered over a
//! coordination service.
//!
//! The coordination service is a strongly-consistent hierarchical KV store
//! (see [`interface::CoordinationStore`]). Each entity type gets its own
//! disjoint folder holding one UTF-8 JSON node per entity, plus a
//! watcher-backed in-memory cache for cheap fleet-wide listings.
//!
//! Entity stores are separate concrete types wrapping a shared
//! `pub(crate)` core, so the operation set is restricted per type at
//! compile time: snapshots can be created and deleted but never updated,
//! while service records support full CRUD.
#![deny(rustdoc::broken_intra_doc_links, rustdoc::bare_urls, rust_2018_idioms)]
#![warn(
    missing_debug_implementations,
    clippy::explicit_iter_loop,
    clippy::use_self,
    clippy::clone_on_ref_ptr
)]

mod cache;
mod core;
pub mod interface;
pub mod mem;
mod search;
mod service;
mod snapshot;

pub use search::{SearchMetadataStore, SEARCH_STORE_FOLDER};
pub use service::{ServiceMetadataStore, SERVICE_STORE_FOLDER};
pub use snapshot::{SnapshotMetadataStore, SNAPSHOT_STORE_FOLDER};

use crate::interface::StoreError;
use serde::de::DeserializeOwned;
use serde::Serialize;
use snafu::Snafu;
use std::fmt::Debug;

/// An entity that can live in a metadata store folder.
///
/// The JSON codec must be lossless for every defined field and ignore
/// unknown fields on ingest, so records written by newer software stay
/// readable.
pub trait MetadataNode:
    Clone + Debug + Serialize + DeserializeOwned + Send + Sync + 'static
{
    /// The node name, unique within the entity's folder.
    fn node_name(&self) -> &str;
}

impl MetadataNode for data_types::SnapshotMetadata {
    fn node_name(&self) -> &str {
        self.name()
    }
}

impl MetadataNode for data_types::SearchMetadata {
    fn node_name(&self) -> &str {
        &self.name
    }
}

impl MetadataNode for data_types::ServiceMetadata {
    fn node_name(&self) -> &str {
        &self.name
    }
}

/// Errors raised by the typed metadata stores.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum Error {
    /// Created a node that already exists.
    #[snafu(display("metadata node already exists: {path}"))]
    AlreadyExists {
        /// Absolute node path.
        path: String,
    },

    /// The requested node does not exist.
    #[snafu(display("metadata node not found: {path}"))]
    NotFound {
        /// Absolute node path.
        path: String,
    },

    /// A conditional update lost the race.
    #[snafu(display("metadata version conflict at {path}: expected {expected}, actual {actual}"))]
    VersionMismatch {
        /// Absolute node path.
        path: String,
        /// Version the caller based its update on.
        expected: u64,
        /// Version the store currently holds.
        actual: u64,
    },

    /// Encoding an entity failed.
    #[snafu(display("failed to serialize metadata entity: {source}"))]
    Serialization {
        /// Underlying codec error.
        source: serde_json::Error,
    },

    /// A stored payload could not be decoded.
    #[snafu(display("corrupt metadata node at {path}: {source}"))]
    Corrupt {
        /// Absolute node path.
        path: String,
        /// Underlying codec error.
        source: serde_json::Error,
    },

    /// The coordination service stayed unreachable past the retry deadline.
    #[snafu(display("coordination store unavailable: {source}"))]
    Unavailable {
        /// Last transport error observed.
        source: StoreError,
    },

    /// Empty partition assignments would require the auto-assignment
    /// allocator, which does not exist yet.
    #[snafu(display("automatic partition assignment for service {service} is not supported"))]
    AutoAssignUnsupported {
        /// The service the update addressed.
        service: String,
    },

    /// A throughput value outside the accepted range.
    #[snafu(display("invalid throughput {throughput_bytes}: must be >= 0 or -1 for unchanged"))]
    InvalidThroughput {
        /// The rejected value.
        throughput_bytes: i64,
    },

    /// An entity failed domain validation.
    #[snafu(display("invalid metadata entity: {source}"))]
    InvalidEntity {
        /// Underlying validation error.
        source: data_types::Error,
    },
}

impl Error {
    fn from_store(e: StoreError) -> Self {
        match e {
            StoreError::AlreadyExists { path } => Self::AlreadyExists { path },
            StoreError::NotFound { path } => Self::NotFound { path },
            StoreError::VersionMismatch {
                path,
                expected,
                actual,
            } => Self::VersionMismatch {
                path,
                expected,
                actual,
            },
            e @ StoreError::Unavailable { .. } => Self::Unavailable { source: e },
        }
    }
}

/// Result with this crate's [`Error`].
pub type Result<T, E = Error> = std::result::Result<T, E>;
