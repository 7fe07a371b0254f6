//! Chunk lifecycle management for the indexing path.
//!
//! A [`ChunkManager`] owns a set of chunks for one indexer process. It
//! routes writes to the single live chunk, seals and uploads chunks when
//! the rollover strategy fires, and publishes the resulting snapshot
//! metadata so the rest of the fleet can find the data in object storage.
//!
//! The inverted index behind each chunk is an external collaborator,
//! reached only through the [`LogIndexer`] seam.
#![deny(rustdoc::broken_intra_doc_links, rustdoc::bare_urls, rust_2018_idioms)]
#![warn(
    missing_debug_implementations,
    clippy::explicit_iter_loop,
    clippy::use_self,
    clippy::clone_on_ref_ptr
)]

mod chunk;
mod factory;
mod manager;
mod rollover;
#[cfg(test)]
pub(crate) mod test_util;

pub use chunk::{ChunkError, ReadWriteChunk};
pub use factory::{ChunkFactory, IndexerFactory};
pub use manager::{ChunkManager, ChunkManagerConfig, Error, RolloverMode, DEFAULT_DRAIN_DEADLINE};
pub use rollover::{
    ChunkRollOverStrategy, NeverRolloverStrategy, SizeOrCountBasedRolloverStrategy,
};

use data_types::LogMessage;
use std::fmt::Debug;
use std::path::PathBuf;

/// Error type produced by [`LogIndexer`] implementations.
pub type IndexError = Box<dyn std::error::Error + Send + Sync>;

/// The seam to the local inverted index backing a chunk.
///
/// Implementations must be safe for concurrent `add_document` calls. Both
/// `commit` and `seal` must be idempotent: a sealed index asked to seal
/// again returns the same file set.
pub trait LogIndexer: Debug + Send + Sync {
    /// Index one document.
    fn add_document(&self, message: &LogMessage) -> Result<(), IndexError>;

    /// Make everything indexed so far locally durable and searchable.
    fn commit(&self) -> Result<(), IndexError>;

    /// Final flush; returns the local files making up the index.
    fn seal(&self) -> Result<Vec<PathBuf>, IndexError>;

    /// Release the index's resources.
    fn close(&self) -> Result<(), IndexError>;
}
