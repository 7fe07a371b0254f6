//! Re-exports the observability ecosystem crates used throughout the
//! workspace so that every crate logs through the same `tracing` version
//! and upgrades happen in exactly one place.
#![deny(rustdoc::broken_intra_doc_links, rustdoc::bare_urls, rust_2018_idioms)]
#![warn(missing_docs)]

pub use tracing;
