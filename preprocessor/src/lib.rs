//! Admission control in front of the indexing pipeline.
//!
//! The preprocessor sits between the message bus and the indexers. Before a
//! record is handed to an indexer it must pass the per-service
//! [`SpanAdmissionFilter`]: a token-bucket gate that enforces each tenant's
//! provisioned byte throughput and surfaces every drop through metrics
//! rather than backpressuring the bus.
#![deny(rustdoc::broken_intra_doc_links, rustdoc::bare_urls, rust_2018_idioms)]
#![warn(
    missing_debug_implementations,
    clippy::explicit_iter_loop,
    clippy::use_self,
    clippy::clone_on_ref_ptr
)]

mod rate_limiter;
mod token_bucket;

pub use rate_limiter::{
    DropReason, PreprocessorRateLimiter, RateLimiterConfig, SpanAdmissionFilter,
};
pub use token_bucket::TokenBucket;
