//! Shared helpers for tests across the workspace.
#![deny(rustdoc::broken_intra_doc_links, rustdoc::bare_urls, rust_2018_idioms)]
#![warn(missing_docs, clippy::explicit_iter_loop, clippy::use_self)]

use std::sync::Once;
use tracing_subscriber::EnvFilter;

static LOG_SETUP: Once = Once::new();

/// Start tracing output for tests if `RUST_LOG` is set.
///
/// Add a call to the top of a test and run with e.g.
/// `RUST_LOG=debug cargo test -- --nocapture` to see its log output.
pub fn maybe_start_logging() {
    if std::env::var("RUST_LOG").is_ok() {
        start_logging()
    }
}

/// Unconditionally install a global tracing subscriber writing to stderr.
///
/// Safe to call from multiple tests; only the first call installs.
pub fn start_logging() {
    LOG_SETUP.call_once(|| {
        // route `log` records from dependencies into tracing
        tracing_log::LogTracer::init().expect("log tracer init");

        tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::from_default_env())
            .with_test_writer()
            .init();
    });
}
