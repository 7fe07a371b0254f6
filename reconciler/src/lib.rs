//! Reconciliation between object storage and the published snapshots.
//!
//! Chunk files and their snapshot records are written by different systems
//! and can drift: a crashed indexer may leave uploaded files with no
//! snapshot, and operator mistakes can leave snapshots pointing at nothing.
//! The reconciler periodically compares both sides and reports the
//! orphans in each direction.
//!
//! Orphans are reported, not deleted. Deleting files safely needs an age
//! threshold and a two-phase protocol so that an upload racing the scan is
//! not collected; until that exists the report and the gauges are the
//! product.
#![deny(rustdoc::broken_intra_doc_links, rustdoc::bare_urls, rust_2018_idioms)]
#![warn(
    missing_debug_implementations,
    missing_docs,
    clippy::explicit_iter_loop,
    clippy::use_self,
    clippy::clone_on_ref_ptr
)]

use data_types::SnapshotMetadata;
use futures::TryStreamExt;
use metadata_store::SnapshotMetadataStore;
use metric::{Attributes, Registry, U64Counter, U64Gauge};
use object_store::{path::Path as ObjectStorePath, ObjectStore};
use observability_deps::tracing::{info, warn};
use snafu::{ResultExt, Snafu};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Errors raised by a reconciliation pass.
#[derive(Debug, Snafu)]
#[allow(missing_docs)]
pub enum Error {
    #[snafu(display("failed to list object storage: {source}"))]
    Listing { source: object_store::Error },
}

/// Result with this crate's [`Error`].
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// The orphans found by one reconciliation pass.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct ReconcileReport {
    /// Object keys with no snapshot claiming them. Deletion candidates.
    pub files_without_snapshots: Vec<String>,
    /// Snapshots whose path matches no listed file. Metadata drift.
    pub snapshots_without_files: Vec<SnapshotMetadata>,
}

/// Compares object-storage contents against the published snapshot list.
#[derive(Debug)]
pub struct SnapshotReconciler {
    object_store: Arc<dyn ObjectStore>,
    snapshot_store: Arc<SnapshotMetadataStore>,
    chunk_data_prefix: String,

    runs: U64Counter,
    orphaned_files: U64Gauge,
    stale_snapshots: U64Gauge,
}

impl SnapshotReconciler {
    /// Create a reconciler scanning `chunk_data_prefix`.
    pub fn new(
        object_store: Arc<dyn ObjectStore>,
        snapshot_store: Arc<SnapshotMetadataStore>,
        chunk_data_prefix: impl Into<String>,
        metric_registry: &Registry,
    ) -> Self {
        let runs = metric_registry
            .register_metric::<U64Counter>(
                "reconciler_runs_total",
                "completed reconciliation passes",
            )
            .recorder(Attributes::default());
        let orphaned_files = metric_registry
            .register_metric::<U64Gauge>(
                "reconciler_files_without_snapshots",
                "object keys not claimed by any snapshot, per last pass",
            )
            .recorder(Attributes::default());
        let stale_snapshots = metric_registry
            .register_metric::<U64Gauge>(
                "reconciler_snapshots_without_files",
                "snapshots whose files are missing, per last pass",
            )
            .recorder(Attributes::default());

        Self {
            object_store,
            snapshot_store,
            chunk_data_prefix: chunk_data_prefix.into(),
            runs,
            orphaned_files,
            stale_snapshots,
        }
    }

    /// Run one reconciliation pass.
    ///
    /// Files are listed before the snapshot cache is read: a snapshot
    /// published concurrently can then only make a file look momentarily
    /// unclaimed (safe to ignore for a cycle), never the reverse.
    pub async fn reconcile(&self) -> Result<ReconcileReport> {
        let prefix = ObjectStorePath::from(self.chunk_data_prefix.as_str());
        let file_paths: Vec<String> = self
            .object_store
            .list(Some(&prefix))
            .await
            .context(ListingSnafu)?
            .map_ok(|meta| meta.location.to_string())
            .try_collect()
            .await
            .context(ListingSnafu)?;

        let snapshots = self.snapshot_store.list_cached();

        let report = compare(file_paths, snapshots);

        for path in &report.files_without_snapshots {
            warn!(path=%path, "object-store file not claimed by any snapshot");
        }
        for snapshot in &report.snapshots_without_files {
            warn!(
                snapshot_id=%snapshot.snapshot_id(),
                snapshot_path=%snapshot.snapshot_path(),
                "snapshot has no files in object storage",
            );
        }

        self.runs.inc(1);
        self.orphaned_files
            .set(report.files_without_snapshots.len() as u64);
        self.stale_snapshots
            .set(report.snapshots_without_files.len() as u64);

        Ok(report)
    }
}

/// Split `a/b/c` into `a`, `a/b`, `a/b/c` so a snapshot that references a
/// directory matches any file below it.
fn explode_prefixes(path: &str) -> Vec<String> {
    let mut prefixes = Vec::new();
    let mut current = String::new();
    for segment in path.split('/').filter(|s| !s.is_empty()) {
        if !current.is_empty() {
            current.push('/');
        }
        current.push_str(segment);
        prefixes.push(current.clone());
    }
    prefixes
}

fn compare(file_paths: Vec<String>, snapshots: Vec<SnapshotMetadata>) -> ReconcileReport {
    let snapshot_paths: HashSet<&str> = snapshots
        .iter()
        .map(|s| s.snapshot_path().trim_end_matches('/'))
        .collect();

    let mut claimed_snapshot_paths: HashSet<String> = HashSet::new();
    let mut files_without_snapshots = Vec::new();

    for file_path in file_paths {
        let mut claimed = false;
        for prefix in explode_prefixes(&file_path) {
            if snapshot_paths.contains(prefix.as_str()) {
                claimed_snapshot_paths.insert(prefix);
                claimed = true;
            }
        }
        if !claimed {
            files_without_snapshots.push(file_path);
        }
    }

    let snapshots_without_files = snapshots
        .into_iter()
        .filter(|s| !claimed_snapshot_paths.contains(s.snapshot_path().trim_end_matches('/')))
        .collect();

    ReconcileReport {
        files_without_snapshots,
        snapshots_without_files,
    }
}

/// Drive `reconciler` every `interval` until `shutdown` fires.
pub async fn run_reconciler(
    reconciler: SnapshotReconciler,
    interval: Duration,
    shutdown: CancellationToken,
) {
    loop {
        if shutdown.is_cancelled() {
            info!("reconciler shutdown");
            return;
        }

        match reconciler.reconcile().await {
            Ok(report) => info!(
                files_without_snapshots = report.files_without_snapshots.len(),
                snapshots_without_files = report.snapshots_without_files.len(),
                "reconciliation pass complete",
            ),
            Err(e) => warn!(e=%e, "reconciliation pass failed"),
        }

        tokio::select!(
            _ = tokio::time::sleep(interval) => {},
            _ = shutdown.cancelled() => {},
        );
    }
}
