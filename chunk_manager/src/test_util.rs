//! Test doubles for the index seam.

use crate::{IndexError, IndexerFactory, LogIndexer};
use data_types::LogMessage;
use parking_lot::Mutex;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex as StdMutex};

/// Blocks `seal` until released, to hold a rollover in flight at a known
/// point.
#[derive(Debug, Default)]
pub(crate) struct SealGate {
    released: StdMutex<bool>,
    condvar: Condvar,
}

impl SealGate {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub(crate) fn release(&self) {
        *self.released.lock().unwrap() = true;
        self.condvar.notify_all();
    }

    fn wait(&self) {
        let mut released = self.released.lock().unwrap();
        while !*released {
            released = self.condvar.wait(released).unwrap();
        }
    }
}

/// An in-memory index that spills its documents to JSON files on seal.
#[derive(Debug)]
pub(crate) struct TestIndexer {
    dir: PathBuf,
    documents: Mutex<Vec<LogMessage>>,
    fail_seal: AtomicBool,
    vanish_files: AtomicBool,
    gate: Mutex<Option<Arc<SealGate>>>,
}

impl TestIndexer {
    pub(crate) fn new(dir: PathBuf) -> Self {
        Self {
            dir,
            documents: Mutex::new(vec![]),
            fail_seal: AtomicBool::new(false),
            vanish_files: AtomicBool::new(false),
            gate: Mutex::new(None),
        }
    }

    pub(crate) fn set_fail_seal(&self, fail: bool) {
        self.fail_seal.store(fail, Ordering::Release);
    }

    /// Make `seal` report files that do not exist, so the upload fails.
    pub(crate) fn set_vanish_files(&self, vanish: bool) {
        self.vanish_files.store(vanish, Ordering::Release);
    }

    pub(crate) fn set_gate(&self, gate: Arc<SealGate>) {
        *self.gate.lock() = Some(gate);
    }
}

impl LogIndexer for TestIndexer {
    fn add_document(&self, message: &LogMessage) -> Result<(), IndexError> {
        self.documents.lock().push(message.clone());
        Ok(())
    }

    fn commit(&self) -> Result<(), IndexError> {
        Ok(())
    }

    fn seal(&self) -> Result<Vec<PathBuf>, IndexError> {
        let gate = self.gate.lock().clone();
        if let Some(gate) = gate {
            gate.wait();
        }

        if self.fail_seal.load(Ordering::Acquire) {
            return Err("injected seal failure".into());
        }
        if self.vanish_files.load(Ordering::Acquire) {
            return Ok(vec![self.dir.join("vanished.seg")]);
        }

        std::fs::create_dir_all(&self.dir)?;
        let documents = self.documents.lock();

        let mut encoded = String::new();
        for document in documents.iter() {
            encoded.push_str(&serde_json::to_string(document)?);
            encoded.push('\n');
        }
        let segment = self.dir.join("segment.jsonl");
        std::fs::write(&segment, encoded)?;

        let manifest = self.dir.join("manifest.json");
        std::fs::write(&manifest, format!(r#"{{"documents":{}}}"#, documents.len()))?;

        Ok(vec![segment, manifest])
    }

    fn close(&self) -> Result<(), IndexError> {
        Ok(())
    }
}

/// Creates one [`TestIndexer`] per chunk under a shared root directory,
/// propagating the configured failure injections.
#[derive(Debug)]
pub(crate) struct TestIndexerFactory {
    root: PathBuf,
    fail_seal: AtomicBool,
    vanish_files: AtomicBool,
    gate: Mutex<Option<Arc<SealGate>>>,
}

impl TestIndexerFactory {
    pub(crate) fn new(root: PathBuf) -> Self {
        Self {
            root,
            fail_seal: AtomicBool::new(false),
            vanish_files: AtomicBool::new(false),
            gate: Mutex::new(None),
        }
    }

    pub(crate) fn set_fail_seal(&self, fail: bool) {
        self.fail_seal.store(fail, Ordering::Release);
    }

    pub(crate) fn set_vanish_files(&self, vanish: bool) {
        self.vanish_files.store(vanish, Ordering::Release);
    }

    pub(crate) fn set_gate(&self, gate: Arc<SealGate>) {
        *self.gate.lock() = Some(gate);
    }
}

impl IndexerFactory for TestIndexerFactory {
    fn create(&self, chunk_id: &str) -> Result<Arc<dyn LogIndexer>, IndexError> {
        let indexer = TestIndexer::new(self.root.join(chunk_id));
        indexer.set_fail_seal(self.fail_seal.load(Ordering::Acquire));
        indexer.set_vanish_files(self.vanish_files.load(Ordering::Acquire));
        if let Some(gate) = self.gate.lock().clone() {
            indexer.set_gate(gate);
        }
        Ok(Arc::new(indexer))
    }
}
