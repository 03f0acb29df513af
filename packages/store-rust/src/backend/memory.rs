//! In-process [`DocumentBackend`] implementation.
//!
//! [`MemoryBackend`] keeps documents in a map and counts every read and
//! write it serves. It can be told to fail, panic, or stall on specific
//! keys, which makes it the backend of choice for exercising the worker and
//! store under failure and contention. Documents do not survive the process.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use docstore_core::Document;
use parking_lot::{Condvar, Mutex};

use crate::backend::DocumentBackend;
use crate::error::BackendError;

/// Map-backed storage with fault injection and I/O counters.
#[derive(Default)]
pub struct MemoryBackend {
    documents: Mutex<HashMap<String, Document>>,
    faults: Mutex<Faults>,
    reads: AtomicU64,
    writes: AtomicU64,
}

#[derive(Default)]
struct Faults {
    failing_reads: HashSet<String>,
    failing_writes: HashSet<String>,
    panicking_reads: HashSet<String>,
    gates: HashMap<String, WriteGate>,
}

impl MemoryBackend {
    /// Creates an empty backend.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Seeds a document directly, bypassing the counters.
    pub fn insert(&self, key: impl Into<String>, document: Document) {
        self.documents.lock().insert(key.into(), document);
    }

    /// Returns the stored document, bypassing the counters.
    #[must_use]
    pub fn snapshot(&self, key: &str) -> Option<Document> {
        self.documents.lock().get(key).cloned()
    }

    /// Number of `read_document` calls served, successful or not.
    #[must_use]
    pub fn reads(&self) -> u64 {
        self.reads.load(Ordering::SeqCst)
    }

    /// Number of `write_document` calls served, successful or not.
    #[must_use]
    pub fn writes(&self) -> u64 {
        self.writes.load(Ordering::SeqCst)
    }

    /// Makes every read of `key` fail until [`clear_faults`](Self::clear_faults).
    pub fn fail_reads(&self, key: &str) {
        self.faults.lock().failing_reads.insert(key.to_string());
    }

    /// Makes every write of `key` fail until [`clear_faults`](Self::clear_faults).
    pub fn fail_writes(&self, key: &str) {
        self.faults.lock().failing_writes.insert(key.to_string());
    }

    /// Makes every read of `key` panic inside the backend.
    pub fn panic_on_read(&self, key: &str) {
        self.faults.lock().panicking_reads.insert(key.to_string());
    }

    /// Stalls the next writes of `key` until the returned gate is opened.
    pub fn hold_writes(&self, key: &str) -> WriteGate {
        let gate = WriteGate::default();
        self.faults
            .lock()
            .gates
            .insert(key.to_string(), gate.clone());
        gate
    }

    /// Removes every injected failure and opens every held gate.
    pub fn clear_faults(&self) {
        let mut faults = self.faults.lock();
        for gate in faults.gates.values() {
            gate.open();
        }
        *faults = Faults::default();
    }
}

impl DocumentBackend for MemoryBackend {
    fn read_document(&self, key: &str) -> Result<Document, BackendError> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        {
            let faults = self.faults.lock();
            assert!(
                !faults.panicking_reads.contains(key),
                "injected panic reading {key}"
            );
            if faults.failing_reads.contains(key) {
                return Err(BackendError::Injected(format!("read of {key}")));
            }
        }
        self.documents
            .lock()
            .get(key)
            .cloned()
            .ok_or(BackendError::NotFound)
    }

    fn write_document(&self, key: &str, document: &Document) -> Result<(), BackendError> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        let gate = {
            let faults = self.faults.lock();
            if faults.failing_writes.contains(key) {
                return Err(BackendError::Injected(format!("write of {key}")));
            }
            faults.gates.get(key).cloned()
        };
        // Wait outside the faults lock so the test can open the gate.
        if let Some(gate) = gate {
            gate.wait();
        }
        self.documents
            .lock()
            .insert(key.to_string(), document.clone());
        Ok(())
    }

    fn list_keys(&self) -> Result<Vec<String>, BackendError> {
        Ok(self.documents.lock().keys().cloned().collect())
    }
}

/// Blocks backend writes for one key until opened.
#[derive(Clone, Default)]
pub struct WriteGate {
    inner: Arc<GateInner>,
}

#[derive(Default)]
struct GateInner {
    state: Mutex<GateState>,
    cond: Condvar,
}

#[derive(Default)]
struct GateState {
    open: bool,
    waiting: usize,
}

impl WriteGate {
    /// Releases every write waiting on this gate, and all future ones.
    pub fn open(&self) {
        let mut state = self.inner.state.lock();
        state.open = true;
        self.inner.cond.notify_all();
    }

    /// Number of writes currently stalled on the gate.
    #[must_use]
    pub fn waiting(&self) -> usize {
        self.inner.state.lock().waiting
    }

    fn wait(&self) {
        let mut state = self.inner.state.lock();
        state.waiting += 1;
        while !state.open {
            self.inner.cond.wait(&mut state);
        }
        state.waiting -= 1;
    }
}
