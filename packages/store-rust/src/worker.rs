//! Dedicated I/O worker that owns every backend access.
//!
//! Provides [`IoWorker`], a single background thread draining a FIFO queue of
//! [`IoRequest`]s, and the [`CompletionSink`] seam through which each
//! request's [`IoOutcome`] is handed back to the task waiting for it.

use std::collections::VecDeque;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use docstore_core::Document;
use parking_lot::{Condvar, Mutex};
use tracing::{debug, warn};

use crate::backend::DocumentBackend;
use crate::error::{BackendError, StoreError};

// ---------------------------------------------------------------------------
// Requests and outcomes
// ---------------------------------------------------------------------------

/// Correlation token tying a queued request to its outcome.
///
/// Allocated from a per-store monotonically increasing counter, so a token
/// is never reused while the store lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Token(pub u64);

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// A unit of work for the I/O worker.
#[derive(Debug)]
pub struct IoRequest {
    pub token: Token,
    pub key: String,
    /// `Some` writes the document, `None` reads it.
    pub payload: Option<Document>,
}

impl IoRequest {
    /// A request to read `key`'s document.
    #[must_use]
    pub fn read(token: Token, key: impl Into<String>) -> Self {
        Self {
            token,
            key: key.into(),
            payload: None,
        }
    }

    /// A request to replace `key`'s document with `document`.
    #[must_use]
    pub fn write(token: Token, key: impl Into<String>, document: Document) -> Self {
        Self {
            token,
            key: key.into(),
            payload: Some(document),
        }
    }
}

/// What the worker recorded for one request.
#[derive(Debug)]
pub enum IoOutcome {
    /// A read succeeded.
    Loaded(Document),
    /// A write succeeded.
    Stored,
    /// The backend failed (or panicked) serving the request.
    Failed(BackendError),
}

/// Receives every outcome the worker produces.
///
/// Called on the worker thread, so implementations must not block.
pub trait CompletionSink: Send + Sync + 'static {
    /// Deliver `outcome` for the request identified by `key` and `token`.
    fn complete(&self, key: &str, token: Token, outcome: IoOutcome);
}

// ---------------------------------------------------------------------------
// IoWorker
// ---------------------------------------------------------------------------

struct QueueState {
    pending: VecDeque<IoRequest>,
    stopping: bool,
}

struct Shared {
    queue: Mutex<QueueState>,
    work_ready: Condvar,
    processed: AtomicU64,
}

/// Single background thread performing all backend reads and writes.
///
/// The worker thread:
/// 1. Pops the oldest request, waiting up to `poll_interval` at a time while
///    the queue is empty
/// 2. Reads or writes through the backend, capturing errors and panics
/// 3. Hands the outcome to the [`CompletionSink`]
/// 4. Once stopped, drains whatever is still queued and exits
///
/// A stopped worker is never resumed; reopening a store starts a new one.
pub struct IoWorker {
    shared: Arc<Shared>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl IoWorker {
    /// Spawns the worker thread.
    ///
    /// # Errors
    ///
    /// Returns an error if the OS refuses to spawn the thread.
    pub fn start(
        backend: Arc<dyn DocumentBackend>,
        sink: Arc<dyn CompletionSink>,
        poll_interval: Duration,
    ) -> std::io::Result<Self> {
        let shared = Arc::new(Shared {
            queue: Mutex::new(QueueState {
                pending: VecDeque::new(),
                stopping: false,
            }),
            work_ready: Condvar::new(),
            processed: AtomicU64::new(0),
        });

        let loop_shared = Arc::clone(&shared);
        let handle = std::thread::Builder::new()
            .name("docstore-io".to_string())
            .spawn(move || worker_loop(&loop_shared, backend.as_ref(), sink.as_ref(), poll_interval))?;

        Ok(Self {
            shared,
            handle: Mutex::new(Some(handle)),
        })
    }

    /// Queue a request behind every request already submitted.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Closed`] once [`stop`](Self::stop) has been requested.
    pub fn submit(&self, request: IoRequest) -> Result<(), StoreError> {
        {
            let mut state = self.shared.queue.lock();
            if state.stopping {
                return Err(StoreError::Closed);
            }
            state.pending.push_back(request);
        }
        self.shared.work_ready.notify_one();
        Ok(())
    }

    /// Number of requests waiting to be picked up.
    #[must_use]
    pub fn queue_depth(&self) -> usize {
        self.shared.queue.lock().pending.len()
    }

    /// Number of requests the worker has finished.
    #[must_use]
    pub fn processed(&self) -> u64 {
        self.shared.processed.load(Ordering::Relaxed)
    }

    /// Whether the worker thread is still running.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.handle
            .lock()
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    /// Stop accepting requests without waiting for the thread to exit.
    pub fn request_stop(&self) {
        // Notify under the lock so a worker between its stop check and its
        // condvar wait cannot miss the wakeup.
        let mut state = self.shared.queue.lock();
        state.stopping = true;
        self.shared.work_ready.notify_all();
    }

    /// Stop accepting requests, drain the queue, and join the thread.
    ///
    /// Blocks the calling thread; async callers should run it on a blocking
    /// pool. Calling it more than once is harmless.
    pub fn stop(&self) {
        self.request_stop();
        let handle = self.handle.lock().take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                warn!("docstore i/o worker exited by panic");
            }
        }
    }
}

impl Drop for IoWorker {
    fn drop(&mut self) {
        self.request_stop();
    }
}

fn worker_loop(
    shared: &Shared,
    backend: &dyn DocumentBackend,
    sink: &dyn CompletionSink,
    poll_interval: Duration,
) {
    debug!("docstore i/o worker started");
    while let Some(request) = next_request(shared, poll_interval) {
        let IoRequest {
            token,
            key,
            payload,
        } = request;
        let outcome = execute(backend, &key, payload.as_ref());
        match &outcome {
            IoOutcome::Failed(error) => {
                warn!(%token, key = %key, error = %error, "backend request failed");
            }
            IoOutcome::Loaded(_) => debug!(%token, key = %key, "document read"),
            IoOutcome::Stored => debug!(%token, key = %key, "document written"),
        }
        sink.complete(&key, token, outcome);
        shared.processed.fetch_add(1, Ordering::Relaxed);
    }
    debug!("docstore i/o worker drained and stopped");
}

/// Blocks until a request is available, or returns `None` once the worker
/// is stopping and the queue is empty.
fn next_request(shared: &Shared, poll_interval: Duration) -> Option<IoRequest> {
    let mut state = shared.queue.lock();
    loop {
        if let Some(request) = state.pending.pop_front() {
            return Some(request);
        }
        if state.stopping {
            return None;
        }
        shared.work_ready.wait_for(&mut state, poll_interval);
    }
}

fn execute(backend: &dyn DocumentBackend, key: &str, payload: Option<&Document>) -> IoOutcome {
    let result = panic::catch_unwind(AssertUnwindSafe(|| match payload {
        Some(document) => backend.write_document(key, document).map(|()| IoOutcome::Stored),
        None => backend.read_document(key).map(IoOutcome::Loaded),
    }));
    match result {
        Ok(Ok(outcome)) => outcome,
        Ok(Err(error)) => IoOutcome::Failed(error),
        Err(payload) => IoOutcome::Failed(BackendError::Panicked(panic_message(payload.as_ref()))),
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
