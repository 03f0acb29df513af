//! Persistence backends for the document store.
//!
//! Defines [`DocumentBackend`], the whole-document read/write abstraction the
//! I/O worker drives. Backends are synchronous: the worker thread is the only
//! caller, so implementations never run on the async scheduler.
//!
//! - [`FileBackend`]: one JSON file per key under a root directory.
//! - [`MemoryBackend`]: in-process map for tests and ephemeral stores.

mod file;
mod memory;

pub use file::FileBackend;
pub use memory::{MemoryBackend, WriteGate};

use docstore_core::Document;

use crate::error::{BackendError, StoreError};

/// Whole-document persistence keyed by entity id.
///
/// Used as `Arc<dyn DocumentBackend>`. Every write replaces the entire
/// document; there are no partial updates.
pub trait DocumentBackend: Send + Sync + 'static {
    /// Read and decode the document stored under `key`.
    ///
    /// Returns [`BackendError::NotFound`] when nothing is stored under `key`.
    fn read_document(&self, key: &str) -> Result<Document, BackendError>;

    /// Replace (or create) the document stored under `key`.
    fn write_document(&self, key: &str, document: &Document) -> Result<(), BackendError>;

    /// Keys currently persisted, in no particular order.
    fn list_keys(&self) -> Result<Vec<String>, BackendError>;
}

/// Checks that `key` can be used as a file name directly under the store root.
///
/// Rejects empty keys, `.`/`..`, path separators, NUL bytes, and a leading
/// `.` (reserved for in-progress temp files).
///
/// # Errors
///
/// Returns [`StoreError::InvalidKey`] when the key is not usable.
pub fn validate_key(key: &str) -> Result<(), StoreError> {
    let invalid = key.is_empty()
        || key.starts_with('.')
        || key.contains(['/', '\\', '\0']);
    if invalid {
        return Err(StoreError::InvalidKey(key.to_string()));
    }
    Ok(())
}
