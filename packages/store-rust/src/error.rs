//! Error types for the document store.

/// Result alias for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;

/// Failure reported by a [`DocumentBackend`](crate::backend::DocumentBackend).
///
/// Produced on the I/O worker thread and handed back to the waiting caller
/// through the request's completion; never propagated out of the worker loop.
#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("document not found")]
    NotFound,
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("document is not a valid JSON object: {0}")]
    Decode(#[source] serde_json::Error),
    #[error("document could not be serialized: {0}")]
    Encode(#[source] serde_json::Error),
    #[error("backend panicked: {0}")]
    Panicked(String),
    #[error("injected failure: {0}")]
    Injected(String),
}

impl BackendError {
    /// Whether the failure means the document simply does not exist.
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound)
    }
}

/// Errors surfaced by [`DocumentStore`](crate::DocumentStore) operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("store is closed")]
    Closed,
    #[error("invalid document key {0:?}")]
    InvalidKey(String),
    #[error("failed to read document {key:?}: {source}")]
    BackendRead {
        key: String,
        #[source]
        source: BackendError,
    },
    #[error("failed to write document {key:?}: {source}")]
    BackendWrite {
        key: String,
        #[source]
        source: BackendError,
    },
    #[error("i/o worker dropped the request for {key:?} without completing it")]
    WorkerGone { key: String },
    #[error("failed to list stored documents: {0}")]
    Discovery(#[source] BackendError),
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

impl StoreError {
    /// Whether the error was raised because the store is closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        matches!(self, Self::Closed)
    }
}
