//! The document store: per-entity JSON documents behind a cache and a single I/O worker.
//!
//! [`DocumentStore`] ties the pieces together. Every operation:
//! 1. is admitted by the [`LifecycleController`] (or fails with `Closed`)
//! 2. takes the key's lock from the [`KeyCoordinator`]
//! 3. answers from the [`DocumentCache`] or submits an [`IoRequest`] to the
//!    [`IoWorker`] and suspends until its completion arrives
//! 4. releases the key lock and the in-flight guard on every exit path

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use docstore_core::{merge, stamp, DefaultFields, Document, Identity};
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::backend::{validate_key, DocumentBackend, FileBackend};
use crate::cache::DocumentCache;
use crate::config::StoreConfig;
use crate::coordinator::{KeyCoordinator, KeyGuard};
use crate::error::{Result, StoreError};
use crate::lifecycle::{LifecycleController, StoreState};
use crate::stats::{StatsCounters, StoreStats};
use crate::worker::{CompletionSink, IoOutcome, IoRequest, IoWorker, Token};

/// Handle to an open document store. Cheap to clone; clones share the store.
#[derive(Clone)]
pub struct DocumentStore {
    inner: Arc<StoreInner>,
}

struct StoreInner {
    config: StoreConfig,
    backend: Arc<dyn DocumentBackend>,
    coordinator: Arc<KeyCoordinator>,
    cache: DocumentCache,
    lifecycle: LifecycleController,
    worker: Mutex<Option<Arc<IoWorker>>>,
    /// Serializes close/reopen so two transitions never interleave.
    transition: tokio::sync::Mutex<()>,
    next_token: AtomicU64,
    counters: StatsCounters,
}

impl DocumentStore {
    /// Opens a file-backed store rooted at `config.root_dir`.
    ///
    /// Creates the root directory if absent, registers every document
    /// already on disk, and starts the I/O worker.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid, the root directory
    /// cannot be created or listed, or the worker thread cannot be spawned.
    pub async fn open(config: StoreConfig) -> Result<Self> {
        config.validate()?;
        let root = config.root_dir.clone();
        let backend = tokio::task::spawn_blocking(move || FileBackend::new(root))
            .await
            .map_err(join_error)??;
        Self::with_backend(config, Arc::new(backend)).await
    }

    /// Opens a store over an arbitrary backend.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid, the backend cannot
    /// list its keys, or the worker thread cannot be spawned.
    pub async fn with_backend(config: StoreConfig, backend: Arc<dyn DocumentBackend>) -> Result<Self> {
        config.validate()?;
        let inner = StoreInner {
            cache: DocumentCache::new(config.cache_size),
            config,
            backend,
            coordinator: Arc::new(KeyCoordinator::new()),
            lifecycle: LifecycleController::new(),
            worker: Mutex::new(None),
            transition: tokio::sync::Mutex::new(()),
            next_token: AtomicU64::new(1),
            counters: StatsCounters::default(),
        };
        inner.discover_keys().await?;
        inner.start_worker()?;
        info!(
            root = %inner.config.root_dir.display(),
            keys = inner.coordinator.persisted_keys().len(),
            cache_size = inner.config.cache_size,
            "document store opened"
        );
        Ok(Self {
            inner: Arc::new(inner),
        })
    }

    /// Returns `identity`'s document with defaults backfilled and the
    /// identity fields refreshed.
    ///
    /// A key that was never written yields the defaults plus identity fields
    /// without touching the backend.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Closed`] after close, [`StoreError::InvalidKey`]
    /// for an unusable id, or [`StoreError::BackendRead`] if the stored
    /// document cannot be read.
    pub async fn get(&self, identity: &impl Identity) -> Result<Document> {
        let _op = self.inner.lifecycle.admit()?;
        let key = identity.id();
        validate_key(&key)?;

        let Some(guard) = self.inner.coordinator.lock_if_persisted(&key).await else {
            return Ok(self.defaults().fresh(identity));
        };
        let stored = self.inner.load(&guard).await?;
        Ok(self.defaults().materialize(stored, identity))
    }

    /// Shallow-merges `partial` into `identity`'s document and persists it.
    ///
    /// A new key starts from the defaults plus identity fields. Identity
    /// fields in `partial` are overwritten with `identity`. Returns the
    /// document as a subsequent [`get`](Self::get) would.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Closed`] after close, [`StoreError::InvalidKey`]
    /// for an unusable id, [`StoreError::BackendRead`] if the current
    /// document cannot be read, or [`StoreError::BackendWrite`] if the merged
    /// document cannot be written.
    pub async fn put(&self, identity: &impl Identity, partial: Document) -> Result<Document> {
        let _op = self.inner.lifecycle.admit()?;
        let key = identity.id();
        validate_key(&key)?;

        let guard = self.inner.coordinator.lock_for(&key).await;
        let mut document = if guard.is_persisted() {
            self.inner.load(&guard).await?
        } else {
            self.defaults().fresh(identity)
        };
        merge(&mut document, partial);
        stamp(&mut document, identity);
        self.inner.store(&guard, &document).await?;
        Ok(self.defaults().materialize(document, identity))
    }

    /// Replaces `identity`'s document with the defaults plus `document`,
    /// without reading what is currently stored.
    ///
    /// The way to recover a key whose stored document can no longer be read.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Closed`] after close, [`StoreError::InvalidKey`]
    /// for an unusable id, or [`StoreError::BackendWrite`] if the write fails.
    pub async fn replace(&self, identity: &impl Identity, document: Document) -> Result<Document> {
        let _op = self.inner.lifecycle.admit()?;
        let key = identity.id();
        validate_key(&key)?;

        let guard = self.inner.coordinator.lock_for(&key).await;
        let mut replacement = self.defaults().fresh(identity);
        merge(&mut replacement, document);
        stamp(&mut replacement, identity);
        self.inner.store(&guard, &replacement).await?;
        Ok(replacement)
    }

    /// Removes `fields` from `identity`'s document and returns how many were removed.
    ///
    /// `id`, `name`, and default fields are never removed; absent fields are
    /// skipped. Neither counts. The document is written back only when at
    /// least one field was removed. Unknown keys return 0.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Closed`] after close, [`StoreError::InvalidKey`]
    /// for an unusable id, [`StoreError::BackendRead`] if the current
    /// document cannot be read, or [`StoreError::BackendWrite`] if the
    /// updated document cannot be written.
    pub async fn delete<I, S>(&self, identity: &impl Identity, fields: I) -> Result<usize>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let _op = self.inner.lifecycle.admit()?;
        let key = identity.id();
        validate_key(&key)?;

        let Some(guard) = self.inner.coordinator.lock_if_persisted(&key).await else {
            return Ok(0);
        };
        let mut document = self.inner.load(&guard).await?;
        let defaults = self.defaults();
        let mut removed = 0;
        for field in fields {
            let field = field.as_ref();
            if !defaults.is_protected(field) && document.remove(field).is_some() {
                removed += 1;
            }
        }
        if removed > 0 {
            self.inner.store(&guard, &document).await?;
        }
        debug!(key = %key, removed, "fields deleted");
        Ok(removed)
    }

    /// Whether `identity` has a persisted document.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Closed`] after close.
    pub fn contains(&self, identity: &impl Identity) -> Result<bool> {
        let _op = self.inner.lifecycle.admit()?;
        Ok(self.inner.coordinator.is_persisted(&identity.id()))
    }

    /// Every key with a persisted document, sorted.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Closed`] after close.
    pub fn keys(&self) -> Result<Vec<String>> {
        let _op = self.inner.lifecycle.admit()?;
        Ok(self.inner.coordinator.persisted_keys())
    }

    /// Snapshot of store activity.
    #[must_use]
    pub fn stats(&self) -> StoreStats {
        let inner = &self.inner;
        StoreStats {
            queue_depth: inner.worker.lock().as_ref().map_or(0, |w| w.queue_depth()),
            cached_documents: inner.cache.len(),
            persisted_keys: inner.coordinator.persisted_keys().len(),
            ..inner.counters.snapshot()
        }
    }

    /// The configuration the store was opened with.
    #[must_use]
    pub fn config(&self) -> &StoreConfig {
        &self.inner.config
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> StoreState {
        self.inner.lifecycle.state()
    }

    /// Whether the store accepts operations.
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.state() == StoreState::Open
    }

    /// Closes the store.
    ///
    /// New operations fail with [`StoreError::Closed`] immediately.
    /// Operations already admitted run to completion (bounded by
    /// `drain_timeout`), then the worker drains its queue and stops and the
    /// cache is cleared. Closing a closed store does nothing.
    ///
    /// # Errors
    ///
    /// Returns an error only if the worker thread could not be joined.
    pub async fn close(&self) -> Result<()> {
        let inner = &self.inner;
        let _transition = inner.transition.lock().await;
        if !inner.lifecycle.begin_close() {
            return Ok(());
        }

        let drained = inner
            .lifecycle
            .wait_for_drain(inner.config.drain_timeout, inner.config.poll_interval)
            .await;
        if !drained {
            warn!(
                in_flight = inner.lifecycle.in_flight_count(),
                "drain timeout expired with operations still in flight"
            );
        }

        let worker = inner.worker.lock().take();
        if let Some(worker) = worker {
            tokio::task::spawn_blocking(move || worker.stop())
                .await
                .map_err(join_error)?;
        }
        inner.cache.clear();
        inner.lifecycle.finish_close();
        info!(root = %inner.config.root_dir.display(), "document store closed");
        Ok(())
    }

    /// Reopens a closed store with a fresh worker and an empty cache.
    ///
    /// The persisted key set is rebuilt from the backend, so documents written
    /// while the store was closed are picked up and removed ones are forgotten.
    /// Reopening an open store does nothing.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Closed`] if a close is still in progress, or an
    /// error if key discovery or worker start-up fails.
    pub async fn reopen(&self) -> Result<()> {
        let inner = &self.inner;
        let _transition = inner.transition.lock().await;
        match inner.lifecycle.state() {
            StoreState::Open => return Ok(()),
            StoreState::Draining => return Err(StoreError::Closed),
            StoreState::Closed => {}
        }
        inner.cache.clear();
        inner.discover_keys().await?;
        inner.start_worker()?;
        inner.lifecycle.reopen();
        info!(root = %inner.config.root_dir.display(), "document store reopened");
        Ok(())
    }

    fn defaults(&self) -> &DefaultFields {
        &self.inner.config.default_data
    }
}

impl StoreInner {
    async fn discover_keys(&self) -> Result<()> {
        let backend = Arc::clone(&self.backend);
        let keys = tokio::task::spawn_blocking(move || backend.list_keys())
            .await
            .map_err(join_error)?
            .map_err(StoreError::Discovery)?;
        let usable = keys.into_iter().filter(|key| {
            let ok = validate_key(key).is_ok();
            if !ok {
                warn!(key = %key, "ignoring stored document with unusable key");
            }
            ok
        });
        self.coordinator.sync_persisted(usable);
        Ok(())
    }

    fn start_worker(&self) -> Result<()> {
        let worker = IoWorker::start(
            Arc::clone(&self.backend),
            Arc::clone(&self.coordinator) as Arc<dyn CompletionSink>,
            self.config.poll_interval,
        )?;
        *self.worker.lock() = Some(Arc::new(worker));
        Ok(())
    }

    /// Submits one request for the held key and waits for its outcome.
    async fn round_trip(&self, guard: &KeyGuard, payload: Option<Document>) -> Result<IoOutcome> {
        let worker = self.worker.lock().clone().ok_or(StoreError::Closed)?;
        let token = Token(self.next_token.fetch_add(1, Ordering::Relaxed));
        let pending = guard.expect_completion(token);
        worker.submit(IoRequest {
            token,
            key: guard.key().to_string(),
            payload,
        })?;
        drop(worker);
        pending.wait().await
    }

    /// The stored form of the held key's document, from cache or backend.
    async fn load(&self, guard: &KeyGuard) -> Result<Document> {
        let key = guard.key();
        if let Some(document) = self.cache.lookup(key) {
            self.counters.record_hit();
            return Ok(document);
        }
        self.counters.record_miss();
        self.counters.record_read();
        match self.round_trip(guard, None).await? {
            IoOutcome::Loaded(document) => {
                // A straggler outliving a timed-out close must not repopulate the cache.
                if self.lifecycle.state() == StoreState::Open {
                    self.cache.insert(key, document.clone());
                }
                Ok(document)
            }
            IoOutcome::Failed(source) => {
                self.counters.record_failure();
                Err(StoreError::BackendRead {
                    key: key.to_string(),
                    source,
                })
            }
            // A read request is only ever answered with Loaded or Failed.
            IoOutcome::Stored => Err(StoreError::WorkerGone {
                key: key.to_string(),
            }),
        }
    }

    /// Persists `document` for the held key.
    ///
    /// A cached copy is evicted before the write is queued and put back only
    /// once the write is confirmed, so a caller cancelled mid-write (whose
    /// write still lands) never leaves a stale entry behind.
    async fn store(&self, guard: &KeyGuard, document: &Document) -> Result<()> {
        let key = guard.key();
        let was_cached = self.cache.remove(key).is_some();
        self.counters.record_write();
        match self.round_trip(guard, Some(document.clone())).await? {
            IoOutcome::Stored => {
                if was_cached && self.lifecycle.state() == StoreState::Open {
                    self.cache.insert(key, document.clone());
                }
                Ok(())
            }
            IoOutcome::Failed(source) => {
                self.counters.record_failure();
                Err(StoreError::BackendWrite {
                    key: key.to_string(),
                    source,
                })
            }
            IoOutcome::Loaded(_) => Err(StoreError::WorkerGone {
                key: key.to_string(),
            }),
        }
    }
}

fn join_error(error: tokio::task::JoinError) -> StoreError {
    StoreError::Io(std::io::Error::other(error))
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use docstore_core::EntityRef;
    use serde_json::{json, Value};

    use super::*;
    use crate::backend::MemoryBackend;
    use crate::error::BackendError;

    fn doc(value: Value) -> Document {
        value.as_object().cloned().unwrap()
    }

    async fn memory_store(cache_size: usize) -> (DocumentStore, Arc<MemoryBackend>) {
        let backend = Arc::new(MemoryBackend::new());
        let config = StoreConfig::new("unused")
            .with_default_data(doc(json!({ "prefix": "!" })))
            .with_cache_size(cache_size)
            .with_poll_interval(Duration::from_millis(5));
        let store = DocumentStore::with_backend(config, backend.clone())
            .await
            .unwrap();
        (store, backend)
    }

    #[tokio::test]
    async fn stats_count_hits_misses_and_io() {
        let (store, _backend) = memory_store(4).await;
        let guild = EntityRef::new("1", "One");

        store.put(&guild, doc(json!({ "a": 1 }))).await.unwrap();
        store.get(&guild).await.unwrap(); // miss -> backend read
        store.get(&guild).await.unwrap(); // hit

        let stats = store.stats();
        assert_eq!(stats.backend_writes, 1);
        assert_eq!(stats.backend_reads, 1);
        assert_eq!(stats.cache_misses, 1);
        assert_eq!(stats.cache_hits, 1);
        assert_eq!(stats.failures, 0);
        assert_eq!(stats.cached_documents, 1);
        assert_eq!(stats.persisted_keys, 1);
        assert_eq!(stats.queue_depth, 0);
    }

    #[tokio::test]
    async fn invalid_keys_are_rejected_before_any_io() {
        let (store, backend) = memory_store(4).await;
        let bad = EntityRef::new("../etc", "Escape");

        assert!(matches!(store.get(&bad).await, Err(StoreError::InvalidKey(_))));
        assert!(matches!(
            store.put(&bad, Document::new()).await,
            Err(StoreError::InvalidKey(_))
        ));
        assert!(matches!(
            store.delete(&bad, ["x"]).await,
            Err(StoreError::InvalidKey(_))
        ));
        assert_eq!(backend.reads() + backend.writes(), 0);
    }

    #[tokio::test]
    async fn put_cannot_override_identity_fields() {
        let (store, backend) = memory_store(4).await;
        let guild = EntityRef::new("1", "One");

        let returned = store
            .put(&guild, doc(json!({ "id": "spoofed", "name": "Spoofed", "a": 1 })))
            .await
            .unwrap();
        assert_eq!(returned["id"], json!("1"));
        assert_eq!(returned["name"], json!("One"));

        let stored = backend.snapshot("1").unwrap();
        assert_eq!(stored["id"], json!("1"));
        assert_eq!(stored["name"], json!("One"));
    }

    #[tokio::test]
    async fn replace_discards_previous_fields() {
        let (store, backend) = memory_store(4).await;
        let guild = EntityRef::new("1", "One");
        store.put(&guild, doc(json!({ "a": 1, "b": 2 }))).await.unwrap();

        let replaced = store.replace(&guild, doc(json!({ "c": 3 }))).await.unwrap();
        assert_eq!(
            Value::Object(replaced),
            json!({ "prefix": "!", "c": 3, "id": "1", "name": "One" })
        );
        assert!(!backend.snapshot("1").unwrap().contains_key("a"));
    }

    #[tokio::test]
    async fn keys_and_contains_track_persisted_documents() {
        let (store, backend) = memory_store(4).await;
        backend.insert("seeded", Document::new());
        store.close().await.unwrap();
        store.reopen().await.unwrap();

        store
            .put(&EntityRef::new("b", "B"), Document::new())
            .await
            .unwrap();
        assert_eq!(store.keys().unwrap(), vec!["b", "seeded"]);
        assert!(store.contains(&EntityRef::new("seeded", "S")).unwrap());
        assert!(!store.contains(&EntityRef::new("never", "N")).unwrap());
    }

    #[tokio::test]
    async fn failed_first_write_leaves_key_unknown() {
        let (store, backend) = memory_store(4).await;
        let guild = EntityRef::new("w", "W");
        backend.fail_writes("w");

        let err = store.put(&guild, doc(json!({ "a": 1 }))).await.unwrap_err();
        assert!(matches!(
            err,
            StoreError::BackendWrite {
                source: BackendError::Injected(_),
                ..
            }
        ));
        assert!(!store.contains(&guild).unwrap());
        assert_eq!(store.stats().failures, 1);

        // Reads fall back to defaults instead of hitting the missing document.
        let fresh = store.get(&guild).await.unwrap();
        assert!(!fresh.contains_key("a"));
        assert_eq!(backend.reads(), 0);

        backend.clear_faults();
        store.put(&guild, doc(json!({ "a": 1 }))).await.unwrap();
        assert_eq!(store.get(&guild).await.unwrap()["a"], json!(1));
    }

    #[tokio::test]
    async fn backend_panic_surfaces_as_read_failure() {
        let (store, backend) = memory_store(0).await;
        backend.insert("boom", Document::new());
        backend.panic_on_read("boom");
        store.close().await.unwrap();
        store.reopen().await.unwrap();

        let err = store.get(&EntityRef::new("boom", "B")).await.unwrap_err();
        assert!(matches!(
            err,
            StoreError::BackendRead {
                source: BackendError::Panicked(_),
                ..
            }
        ));

        // The worker survived and keeps serving.
        let other = EntityRef::new("other", "O");
        store.put(&other, doc(json!({ "ok": true }))).await.unwrap();
        assert_eq!(store.get(&other).await.unwrap()["ok"], json!(true));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn read_finishing_after_drain_timeout_is_not_cached() {
        let backend = Arc::new(MemoryBackend::new());
        backend.insert("k", doc(json!({ "a": 1 })));
        let mut config = StoreConfig::new("unused")
            .with_cache_size(4)
            .with_poll_interval(Duration::from_millis(5));
        config.drain_timeout = Duration::from_millis(20);
        let store = DocumentStore::with_backend(config, backend.clone())
            .await
            .unwrap();

        // Stall the worker so the read below sits in the queue past the drain timeout.
        let gate = backend.hold_writes("slow");
        let stalled = {
            let store = store.clone();
            tokio::spawn(async move { store.put(&EntityRef::new("slow", "S"), Document::new()).await })
        };
        while gate.waiting() == 0 {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        let straggler = {
            let store = store.clone();
            tokio::spawn(async move { store.get(&EntityRef::new("k", "K")).await })
        };
        while store.stats().queue_depth == 0 {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }

        let closing = {
            let store = store.clone();
            tokio::spawn(async move { store.close().await })
        };
        tokio::time::sleep(Duration::from_millis(60)).await;
        gate.open();

        closing.await.unwrap().unwrap();
        stalled.await.unwrap().unwrap();
        assert_eq!(straggler.await.unwrap().unwrap()["a"], json!(1));
        assert_eq!(store.state(), StoreState::Closed);
        assert_eq!(store.stats().cached_documents, 0);

        store.reopen().await.unwrap();
        assert_eq!(store.stats().cached_documents, 0);
        let reads = backend.reads();
        store.get(&EntityRef::new("k", "K")).await.unwrap();
        assert_eq!(backend.reads(), reads + 1);
    }

    #[tokio::test]
    async fn close_and_reopen_are_idempotent() {
        let (store, _backend) = memory_store(4).await;
        store.reopen().await.unwrap();
        assert!(store.is_open());

        store.close().await.unwrap();
        store.close().await.unwrap();
        assert_eq!(store.state(), StoreState::Closed);
        assert!(matches!(store.keys(), Err(StoreError::Closed)));

        store.reopen().await.unwrap();
        assert!(store.is_open());
        assert!(store.keys().unwrap().is_empty());
    }
}
