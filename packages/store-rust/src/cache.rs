//! Bounded least-recently-used document cache.

use std::num::NonZeroUsize;

use docstore_core::Document;
use lru::LruCache;
use parking_lot::Mutex;

/// In-memory LRU cache of stored documents, keyed by entity id.
///
/// A capacity of 0 disables caching entirely: every method is a no-op and
/// every lookup misses. Cached documents are the stored form, before
/// defaults and identity fields are applied.
pub struct DocumentCache {
    entries: Option<Mutex<LruCache<String, Document>>>,
}

impl DocumentCache {
    /// Creates a cache holding at most `capacity` documents.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: NonZeroUsize::new(capacity).map(|cap| Mutex::new(LruCache::new(cap))),
        }
    }

    /// Whether the cache stores anything at all.
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.entries.is_some()
    }

    /// Maximum number of cached documents (0 when disabled).
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.entries
            .as_ref()
            .map_or(0, |entries| entries.lock().cap().get())
    }

    /// Returns a copy of `key`'s document and marks it most recently used.
    #[must_use]
    pub fn lookup(&self, key: &str) -> Option<Document> {
        self.entries.as_ref()?.lock().get(key).cloned()
    }

    /// Inserts or replaces `key`'s document as most recently used,
    /// evicting the least recently used entry when full.
    pub fn insert(&self, key: &str, document: Document) {
        if let Some(entries) = &self.entries {
            entries.lock().put(key.to_string(), document);
        }
    }

    /// Drops `key`'s cached document, returning it if there was one.
    pub fn remove(&self, key: &str) -> Option<Document> {
        self.entries.as_ref()?.lock().pop(key)
    }

    /// Whether `key` is cached, without touching the recency order.
    #[must_use]
    pub fn contains(&self, key: &str) -> bool {
        self.entries
            .as_ref()
            .is_some_and(|entries| entries.lock().contains(key))
    }

    /// Number of cached documents.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.as_ref().map_or(0, |entries| entries.lock().len())
    }

    /// Whether no documents are cached.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drops every cached document.
    pub fn clear(&self) {
        if let Some(entries) = &self.entries {
            entries.lock().clear();
        }
    }
}
