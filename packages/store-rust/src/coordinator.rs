//! Per-key serialization and completion hand-off between callers and the I/O worker.
//!
//! [`KeyCoordinator`] owns one [`KeySlot`] per key: a fair async mutex that
//! orders logical operations on the key, and a completion cell through which
//! the worker wakes the task waiting on a specific request token.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{oneshot, OwnedMutexGuard};
use tracing::{debug, warn};

use crate::error::StoreError;
use crate::worker::{CompletionSink, IoOutcome, Token};

/// State kept for one key for as long as the store lives.
struct KeySlot {
    /// Fair (FIFO) lock serializing logical operations on the key.
    lock: Arc<tokio::sync::Mutex<()>>,
    /// The request currently awaited on this key, if any.
    waiter: Mutex<Option<Waiter>>,
    /// Whether a document for this key exists in the backend.
    persisted: AtomicBool,
}

impl KeySlot {
    fn new(persisted: bool) -> Self {
        Self {
            lock: Arc::new(tokio::sync::Mutex::new(())),
            waiter: Mutex::new(None),
            persisted: AtomicBool::new(persisted),
        }
    }
}

struct Waiter {
    token: Token,
    tx: oneshot::Sender<(Token, IoOutcome)>,
}

/// Exclusive hold on one key, released when dropped.
///
/// Dropping the guard on any exit path (including task cancellation)
/// releases the key, so an abandoned operation never wedges it.
pub struct KeyGuard {
    key: String,
    slot: Arc<KeySlot>,
    _lock: OwnedMutexGuard<()>,
}

impl KeyGuard {
    /// The key this guard holds.
    #[must_use]
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Whether a document for the held key exists in the backend.
    #[must_use]
    pub fn is_persisted(&self) -> bool {
        self.slot.persisted.load(Ordering::SeqCst)
    }

    /// Registers interest in the outcome of request `token` on the held key.
    ///
    /// Must be called before the request is submitted, so the worker cannot
    /// complete it before anyone is listening.
    #[must_use]
    pub fn expect_completion(&self, token: Token) -> PendingCompletion {
        let (tx, rx) = oneshot::channel();
        let previous = self.slot.waiter.lock().replace(Waiter { token, tx });
        if let Some(previous) = previous {
            // Left behind by a request whose submission failed or whose
            // caller was cancelled; its outcome can no longer be delivered.
            debug!(key = %self.key, stale = %previous.token, "replacing abandoned waiter");
        }
        PendingCompletion {
            key: self.key.clone(),
            token,
            rx,
        }
    }
}

/// A registered, not yet delivered, request outcome.
pub struct PendingCompletion {
    key: String,
    token: Token,
    rx: oneshot::Receiver<(Token, IoOutcome)>,
}

impl PendingCompletion {
    /// The token this completion is bound to.
    #[must_use]
    pub fn token(&self) -> Token {
        self.token
    }

    /// Suspends the calling task until the worker completes this request.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::WorkerGone`] if the worker dropped the request
    /// without delivering an outcome for this exact token.
    pub async fn wait(self) -> Result<IoOutcome, StoreError> {
        match self.rx.await {
            Ok((token, outcome)) if token == self.token => Ok(outcome),
            Ok((token, _)) => {
                warn!(key = %self.key, expected = %self.token, got = %token, "completion token mismatch");
                Err(StoreError::WorkerGone { key: self.key })
            }
            Err(_) => Err(StoreError::WorkerGone { key: self.key }),
        }
    }
}

/// Registry of per-key locks and completion cells.
///
/// Slots are created under one short-lived global guard, so two callers
/// racing on a new key always share the same lock instance. Slots are
/// never removed.
#[derive(Default)]
pub struct KeyCoordinator {
    slots: Mutex<HashMap<String, Arc<KeySlot>>>,
}

impl KeyCoordinator {
    /// Creates an empty coordinator.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes `keys`, as listed by the backend, the complete persisted set.
    ///
    /// Keys not in `keys` lose their persisted flag, so a document removed
    /// while the store was closed reads as unknown again.
    pub fn sync_persisted<I>(&self, keys: I)
    where
        I: IntoIterator<Item = String>,
    {
        let mut slots = self.slots.lock();
        for slot in slots.values() {
            slot.persisted.store(false, Ordering::SeqCst);
        }
        for key in keys {
            slots
                .entry(key)
                .or_insert_with(|| Arc::new(KeySlot::new(true)))
                .persisted
                .store(true, Ordering::SeqCst);
        }
    }

    fn slot(&self, key: &str) -> Arc<KeySlot> {
        let mut slots = self.slots.lock();
        if let Some(slot) = slots.get(key) {
            return Arc::clone(slot);
        }
        let slot = Arc::new(KeySlot::new(false));
        slots.insert(key.to_string(), Arc::clone(&slot));
        slot
    }

    fn existing_slot(&self, key: &str) -> Option<Arc<KeySlot>> {
        self.slots.lock().get(key).cloned()
    }

    /// Acquires `key`'s lock, creating its slot if the key is new.
    ///
    /// Waiters are served in the order they started waiting.
    pub async fn lock_for(&self, key: &str) -> KeyGuard {
        let slot = self.slot(key);
        let lock = Arc::clone(&slot.lock).lock_owned().await;
        KeyGuard {
            key: key.to_string(),
            slot,
            _lock: lock,
        }
    }

    /// Acquires `key`'s lock only if a document for it exists.
    ///
    /// The persisted flag is checked after the lock is held, so an in-flight
    /// first write on the key is waited for rather than raced.
    pub async fn lock_if_persisted(&self, key: &str) -> Option<KeyGuard> {
        let slot = self.existing_slot(key)?;
        let lock = Arc::clone(&slot.lock).lock_owned().await;
        let guard = KeyGuard {
            key: key.to_string(),
            slot,
            _lock: lock,
        };
        guard.is_persisted().then_some(guard)
    }

    /// Whether a document for `key` exists, without taking its lock.
    #[must_use]
    pub fn is_persisted(&self, key: &str) -> bool {
        self.existing_slot(key)
            .is_some_and(|slot| slot.persisted.load(Ordering::SeqCst))
    }

    /// Every key with a persisted document, sorted.
    #[must_use]
    pub fn persisted_keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self
            .slots
            .lock()
            .iter()
            .filter(|(_, slot)| slot.persisted.load(Ordering::SeqCst))
            .map(|(key, _)| key.clone())
            .collect();
        keys.sort();
        keys
    }

    /// Number of keys with a slot, persisted or not.
    #[must_use]
    pub fn slot_count(&self) -> usize {
        self.slots.lock().len()
    }
}

impl CompletionSink for KeyCoordinator {
    fn complete(&self, key: &str, token: Token, outcome: IoOutcome) {
        let Some(slot) = self.existing_slot(key) else {
            warn!(key, %token, "completion for unknown key dropped");
            return;
        };
        // Even if the caller is gone, a completed write means the key exists.
        if matches!(outcome, IoOutcome::Stored) {
            slot.persisted.store(true, Ordering::SeqCst);
        }
        let waiter = {
            let mut cell = slot.waiter.lock();
            match cell.take() {
                Some(waiter) if waiter.token == token => Some(waiter),
                other => {
                    // Not the awaited request: keep the current waiter in place.
                    *cell = other;
                    None
                }
            }
        };
        match waiter {
            // The receiver is gone if the awaiting task was cancelled.
            Some(waiter) => {
                let _ = waiter.tx.send((token, outcome));
            }
            None => warn!(key, %token, "stale completion dropped"),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use docstore_core::Document;

    use super::*;

    #[tokio::test]
    async fn completion_is_delivered_to_matching_token() {
        let coordinator = KeyCoordinator::new();
        let guard = coordinator.lock_for("a").await;
        let pending = guard.expect_completion(Token(7));
        assert_eq!(pending.token(), Token(7));

        coordinator.complete("a", Token(7), IoOutcome::Stored);
        assert!(matches!(pending.wait().await, Ok(IoOutcome::Stored)));
    }

    #[tokio::test]
    async fn stale_completion_does_not_wake_current_request() {
        let coordinator = KeyCoordinator::new();
        let guard = coordinator.lock_for("a").await;
        let pending = guard.expect_completion(Token(2));

        // An outcome for an earlier, abandoned request on the same key.
        coordinator.complete("a", Token(1), IoOutcome::Loaded(Document::new()));

        let waiting = coordinator.slot("a").waiter.lock().as_ref().map(|w| w.token);
        assert_eq!(waiting, Some(Token(2)));

        coordinator.complete("a", Token(2), IoOutcome::Stored);
        assert!(matches!(pending.wait().await, Ok(IoOutcome::Stored)));
    }

    #[tokio::test]
    async fn dropped_waiter_reports_worker_gone() {
        let coordinator = KeyCoordinator::new();
        let guard = coordinator.lock_for("a").await;
        let first = guard.expect_completion(Token(1));
        // Registering a new request abandons the first one.
        let _second = guard.expect_completion(Token(2));
        assert!(matches!(
            first.wait().await,
            Err(StoreError::WorkerGone { .. })
        ));
    }

    #[tokio::test]
    async fn abandoned_write_still_marks_key_persisted() {
        let coordinator = KeyCoordinator::new();
        let guard = coordinator.lock_for("a").await;
        drop(guard.expect_completion(Token(1)));
        drop(guard);
        assert!(!coordinator.is_persisted("a"));

        coordinator.complete("a", Token(1), IoOutcome::Stored);
        assert!(coordinator.is_persisted("a"));
    }

    #[tokio::test]
    async fn completion_for_unknown_key_is_ignored() {
        let coordinator = KeyCoordinator::new();
        coordinator.complete("nobody", Token(1), IoOutcome::Stored);
        assert_eq!(coordinator.slot_count(), 0);
    }

    #[tokio::test]
    async fn lock_serializes_same_key_in_fifo_order() {
        let coordinator = Arc::new(KeyCoordinator::new());
        let order = Arc::new(Mutex::new(Vec::new()));

        let first = coordinator.lock_for("k").await;
        let mut handles = Vec::new();
        for i in 0..5 {
            let coordinator = Arc::clone(&coordinator);
            let order = Arc::clone(&order);
            handles.push(tokio::spawn(async move {
                let _guard = coordinator.lock_for("k").await;
                order.lock().push(i);
            }));
            // Let each task enqueue on the lock before spawning the next.
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        drop(first);
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(*order.lock(), vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn different_keys_do_not_contend() {
        let coordinator = KeyCoordinator::new();
        let _a = coordinator.lock_for("a").await;
        let b = tokio::time::timeout(Duration::from_millis(50), coordinator.lock_for("b")).await;
        assert!(b.is_ok());
    }

    #[tokio::test]
    async fn racing_creators_share_one_slot() {
        let coordinator = Arc::new(KeyCoordinator::new());
        let mut handles = Vec::new();
        for _ in 0..16 {
            let coordinator = Arc::clone(&coordinator);
            handles.push(tokio::spawn(async move {
                let guard = coordinator.lock_for("new").await;
                Arc::as_ptr(&guard.slot) as usize
            }));
        }
        let mut pointers = Vec::new();
        for handle in handles {
            pointers.push(handle.await.unwrap());
        }
        pointers.dedup();
        assert_eq!(pointers.len(), 1);
        assert_eq!(coordinator.slot_count(), 1);
    }

    #[tokio::test]
    async fn lock_if_persisted_skips_unwritten_keys() {
        let coordinator = KeyCoordinator::new();
        assert!(coordinator.lock_if_persisted("a").await.is_none());

        // A slot that exists but was never written still counts as unknown.
        drop(coordinator.lock_for("a").await);
        assert!(coordinator.lock_if_persisted("a").await.is_none());

        {
            let guard = coordinator.lock_for("a").await;
            let pending = guard.expect_completion(Token(1));
            coordinator.complete("a", Token(1), IoOutcome::Stored);
            pending.wait().await.unwrap();
        }
        let guard = coordinator.lock_if_persisted("a").await.unwrap();
        assert_eq!(guard.key(), "a");
        assert!(coordinator.is_persisted("a"));
    }

    #[test]
    fn sync_persisted_lists_sorted_keys() {
        let coordinator = KeyCoordinator::new();
        coordinator.sync_persisted(vec!["b".to_string(), "a".to_string()]);
        assert_eq!(coordinator.persisted_keys(), vec!["a", "b"]);
        assert_eq!(coordinator.slot_count(), 2);
    }

    #[test]
    fn sync_persisted_forgets_keys_no_longer_listed() {
        let coordinator = KeyCoordinator::new();
        coordinator.sync_persisted(vec!["a".to_string(), "b".to_string()]);
        coordinator.sync_persisted(vec!["a".to_string()]);
        assert_eq!(coordinator.persisted_keys(), vec!["a"]);
        assert!(!coordinator.is_persisted("b"));
        // The slot itself survives; only the flag is reset.
        assert_eq!(coordinator.slot_count(), 2);
    }
}
