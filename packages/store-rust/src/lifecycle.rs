//! Open/close state machine with in-flight operation tracking.
//!
//! Uses `ArcSwap` for lock-free state transitions and an atomic counter
//! with RAII guards for accurate in-flight operation tracking.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;

use crate::error::StoreError;

/// Store lifecycle state.
///
/// State machine: Open -> Draining -> Closed -> Open (on reopen)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreState {
    /// Accepting operations.
    Open,
    /// Close requested: new operations are rejected, admitted ones finish.
    Draining,
    /// Worker stopped and cache cleared.
    Closed,
}

/// Admits store operations and coordinates draining them on close.
///
/// 1. Every operation calls `admit()` and holds the returned guard
/// 2. `begin_close()` moves to Draining; later `admit()` calls fail
/// 3. `wait_for_drain()` waits until every admitted operation has finished
/// 4. `finish_close()` moves to Closed; `reopen()` moves back to Open
#[derive(Debug)]
pub struct LifecycleController {
    in_flight: Arc<AtomicU64>,
    state: ArcSwap<StoreState>,
}

impl LifecycleController {
    /// Creates a controller in the `Open` state.
    #[must_use]
    pub fn new() -> Self {
        Self {
            in_flight: Arc::new(AtomicU64::new(0)),
            state: ArcSwap::from_pointee(StoreState::Open),
        }
    }

    /// Returns the current state.
    #[must_use]
    pub fn state(&self) -> StoreState {
        **self.state.load()
    }

    /// Registers a new operation.
    ///
    /// The counter is bumped before the state is checked, so an operation
    /// admitted concurrently with `begin_close()` is always seen by
    /// `wait_for_drain()`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Closed`] unless the store is `Open`.
    pub fn admit(&self) -> Result<OperationGuard, StoreError> {
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        let guard = OperationGuard {
            in_flight: Arc::clone(&self.in_flight),
        };
        if self.state() == StoreState::Open {
            Ok(guard)
        } else {
            Err(StoreError::Closed)
        }
    }

    /// Stops admitting operations. Returns `false` if the store was not open.
    pub fn begin_close(&self) -> bool {
        let mut began = false;
        self.state.rcu(|current| {
            began = **current == StoreState::Open;
            if began {
                Arc::new(StoreState::Draining)
            } else {
                Arc::clone(current)
            }
        });
        began
    }

    /// Marks the store fully closed.
    pub fn finish_close(&self) {
        self.state.store(Arc::new(StoreState::Closed));
    }

    /// Moves a closed store back to `Open`. Returns `false` if it was not closed.
    pub fn reopen(&self) -> bool {
        let mut reopened = false;
        self.state.rcu(|current| {
            reopened = **current == StoreState::Closed;
            if reopened {
                Arc::new(StoreState::Open)
            } else {
                Arc::clone(current)
            }
        });
        reopened
    }

    /// Returns the current number of admitted, unfinished operations.
    #[must_use]
    pub fn in_flight_count(&self) -> u64 {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Waits for every admitted operation to finish, up to `timeout`.
    ///
    /// Returns `true` if the store drained, `false` if the timeout expired.
    pub async fn wait_for_drain(&self, timeout: Duration, poll_interval: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            if self.in_flight.load(Ordering::SeqCst) == 0 {
                return true;
            }

            if tokio::time::Instant::now() >= deadline {
                return false;
            }

            tokio::time::sleep(poll_interval).await;
        }
    }
}

impl Default for LifecycleController {
    fn default() -> Self {
        Self::new()
    }
}

/// RAII guard that decrements the in-flight counter when dropped.
///
/// Dropped on every exit path of an operation, including cancellation of
/// the task running it.
#[derive(Debug)]
pub struct OperationGuard {
    in_flight: Arc<AtomicU64>,
}

impl Drop for OperationGuard {
    fn drop(&mut self) {
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}
