//! Latch Core - backend-agnostic distributed lock contracts
//!
//! This crate provides the pieces shared by every lock backend:
//! - `DistributedLock` / `SyncManager` traits for named mutual-exclusion
//!   locks backed by an external coordination store
//! - Error taxonomy comparable by kind (`LockError`, `StoreError`)
//! - Lock state machinery (`StateCell`, `LostWatch`) implementing the
//!   wake-all-waiters / re-check-the-predicate pattern over
//!   `tokio::sync::watch`
//! - `LockValuer` metadata producers for lock annotations
//! - Lock-based leader election (`leadership`)
//!
//! Locks prefer liveness over safety: once acquisition is started the
//! lock keeps trying to acquire and re-acquire in the background until
//! `release()` is called, and an acquired lock can be revoked at any
//! time by session expiry, store restarts or operator intervention.
//! Holders must watch [`DistributedLock::lost`] and stop dependent work
//! when it fires.

pub mod error;
pub mod leadership;
pub mod state;
pub mod valuer;

use std::sync::Arc;

use async_trait::async_trait;

pub use error::{LockError, StoreError};
pub use leadership::Leadership;
pub use state::{LockState, LostWatch, StateSnapshot};
pub use valuer::{JsonLockValuer, LockValuer};

/// Per-lock options applied when a key is first requested from a
/// manager. Later requests for the same key return the existing lock and
/// ignore these.
#[derive(Clone, Default)]
pub struct LockOption {
    /// Metadata producer for the store-visible lock annotation. `None`
    /// falls back to the manager's default JSON valuer.
    pub valuer: Option<Arc<dyn LockValuer>>,
}

impl LockOption {
    pub fn with_valuer(valuer: Arc<dyn LockValuer>) -> Self {
        Self {
            valuer: Some(valuer),
        }
    }
}

/// A named distributed mutual-exclusion lock.
///
/// Blocking operations are bounded by the caller: wrap them in
/// `tokio::time::timeout` (or race them in `select!`) and drop the
/// future to abandon a wait. Abandoning a wait never stops the
/// background acquisition loop; only [`release`](Self::release) does.
#[async_trait]
pub trait DistributedLock: Send + Sync {
    /// The unique identifier of the lock.
    fn key(&self) -> &str;

    /// Starts the acquisition loop if needed and blocks until the lock
    /// is acquired. Transient acquisition errors are retried
    /// internally and never surface here; a `Cancelled` result means a
    /// racing `release()` stopped the loop mid-wait.
    ///
    /// A pairing `release()` is required regardless of the outcome.
    async fn lock(&self) -> Result<(), LockError>;

    /// Like [`lock`](Self::lock) but additionally stops waiting when
    /// acquisition is in an error state, returning that error -
    /// routinely `LockUnavailable` or `SessionUnavailable` when polling
    /// for leadership.
    async fn try_lock(&self) -> Result<(), LockError>;

    /// Stops the acquisition loop and releases the lock if held.
    /// Idempotent; a no-op when the loop was never started. A later
    /// `lock()`/`try_lock()` starts fresh.
    async fn release(&self) -> Result<(), LockError>;

    /// Handle observing involuntary loss of the current acquisition.
    /// Fired exactly once per loss; a fresh handle is armed on the next
    /// successful acquisition. There is no need to re-invoke `lock()`
    /// after a loss - the loop re-acquires on its own - but dependent
    /// work must stop until it does.
    fn lost(&self) -> LostWatch;
}

/// Registry of [`DistributedLock`]s keyed by name.
///
/// At most one lock object exists per distinct key per manager;
/// requesting a seen key returns the identical instance.
#[async_trait]
pub trait SyncManager: Send + Sync {
    /// Returns the lock registered under `key`, creating it with the
    /// given options on first request. Safe to call concurrently.
    fn lock_with(&self, key: &str, opt: LockOption) -> Result<Arc<dyn DistributedLock>, LockError>;

    /// [`lock_with`](Self::lock_with) with default options.
    fn lock(&self, key: &str) -> Result<Arc<dyn DistributedLock>, LockError> {
        self.lock_with(key, LockOption::default())
    }

    /// Idempotent; backends with lazy session setup treat this as a
    /// no-op so the coordination store is only contacted once a lock is
    /// actually used.
    async fn start(&self) -> Result<(), LockError>;

    /// Rejects further `lock()` calls and releases every tracked lock,
    /// collecting release failures into one aggregate error.
    async fn stop(&self) -> Result<(), LockError>;
}
