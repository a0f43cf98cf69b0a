//! Lock-based service leader election
//!
//! A `Leadership` wraps one well-known lock per service and keeps a
//! background task competing for it. Leadership is revocable at any
//! time: callers check with [`Leadership::is_leader`] on every decision
//! instead of caching the answer.

use std::sync::{Arc, OnceLock};
use std::time::Duration;

use tokio::sync::watch;
use tracing::{info, warn};

use crate::error::LockError;
use crate::{DistributedLock, SyncManager};

static GLOBAL: OnceLock<Leadership> = OnceLock::new();

/// Well-known leadership lock key for a service.
pub fn leadership_key(service_name: &str) -> String {
    format!("service/{service_name}/leadership")
}

/// Process-wide leadership handle built on a [`DistributedLock`].
pub struct Leadership {
    lock: Arc<dyn DistributedLock>,
    stop_tx: watch::Sender<bool>,
}

impl Leadership {
    /// Obtains the service's leadership lock from `manager` and spawns a
    /// background task that keeps competing for it, logging every
    /// acquisition and loss.
    pub fn start(manager: &dyn SyncManager, service_name: &str) -> Result<Self, LockError> {
        let lock = manager.lock(&leadership_key(service_name))?;
        let (stop_tx, mut stop_rx) = watch::channel(false);

        let task_lock = lock.clone();
        tokio::spawn(async move {
            loop {
                if *stop_rx.borrow() {
                    break;
                }
                let attempt = tokio::select! {
                    r = task_lock.lock() => Some(r),
                    _ = stop_rx.changed() => None,
                };
                match attempt {
                    None => continue,
                    Some(Ok(())) => {
                        info!("acquired leadership [{}]", task_lock.key());
                        let lost = task_lock.lost();
                        tokio::select! {
                            _ = lost.wait() => warn!("lost leadership [{}]", task_lock.key()),
                            _ = stop_rx.changed() => {}
                        }
                    }
                    Some(Err(LockError::Cancelled)) | Some(Err(LockError::ManagerStopped)) => break,
                    Some(Err(e)) => {
                        warn!("leadership lock attempt failed: {}", e);
                        tokio::time::sleep(Duration::from_secs(1)).await;
                    }
                }
            }
        });

        Ok(Self { lock, stop_tx })
    }

    /// Whether this instance currently holds leadership. May flip at any
    /// moment; re-check rather than cache.
    pub async fn is_leader(&self) -> bool {
        self.lock.try_lock().await.is_ok()
    }

    /// The underlying leadership lock.
    pub fn lock(&self) -> &Arc<dyn DistributedLock> {
        &self.lock
    }

    /// Stops competing for leadership and releases the lock.
    pub async fn stop(&self) -> Result<(), LockError> {
        let _ = self.stop_tx.send(true);
        self.lock.release().await
    }
}

/// Installs the process-wide leadership handle. First call wins;
/// repeated initialization is ignored with a warning.
pub fn init(leadership: Leadership) {
    if GLOBAL.set(leadership).is_err() {
        warn!("global leadership already initialized, ignoring");
    }
}

/// The process-wide leadership handle, if [`init`] has run.
pub fn global() -> Result<&'static Leadership, LockError> {
    GLOBAL.get().ok_or(LockError::NotInitialized)
}
