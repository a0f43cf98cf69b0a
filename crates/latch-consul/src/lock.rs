//! Consul-backed distributed lock
//!
//! The lock keeps one background loop per key: obtain the shared
//! session, attempt an atomic acquire of the lock entry, watch the entry
//! with blocking reads while another session holds it, and monitor
//! ownership after acquisition. The session is created and renewed
//! outside the lock (see the manager); locks only consume it and restart
//! their attempt whenever it changes underneath them.
//!
//! Consul sessions prefer liveness over safety: it is NOT safe to assume
//! the lock is held until `release()`. Holders must watch `lost()`.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::debug;

use latch_core::state::StateCell;
use latch_core::{DistributedLock, LockError, LockValuer, LostWatch};

use crate::client::ConsulApi;
use crate::manager::SessionHandle;
use crate::model::ReadOptions;

/// Magic flag set on every lock entry. Detects collisions between lock
/// keys and unrelated KV use of the same key.
pub const LOCK_FLAG: u64 = 0x275f_2b61_0e0c_3019;

/// Tuning for a Consul lock's acquisition loop
#[derive(Clone, Debug)]
pub struct ConsulLockOption {
    /// How long each blocking read may wait server-side while watching
    /// the lock entry
    pub query_wait_time: Duration,
    /// Pause after a retryable store error
    pub retry_delay: Duration,
}

impl Default for ConsulLockOption {
    fn default() -> Self {
        Self {
            query_wait_time: Duration::from_secs(600),
            retry_delay: Duration::from_secs(2),
        }
    }
}

impl ConsulLockOption {
    pub fn with_query_wait_time(mut self, wait: Duration) -> Self {
        self.query_wait_time = wait;
        self
    }

    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }
}

#[derive(Default)]
struct LoopCtl {
    stop_tx: Option<watch::Sender<bool>>,
    task: Option<JoinHandle<()>>,
    /// Session last used for an acquisition attempt; release uses it
    /// even after the session provider moved on.
    last_session: String,
}

struct LockShared {
    key: String,
    valuer: Arc<dyn LockValuer>,
    opt: ConsulLockOption,
    api: Arc<dyn ConsulApi>,
    session: SessionHandle,
    state: StateCell,
    ctl: Mutex<LoopCtl>,
}

/// Distributed lock backed by a Consul session-attributed KV entry.
pub struct ConsulLock {
    shared: Arc<LockShared>,
}

impl ConsulLock {
    pub(crate) fn new(
        api: Arc<dyn ConsulApi>,
        key: String,
        valuer: Arc<dyn LockValuer>,
        opt: ConsulLockOption,
        session: SessionHandle,
    ) -> Self {
        Self {
            shared: Arc::new(LockShared {
                key,
                valuer,
                opt,
                api,
                session,
                state: StateCell::new(),
                ctl: Mutex::new(LoopCtl::default()),
            }),
        }
    }

    fn ensure_loop(&self) {
        let mut ctl = self.shared.ctl.lock();
        if ctl.stop_tx.is_some() {
            return;
        }
        let (stop_tx, stop_rx) = watch::channel(false);
        self.shared.state.start_loop();
        let shared = self.shared.clone();
        ctl.task = Some(tokio::spawn(lock_loop(shared, stop_rx)));
        ctl.stop_tx = Some(stop_tx);
    }
}

#[async_trait]
impl DistributedLock for ConsulLock {
    fn key(&self) -> &str {
        &self.shared.key
    }

    async fn lock(&self) -> Result<(), LockError> {
        self.ensure_loop();
        self.shared.state.wait_acquired().await
    }

    async fn try_lock(&self) -> Result<(), LockError> {
        self.ensure_loop();
        self.shared.state.wait_acquired_or_err().await
    }

    async fn release(&self) -> Result<(), LockError> {
        let (stop_tx, task, last_session) = {
            let mut ctl = self.shared.ctl.lock();
            let Some(stop_tx) = ctl.stop_tx.take() else {
                return Ok(());
            };
            (stop_tx, ctl.task.take(), std::mem::take(&mut ctl.last_session))
        };
        let _ = stop_tx.send(true);
        if let Some(task) = task {
            let _ = task.await;
        }

        // release the entry explicitly if a session was ever attached
        if !last_session.is_empty() {
            self.shared
                .api
                .release_key(&self.shared.key, &last_session, LOCK_FLAG)
                .await
                .map_err(LockError::from)?;
        }
        Ok(())
    }

    fn lost(&self) -> LostWatch {
        self.shared.state.lost()
    }
}

/// Main loop maintaining the lock. The state moves between `Acquired`
/// and `Error` until the loop is stopped by `release()`.
async fn lock_loop(shared: Arc<LockShared>, mut stop_rx: watch::Receiver<bool>) {
    let mut session_rx = shared.session.subscribe();
    loop {
        if *stop_rx.borrow() {
            break;
        }

        if let Err(e) = shared.session.ensure_started() {
            // manager stopped; hold the error until released
            shared.state.set_error(e);
            let _ = stop_rx.wait_for(|stop| *stop).await;
            break;
        }

        // grab the current session, blocking until one exists.
        // Note: the previously used session is kept for release() even
        // when this fails.
        let result = tokio::select! {
            result = session_rx.wait_for(|id| !id.is_empty()) => match result {
                Ok(id) => Ok(id.clone()),
                Err(_) => Err(()),
            },
            _ = stop_rx.wait_for(|stop| *stop) => break,
        };
        let session = match result {
            Ok(id) => id,
            Err(()) => {
                shared.state.set_error(LockError::SessionUnavailable);
                let _ = stop_rx.wait_for(|stop| *stop).await;
                break;
            }
        };
        shared.ctl.lock().last_session = session.clone();

        // try to acquire, abandoning the attempt if the session changes
        let attempt = tokio::select! {
            result = acquire_lock(&shared, &session) => result,
            _ = session_rx.changed() => continue,
            _ = stop_rx.wait_for(|stop| *stop) => break,
        };
        match attempt {
            Ok(()) => {
                debug!("acquired lock [{}]", shared.key);
                shared.state.set_acquired();
            }
            Err(err) => {
                let conflict = err == LockError::KeyConflict;
                shared.state.set_error(err);
                if conflict {
                    // configuration bug, not a transient condition: do
                    // not retry until something changes
                    tokio::select! {
                        _ = session_rx.changed() => {}
                        _ = stop_rx.wait_for(|stop| *stop) => break,
                    }
                } else {
                    tokio::select! {
                        _ = sleep(shared.opt.retry_delay) => {}
                        _ = stop_rx.wait_for(|stop| *stop) => break,
                    }
                }
                continue;
            }
        }

        // up to this point we hold the lock; monitor ownership until it
        // is lost, the session changes underneath us, or we are stopped
        tokio::select! {
            cause = monitor_lock(&shared, &session) => {
                debug!("lost lock [{}] - {}", shared.key, cause);
                shared.state.lose(cause);
            }
            _ = session_rx.changed() => {
                debug!("lost lock [{}] - session changed", shared.key);
                shared.state.lose(LockError::SessionUnavailable);
            }
            _ = stop_rx.wait_for(|stop| *stop) => break,
        }
    }

    shared.state.fire_lost();
    shared.state.reset();
}

/// One acquisition attempt: acquire, or watch the entry with blocking
/// reads until it frees up, then acquire again. Returns only on success
/// or a non-retryable error; transient failures surface as the lock's
/// `Error` state and are retried here.
async fn acquire_lock(shared: &Arc<LockShared>, session: &str) -> Result<(), LockError> {
    let mut wait_index: u64 = 0;
    loop {
        let value = shared.valuer.value();
        match shared
            .api
            .acquire_key(&shared.key, session, LOCK_FLAG, &value)
            .await
        {
            Ok(true) => return Ok(()),
            Ok(false) => {}
            Err(e) if e.is_retryable() => {
                shared.state.set_error(e.into());
                sleep(shared.opt.retry_delay).await;
                continue;
            }
            Err(e) => return Err(e.into()),
        }

        // refused: watch the entry until it is free or already ours
        loop {
            let opts = ReadOptions {
                index: wait_index,
                wait: Some(shared.opt.query_wait_time),
                consistent: true,
            };
            match shared.api.get_key(&shared.key, &opts).await {
                Ok(result) => {
                    if let Some(pair) = &result.pair {
                        if pair.flags != LOCK_FLAG {
                            return Err(LockError::KeyConflict);
                        }
                    }
                    match result.pair.as_ref().and_then(|p| p.session.as_deref()) {
                        // nobody holds it; retry the acquire
                        None => break,
                        // held by our own session from an earlier attempt
                        Some(owner) if owner == session => return Ok(()),
                        Some(_) => {
                            shared.state.set_error(LockError::LockUnavailable);
                            wait_index = result.index;
                        }
                    }
                }
                Err(e) if e.is_retryable() => {
                    shared.state.set_error(e.into());
                    sleep(shared.opt.retry_delay).await;
                    wait_index = 0;
                }
                Err(e) => return Err(e.into()),
            }
        }

        // the entry may be inside its lock-delay grace period; pause
        // before competing again
        sleep(shared.opt.retry_delay).await;
    }
}

/// Monitors ownership of an acquired lock with index-pinned consistent
/// reads. Returns the loss cause; cancellation happens at the caller.
async fn monitor_lock(shared: &Arc<LockShared>, session: &str) -> LockError {
    let mut wait_index: u64 = 0;
    loop {
        let opts = ReadOptions {
            index: wait_index,
            wait: Some(shared.opt.query_wait_time),
            consistent: true,
        };
        match shared.api.get_key(&shared.key, &opts).await {
            Ok(result) => match &result.pair {
                Some(pair) if pair.session.as_deref() == Some(session) => {
                    // still ours; keep long-polling on the entry
                    wait_index = result.index;
                }
                // revoked or deleted from under us
                _ => return LockError::LockUnavailable,
            },
            Err(e) if e.is_retryable() => {
                sleep(shared.opt.retry_delay).await;
                wait_index = 0;
            }
            Err(e) => return e.into(),
        }
    }
}
