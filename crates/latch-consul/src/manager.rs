//! Consul sync manager: lock registry and shared session provider
//!
//! The manager owns one renewable session shared by all of its locks.
//! Session lifecycle is lazy: nothing talks to Consul until the first
//! `lock()`/`try_lock()` call needs a session. The current session id is
//! published through a watch channel; publishing an empty id reverts
//! waiters to "no session" and doubles as the refresh broadcast telling
//! every lock loop to abandon its current attempt.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use latch_core::{DistributedLock, JsonLockValuer, LockError, LockOption, SyncManager};

use crate::client::ConsulApi;
use crate::lock::{ConsulLock, ConsulLockOption};
use crate::model::{SessionCreateRequest, go_duration};

/// Session tuning for a [`ConsulSyncManager`]
#[derive(Clone, Debug)]
pub struct ConsulSessionOption {
    /// Session name, visible in the Consul API for operators
    pub name: String,
    /// Session TTL; renewed at half this period
    pub ttl: Duration,
    /// Grace period Consul enforces before a lock freed by session
    /// invalidation becomes acquirable again
    pub lock_delay: Duration,
    /// Pause before re-creating a session after a failure
    pub retry_delay: Duration,
}

impl Default for ConsulSessionOption {
    fn default() -> Self {
        Self {
            name: "latch".to_string(),
            ttl: Duration::from_secs(10),
            lock_delay: Duration::from_secs(2),
            retry_delay: Duration::from_secs(2),
        }
    }
}

impl ConsulSessionOption {
    pub fn with_name(mut self, name: &str) -> Self {
        self.name = name.to_string();
        self
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn with_lock_delay(mut self, delay: Duration) -> Self {
        self.lock_delay = delay;
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
}

pub(crate) struct ManagerShared {
    api: Arc<dyn ConsulApi>,
    opt: ConsulSessionOption,
    lock_opt: ConsulLockOption,
    shutdown: AtomicBool,
    session_tx: watch::Sender<String>,
    locks: Mutex<HashMap<String, Arc<ConsulLock>>>,
    loop_ctl: Mutex<LoopCtl>,
}

impl ManagerShared {
    fn publish_session(&self, id: &str) {
        self.session_tx.send_if_modified(|current| {
            if current != id {
                id.clone_into(current);
                true
            } else {
                false
            }
        });
    }

    fn ensure_session_loop(this: &Arc<Self>) -> Result<(), LockError> {
        if this.shutdown.load(Ordering::SeqCst) {
            return Err(LockError::ManagerStopped);
        }
        let mut ctl = this.loop_ctl.lock();
        if ctl.stop_tx.is_none() {
            let (stop_tx, stop_rx) = watch::channel(false);
            ctl.task = Some(tokio::spawn(session_loop(this.clone(), stop_rx)));
            ctl.stop_tx = Some(stop_tx);
        }
        Ok(())
    }
}

/// Handle a lock uses to consume the manager's session: a receiver for
/// the published id plus a hook to lazy-start the session loop. All
/// refresh notifications route through the watch channel; locks never
/// reach back into the manager's internals.
pub(crate) struct SessionHandle {
    rx: watch::Receiver<String>,
    mgr: Weak<ManagerShared>,
}

impl SessionHandle {
    pub(crate) fn subscribe(&self) -> watch::Receiver<String> {
        self.rx.clone()
    }

    pub(crate) fn ensure_started(&self) -> Result<(), LockError> {
        match self.mgr.upgrade() {
            Some(mgr) => ManagerShared::ensure_session_loop(&mgr),
            None => Err(LockError::ManagerStopped),
        }
    }
}

/// Registry of Consul-backed locks sharing one managed session.
pub struct ConsulSyncManager {
    shared: Arc<ManagerShared>,
}

impl ConsulSyncManager {
    pub fn new(api: Arc<dyn ConsulApi>, opt: ConsulSessionOption) -> Self {
        Self::with_lock_defaults(api, opt, ConsulLockOption::default())
    }

    /// Like [`new`](Self::new) with explicit defaults for the locks this
    /// manager hands out.
    pub fn with_lock_defaults(
        api: Arc<dyn ConsulApi>,
        opt: ConsulSessionOption,
        lock_opt: ConsulLockOption,
    ) -> Self {
        let (session_tx, _) = watch::channel(String::new());
        Self {
            shared: Arc::new(ManagerShared {
                api,
                opt,
                lock_opt,
                shutdown: AtomicBool::new(false),
                session_tx,
                locks: Mutex::new(HashMap::new()),
                loop_ctl: Mutex::new(LoopCtl::default()),
            }),
        }
    }

    /// Returns the lock registered under `key`, creating it on first
    /// request. Repeated requests return the identical instance and
    /// ignore `opt`.
    pub fn consul_lock(&self, key: &str, opt: LockOption) -> Result<Arc<ConsulLock>, LockError> {
        if key.is_empty() {
            return Err(LockError::InvalidKey);
        }

        let mut locks = self.shared.locks.lock();
        if self.shared.shutdown.load(Ordering::SeqCst) {
            return Err(LockError::ManagerStopped);
        }
        if let Some(existing) = locks.get(key) {
            return Ok(existing.clone());
        }

        let valuer = opt.valuer.unwrap_or_else(|| {
            Arc::new(JsonLockValuer(serde_json::json!({
                "name": format!("distributed lock - {}", self.shared.opt.name),
            })))
        });
        let session = SessionHandle {
            rx: self.shared.session_tx.subscribe(),
            mgr: Arc::downgrade(&self.shared),
        };
        let lock = Arc::new(ConsulLock::new(
            self.shared.api.clone(),
            key.to_string(),
            valuer,
            self.shared.lock_opt.clone(),
            session,
        ));
        locks.insert(key.to_string(), lock.clone());
        Ok(lock)
    }
}

#[async_trait]
impl SyncManager for ConsulSyncManager {
    fn lock_with(&self, key: &str, opt: LockOption) -> Result<Arc<dyn DistributedLock>, LockError> {
        Ok(self.consul_lock(key, opt)?)
    }

    async fn start(&self) -> Result<(), LockError> {
        // session acquisition is lazy; nothing to do until a lock is used
        Ok(())
    }

    async fn stop(&self) -> Result<(), LockError> {
        self.shared.shutdown.store(true, Ordering::SeqCst);
        let task = {
            let mut ctl = self.shared.loop_ctl.lock();
            if let Some(stop_tx) = ctl.stop_tx.take() {
                let _ = stop_tx.send(true);
            }
            ctl.task.take()
        };
        if let Some(task) = task {
            let _ = task.await;
        }

        let locks: Vec<Arc<ConsulLock>> = self.shared.locks.lock().values().cloned().collect();
        let mut failed = Vec::new();
        for lock in locks {
            if let Err(e) = lock.release().await {
                warn!("failed to release lock [{}]: {}", lock.key(), e);
                failed.push(lock.key().to_string());
            }
        }
        if failed.is_empty() {
            Ok(())
        } else {
            Err(LockError::ReleaseFailed { keys: failed })
        }
    }
}

/// Main loop managing the shared session: create, publish, renew until
/// invalid, clear and start over.
async fn session_loop(shared: Arc<ManagerShared>, mut stop_rx: watch::Receiver<bool>) {
    loop {
        if *stop_rx.borrow() {
            break;
        }

        // a cleared id reverts waiters to "no session" and tells every
        // lock loop to abandon its current attempt
        shared.publish_session("");

        let request = SessionCreateRequest {
            name: shared.opt.name.clone(),
            ttl: go_duration(shared.opt.ttl),
            lock_delay: go_duration(shared.opt.lock_delay),
            behavior: "delete".to_string(),
        };
        let session = match shared.api.create_session(&request).await {
            Ok(id) => id,
            Err(e) => {
                warn!("failed to create session: {}", e);
                tokio::select! {
                    _ = sleep(shared.opt.retry_delay) => {}
                    _ = stop_rx.wait_for(|stop| *stop) => {}
                }
                continue;
            }
        };
        debug!("session established [{}]", session);
        shared.publish_session(&session);

        // blocks until the session is invalid/expired or we are stopped
        keep_session(&shared, &session, &mut stop_rx).await;
    }
    info!("sync manager stopped");
}

/// Renews the session at half its TTL until it is reported gone or the
/// loop is stopped.
async fn keep_session(
    shared: &ManagerShared,
    session: &str,
    stop_rx: &mut watch::Receiver<bool>,
) {
    let period = shared.opt.ttl / 2;
    loop {
        tokio::select! {
            _ = sleep(period) => {}
            _ = stop_rx.wait_for(|stop| *stop) => return,
        }
        match shared.api.renew_session(session).await {
            Ok(Some(_)) => {}
            Ok(None) => {
                warn!("session expired [{}]", session);
                return;
            }
            Err(e) => {
                warn!("session lost: {}", e);
                return;
            }
        }
    }
}
