//! Redis quorum-backed distributed lock
//!
//! There is no shared session here: each lock owns its own lease. An
//! acquisition claims the key on a majority of independent instances
//! within the lease's validity window; the monitor then keeps extending
//! the lease at half its remaining time until extension stops winning a
//! majority, at which point the loop waits out the expiry and declares
//! the lock lost.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use rand::Rng;
use rand::distr::Alphanumeric;
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep, timeout};
use tracing::debug;

use latch_core::state::StateCell;
use latch_core::{DistributedLock, LockError, LockValuer, LostWatch, StoreError};

use crate::store::LockStore;

/// Tuning for Redis-backed locks
#[derive(Clone, Debug)]
pub struct RedisSyncOption {
    /// Name used to annotate lock values for operators
    pub name: String,
    /// How long an acquired lease lasts if the holder crashes; the
    /// monitor extends it well before expiry
    pub auto_expiry: Duration,
    /// Pause after a failed acquisition attempt
    pub retry_delay: Duration,
    /// Per-instance command timeout as a fraction of `auto_expiry`
    pub timeout_factor: f64,
    /// Failed extension attempts tolerated before waiting out the lease
    pub max_extend_retries: u32,
}

impl Default for RedisSyncOption {
    fn default() -> Self {
        Self {
            name: "latch".to_string(),
            auto_expiry: Duration::from_secs(10),
            retry_delay: Duration::from_millis(500),
            timeout_factor: 0.05,
            max_extend_retries: 3,
        }
    }
}

impl RedisSyncOption {
    pub fn with_name(mut self, name: &str) -> Self {
        self.name = name.to_string();
        self
    }

    pub fn with_auto_expiry(mut self, expiry: Duration) -> Self {
        self.auto_expiry = expiry;
        self
    }

    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    pub fn with_timeout_factor(mut self, factor: f64) -> Self {
        self.timeout_factor = factor;
        self
    }

    pub fn with_max_extend_retries(mut self, retries: u32) -> Self {
        self.max_extend_retries = retries;
        self
    }

    pub(crate) fn command_timeout(&self) -> Duration {
        self.auto_expiry.mul_f64(self.timeout_factor)
    }
}

/// Clock drift allowance subtracted from every validity window.
fn drift(ttl: Duration) -> Duration {
    ttl / 100 + Duration::from_millis(2)
}

#[derive(Default)]
struct LoopCtl {
    stop_tx: Option<watch::Sender<bool>>,
    task: Option<JoinHandle<()>>,
    /// Value written on the last successful acquisition; cleanup
    /// releases it across all instances.
    value: Option<String>,
    /// Lease validity deadline of the current acquisition
    until: Option<Instant>,
}

struct LockShared {
    key: String,
    valuer: Arc<dyn LockValuer>,
    opt: RedisSyncOption,
    stores: Arc<Vec<Arc<dyn LockStore>>>,
    quorum: usize,
    state: StateCell,
    ctl: Mutex<LoopCtl>,
}

/// Distributed lock over a quorum of independent Redis instances.
pub struct RedisLock {
    shared: Arc<LockShared>,
}

impl RedisLock {
    pub(crate) fn new(
        stores: Arc<Vec<Arc<dyn LockStore>>>,
        key: String,
        valuer: Arc<dyn LockValuer>,
        opt: RedisSyncOption,
    ) -> Self {
        let quorum = stores.len() / 2 + 1;
        Self {
            shared: Arc::new(LockShared {
                key,
                valuer,
                opt,
                stores,
                quorum,
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
impl DistributedLock for RedisLock {
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
        let (stop_tx, task) = {
            let mut ctl = self.shared.ctl.lock();
            let Some(stop_tx) = ctl.stop_tx.take() else {
                return Ok(());
            };
            (stop_tx, ctl.task.take())
        };
        let _ = stop_tx.send(true);
        // the loop's cleanup path releases the lease on every instance
        if let Some(task) = task {
            let _ = task.await;
        }
        Ok(())
    }

    fn lost(&self) -> LostWatch {
        self.shared.state.lost()
    }
}

async fn lock_loop(shared: Arc<LockShared>, mut stop_rx: watch::Receiver<bool>) {
    loop {
        if *stop_rx.borrow() {
            break;
        }

        let attempt = tokio::select! {
            result = acquire_quorum(&shared) => result,
            _ = stop_rx.wait_for(|stop| *stop) => break,
        };
        let value = match attempt {
            Ok((value, until)) => {
                debug!("acquired lock [{}]", shared.key);
                {
                    let mut ctl = shared.ctl.lock();
                    ctl.value = Some(value.clone());
                    ctl.until = Some(until);
                }
                shared.state.set_acquired();
                value
            }
            Err(err) => {
                shared.state.set_error(err);
                tokio::select! {
                    _ = sleep(shared.opt.retry_delay) => {}
                    _ = stop_rx.wait_for(|stop| *stop) => break,
                }
                continue;
            }
        };

        tokio::select! {
            cause = monitor_lock(&shared, &value) => {
                debug!("lost lock [{}] - {}", shared.key, cause);
                shared.state.lose(cause);
            }
            _ = stop_rx.wait_for(|stop| *stop) => break,
        }
    }

    // in case the lock is still held, release it explicitly
    let value = shared.ctl.lock().value.take();
    if let Some(value) = value {
        release_quorum(&shared, &value).await;
    }
    shared.state.fire_lost();
    shared.state.reset();
}

/// One acquisition attempt: claim the key on every instance with a
/// fresh value and keep the lease only if a majority accepted inside
/// the validity window.
async fn acquire_quorum(shared: &Arc<LockShared>) -> Result<(String, Instant), LockError> {
    let value = make_value(&*shared.valuer);
    let ttl = shared.opt.auto_expiry;
    let start = Instant::now();

    let attempts: Vec<_> = shared
        .stores
        .iter()
        .map(|store| store.try_acquire(&shared.key, &value, ttl))
        .collect();
    let granted = quorum_count(shared.opt.command_timeout(), attempts).await;

    let elapsed = start.elapsed();
    if granted >= shared.quorum && elapsed + drift(ttl) < ttl {
        Ok((value, start + ttl - drift(ttl)))
    } else {
        // undo partial grants so a competitor is not blocked by them
        release_quorum(shared, &value).await;
        Err(LockError::LockUnavailable)
    }
}

/// Keeps extending the lease at half its remaining validity. Once the
/// remaining window is too short to extend safely, or the retry budget
/// is spent, waits out the expiry and reports the loss.
async fn monitor_lock(shared: &Arc<LockShared>, value: &str) -> LockError {
    let mut failures: u32 = 0;
    let ttl = shared.opt.auto_expiry;
    let command_timeout = shared.opt.command_timeout();
    loop {
        let until = shared.ctl.lock().until.unwrap_or_else(Instant::now);
        let remaining = until.saturating_duration_since(Instant::now());
        let mut wait = remaining / 2;
        let wait_for_expiry = wait < command_timeout || failures >= shared.opt.max_extend_retries;
        if wait_for_expiry {
            wait = remaining;
        }
        sleep(wait).await;
        if wait_for_expiry {
            return LockError::LockUnavailable;
        }

        let start = Instant::now();
        let attempts: Vec<_> = shared
            .stores
            .iter()
            .map(|store| store.extend(&shared.key, value, ttl))
            .collect();
        let granted = quorum_count(command_timeout, attempts).await;
        if granted >= shared.quorum {
            shared.ctl.lock().until = Some(start + ttl - drift(ttl));
            failures = 0;
        } else {
            failures += 1;
            debug!(
                "failed to extend lock [{}] ({}/{})",
                shared.key, failures, shared.opt.max_extend_retries
            );
        }
    }
}

/// Best-effort release on every instance.
async fn release_quorum(shared: &Arc<LockShared>, value: &str) {
    let attempts: Vec<_> = shared
        .stores
        .iter()
        .map(|store| store.release(&shared.key, value))
        .collect();
    quorum_count(shared.opt.command_timeout(), attempts).await;
}

/// Runs per-instance operations concurrently, each bounded by the
/// command timeout, and counts the successes. Instance errors only
/// reduce the count; the quorum decides.
async fn quorum_count(
    command_timeout: Duration,
    attempts: Vec<impl std::future::Future<Output = Result<bool, StoreError>>>,
) -> usize {
    let bounded = attempts.into_iter().map(|attempt| async move {
        match timeout(command_timeout, attempt).await {
            Ok(Ok(granted)) => granted,
            Ok(Err(e)) => {
                debug!("redis instance error: {}", e);
                false
            }
            Err(_) => false,
        }
    });
    futures::future::join_all(bounded)
        .await
        .into_iter()
        .filter(|granted| *granted)
        .count()
}

#[derive(Serialize)]
struct ValueEnvelope {
    metadata: serde_json::Value,
    token: String,
}

/// Builds the `{metadata, token}` value written to the store. The token
/// is regenerated per attempt and is what extend/release check against.
fn make_value(valuer: &dyn LockValuer) -> String {
    let raw = valuer.value();
    let metadata = serde_json::from_slice(&raw)
        .unwrap_or_else(|_| serde_json::Value::String(String::from_utf8_lossy(&raw).into_owned()));
    let token: String = rand::rng()
        .sample_iter(&Alphanumeric)
        .take(16)
        .map(char::from)
        .collect();
    serde_json::to_string(&ValueEnvelope {
        metadata,
        token: token.clone(),
    })
    .unwrap_or(token)
}
