//! Redis sync manager: lock registry over a fixed set of instances

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::warn;

use latch_core::{DistributedLock, JsonLockValuer, LockError, LockOption, SyncManager};

use crate::lock::{RedisLock, RedisSyncOption};
use crate::store::{LockStore, RedisInstance};

/// Registry of Redis quorum locks. All locks share the same instance
/// set; each lock owns its own lease.
pub struct RedisSyncManager {
    stores: Arc<Vec<Arc<dyn LockStore>>>,
    opt: RedisSyncOption,
    shutdown: AtomicBool,
    locks: Mutex<HashMap<String, Arc<RedisLock>>>,
}

impl RedisSyncManager {
    pub fn new(stores: Vec<Arc<dyn LockStore>>, opt: RedisSyncOption) -> Self {
        Self {
            stores: Arc::new(stores),
            opt,
            shutdown: AtomicBool::new(false),
            locks: Mutex::new(HashMap::new()),
        }
    }

    /// Connects to every instance URL and builds a manager over them.
    pub async fn connect(urls: &[&str], opt: RedisSyncOption) -> Result<Self, LockError> {
        let mut stores: Vec<Arc<dyn LockStore>> = Vec::with_capacity(urls.len());
        for url in urls {
            let instance = RedisInstance::connect(url).await.map_err(LockError::from)?;
            stores.push(Arc::new(instance));
        }
        Ok(Self::new(stores, opt))
    }

    /// Returns the lock registered under `key`, creating it on first
    /// request. Repeated requests return the identical instance and
    /// ignore `opt`.
    pub fn redis_lock(&self, key: &str, opt: LockOption) -> Result<Arc<RedisLock>, LockError> {
        if key.is_empty() {
            return Err(LockError::InvalidKey);
        }

        let mut locks = self.locks.lock();
        if self.shutdown.load(Ordering::SeqCst) {
            return Err(LockError::ManagerStopped);
        }
        if let Some(existing) = locks.get(key) {
            return Ok(existing.clone());
        }

        let valuer = opt.valuer.unwrap_or_else(|| {
            Arc::new(JsonLockValuer(serde_json::json!({
                "name": format!("distributed lock - {}", self.opt.name),
            })))
        });
        let lock = Arc::new(RedisLock::new(
            self.stores.clone(),
            key.to_string(),
            valuer,
            self.opt.clone(),
        ));
        locks.insert(key.to_string(), lock.clone());
        Ok(lock)
    }
}

#[async_trait]
impl SyncManager for RedisSyncManager {
    fn lock_with(&self, key: &str, opt: LockOption) -> Result<Arc<dyn DistributedLock>, LockError> {
        Ok(self.redis_lock(key, opt)?)
    }

    async fn start(&self) -> Result<(), LockError> {
        // locks start their own loops lazily; nothing to do up front
        Ok(())
    }

    async fn stop(&self) -> Result<(), LockError> {
        self.shutdown.store(true, Ordering::SeqCst);

        let locks: Vec<Arc<RedisLock>> = self.locks.lock().values().cloned().collect();
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
