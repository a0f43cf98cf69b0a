//! In-memory Redis instance for quorum lock tests
//!
//! One `MemoryRedis` behaves like one independent instance: expiring
//! entries, value-checked extend/release, and a switchable failure mode
//! to simulate an instance outage.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;

use latch_core::StoreError;
use latch_redis::store::LockStore;

struct Entry {
    value: String,
    expires_at: Instant,
}

pub struct MemoryRedis {
    entries: Mutex<HashMap<String, Entry>>,
    fail: AtomicBool,
}

impl MemoryRedis {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            fail: AtomicBool::new(false),
        }
    }

    /// Simulate an instance outage: every command errors.
    pub fn set_failure(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    pub fn holder(&self, key: &str) -> Option<String> {
        let entries = self.entries.lock();
        entries
            .get(key)
            .filter(|entry| entry.expires_at > Instant::now())
            .map(|entry| entry.value.clone())
    }

    fn check_up(&self) -> Result<(), StoreError> {
        if self.fail.load(Ordering::SeqCst) {
            Err(StoreError::Connection("instance down".to_string()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl LockStore for MemoryRedis {
    async fn try_acquire(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        self.check_up()?;
        let mut entries = self.entries.lock();
        let now = Instant::now();
        match entries.get(key) {
            Some(entry) if entry.expires_at > now && entry.value != value => Ok(false),
            _ => {
                entries.insert(
                    key.to_string(),
                    Entry {
                        value: value.to_string(),
                        expires_at: now + ttl,
                    },
                );
                Ok(true)
            }
        }
    }

    async fn extend(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, StoreError> {
        self.check_up()?;
        let mut entries = self.entries.lock();
        let now = Instant::now();
        match entries.get_mut(key) {
            Some(entry) if entry.expires_at > now && entry.value == value => {
                entry.expires_at = now + ttl;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn release(&self, key: &str, value: &str) -> Result<bool, StoreError> {
        self.check_up()?;
        let mut entries = self.entries.lock();
        match entries.get(key) {
            Some(entry) if entry.value == value => {
                entries.remove(key);
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}
