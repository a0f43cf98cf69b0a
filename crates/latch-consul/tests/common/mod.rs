//! In-memory Consul stand-in for lock state-machine tests
//!
//! Implements `ConsulApi` with real session attribution, lock-delay and
//! index-based blocking reads, so two managers can compete over one
//! shared store the way two processes compete over one Consul cluster.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::watch;

use latch_consul::client::ConsulApi;
use latch_consul::model::{KvPair, ReadOptions, ReadResult, Session, SessionCreateRequest};
use latch_core::StoreError;

#[derive(Clone)]
struct Entry {
    value: Vec<u8>,
    flags: u64,
    session: Option<String>,
    /// Lock-delay grace period after a session invalidation
    delay_until: Option<Instant>,
}

struct Inner {
    sessions: HashMap<String, String>,
    entries: HashMap<String, Entry>,
    index: u64,
    next_session: u64,
}

pub struct MemoryConsul {
    inner: Mutex<Inner>,
    notify: watch::Sender<u64>,
    lock_delay: Duration,
    failing: AtomicBool,
}

impl MemoryConsul {
    pub fn new(lock_delay: Duration) -> Self {
        let (notify, _) = watch::channel(0);
        Self {
            inner: Mutex::new(Inner {
                sessions: HashMap::new(),
                entries: HashMap::new(),
                index: 1,
                next_session: 1,
            }),
            notify,
            lock_delay,
            failing: AtomicBool::new(false),
        }
    }

    /// Simulate a store outage: session and release operations error.
    pub fn set_failing(&self, fail: bool) {
        self.failing.store(fail, Ordering::SeqCst);
    }

    /// Operator intervention: delete the key out from under its holder.
    pub fn delete_key(&self, key: &str) {
        let mut inner = self.inner.lock();
        if inner.entries.remove(key).is_some() {
            self.bump(&mut inner);
        }
    }

    /// External session invalidation: every session disappears and the
    /// keys they held enter the lock-delay grace period.
    pub fn destroy_all_sessions(&self) {
        let mut inner = self.inner.lock();
        inner.sessions.clear();
        let delay_until = Instant::now() + self.lock_delay;
        for entry in inner.entries.values_mut() {
            if entry.session.take().is_some() {
                entry.delay_until = Some(delay_until);
            }
        }
        self.bump(&mut inner);
    }

    /// Seed an entry held by a foreign session with arbitrary flags,
    /// e.g. a semaphore colliding with a lock key.
    pub fn put_held(&self, key: &str, flags: u64) {
        let mut inner = self.inner.lock();
        let id = format!("foreign-{}", inner.next_session);
        inner.next_session += 1;
        inner.sessions.insert(id.clone(), "foreign".to_string());
        inner.entries.insert(
            key.to_string(),
            Entry {
                value: Vec::new(),
                flags,
                session: Some(id),
                delay_until: None,
            },
        );
        self.bump(&mut inner);
    }

    pub fn session_count(&self) -> usize {
        self.inner.lock().sessions.len()
    }

    fn bump(&self, inner: &mut Inner) {
        inner.index += 1;
        self.notify.send_replace(inner.index);
    }

    fn snapshot(&self, inner: &Inner, key: &str) -> ReadResult {
        let pair = inner.entries.get(key).map(|entry| KvPair {
            key: key.to_string(),
            create_index: 0,
            modify_index: inner.index,
            lock_index: 0,
            flags: entry.flags,
            value: Some(entry.value.clone()),
            session: entry.session.clone(),
        });
        ReadResult {
            pair,
            index: inner.index,
        }
    }
}

#[async_trait]
impl ConsulApi for MemoryConsul {
    async fn create_session(&self, req: &SessionCreateRequest) -> Result<String, StoreError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(StoreError::Connection("store unreachable".to_string()));
        }
        let mut inner = self.inner.lock();
        let id = format!("session-{}", inner.next_session);
        inner.next_session += 1;
        inner.sessions.insert(id.clone(), req.name.clone());
        Ok(id)
    }

    async fn renew_session(&self, id: &str) -> Result<Option<Session>, StoreError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(StoreError::Connection("store unreachable".to_string()));
        }
        let inner = self.inner.lock();
        Ok(inner.sessions.get(id).map(|name| Session {
            id: id.to_string(),
            name: name.clone(),
            ttl: String::new(),
            behavior: "delete".to_string(),
        }))
    }

    async fn destroy_session(&self, id: &str) -> Result<bool, StoreError> {
        let mut inner = self.inner.lock();
        if inner.sessions.remove(id).is_none() {
            return Ok(false);
        }
        let delay_until = Instant::now() + self.lock_delay;
        for entry in inner.entries.values_mut() {
            if entry.session.as_deref() == Some(id) {
                entry.session = None;
                entry.delay_until = Some(delay_until);
            }
        }
        self.bump(&mut inner);
        Ok(true)
    }

    async fn acquire_key(
        &self,
        key: &str,
        session: &str,
        flags: u64,
        value: &[u8],
    ) -> Result<bool, StoreError> {
        let mut inner = self.inner.lock();
        if !inner.sessions.contains_key(session) {
            return Err(StoreError::Server {
                status: 500,
                message: format!("invalid session \"{session}\""),
            });
        }
        if let Some(entry) = inner.entries.get(key) {
            match &entry.session {
                Some(owner) if owner != session => return Ok(false),
                None => {
                    if let Some(until) = entry.delay_until {
                        if until > Instant::now() {
                            return Ok(false);
                        }
                    }
                }
                _ => {}
            }
        }
        inner.entries.insert(
            key.to_string(),
            Entry {
                value: value.to_vec(),
                flags,
                session: Some(session.to_string()),
                delay_until: None,
            },
        );
        self.bump(&mut inner);
        Ok(true)
    }

    async fn release_key(&self, key: &str, session: &str, _flags: u64) -> Result<bool, StoreError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(StoreError::Connection("store unreachable".to_string()));
        }
        let mut inner = self.inner.lock();
        match inner.entries.get_mut(key) {
            Some(entry) if entry.session.as_deref() == Some(session) => {
                entry.session = None;
                entry.delay_until = None;
                self.bump(&mut inner);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn get_key(&self, key: &str, opts: &ReadOptions) -> Result<ReadResult, StoreError> {
        let mut rx = self.notify.subscribe();
        let deadline = opts.wait.map(|wait| tokio::time::Instant::now() + wait);
        loop {
            {
                let inner = self.inner.lock();
                if opts.index == 0 || inner.index > opts.index {
                    return Ok(self.snapshot(&inner, key));
                }
            }
            match deadline {
                Some(deadline) => {
                    if tokio::time::timeout_at(deadline, rx.changed()).await.is_err() {
                        let inner = self.inner.lock();
                        return Ok(self.snapshot(&inner, key));
                    }
                }
                None => {
                    let inner = self.inner.lock();
                    return Ok(self.snapshot(&inner, key));
                }
            }
        }
    }
}
