//! Per-instance Redis lock primitives
//!
//! `LockStore` is the boundary the quorum lock depends on: three atomic
//! operations against one independent Redis instance. The production
//! implementation wraps a `ConnectionManager`; extend and release are
//! check-and-set Lua scripts so another holder's entry is never touched.

use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::Script;

use latch_core::StoreError;

const EXTEND_SCRIPT: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
    return redis.call("PEXPIRE", KEYS[1], ARGV[2])
else
    return 0
end"#;

const RELEASE_SCRIPT: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
    return redis.call("DEL", KEYS[1])
else
    return 0
end"#;

/// Atomic lock operations against a single Redis instance.
#[async_trait]
pub trait LockStore: Send + Sync {
    /// `SET key value NX PX ttl`: claim the key unless someone already
    /// holds it.
    async fn try_acquire(&self, key: &str, value: &str, ttl: Duration)
    -> Result<bool, StoreError>;

    /// Push the key's expiry out by `ttl` if it still carries `value`.
    async fn extend(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, StoreError>;

    /// Delete the key if it still carries `value`.
    async fn release(&self, key: &str, value: &str) -> Result<bool, StoreError>;
}

/// One independent Redis instance of the lock quorum.
pub struct RedisInstance {
    conn: ConnectionManager,
    extend_script: Script,
    release_script: Script,
}

impl RedisInstance {
    pub fn new(conn: ConnectionManager) -> Self {
        Self {
            conn,
            extend_script: Script::new(EXTEND_SCRIPT),
            release_script: Script::new(RELEASE_SCRIPT),
        }
    }

    /// Connect to one instance by URL, e.g. `redis://127.0.0.1:6379`.
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let client = redis::Client::open(url).map_err(store_error)?;
        let conn = client
            .get_connection_manager()
            .await
            .map_err(store_error)?;
        Ok(Self::new(conn))
    }
}

fn store_error(e: redis::RedisError) -> StoreError {
    if e.is_timeout() {
        StoreError::Timeout
    } else if e.is_io_error() || e.is_connection_refusal() || e.is_connection_dropped() {
        StoreError::Connection(e.to_string())
    } else {
        StoreError::Other(e.into())
    }
}

#[async_trait]
impl LockStore for RedisInstance {
    async fn try_acquire(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        let mut conn = self.conn.clone();
        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("NX")
            .arg("PX")
            .arg(ttl.as_millis() as u64)
            .query_async(&mut conn)
            .await
            .map_err(store_error)?;
        Ok(reply.is_some())
    }

    async fn extend(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, StoreError> {
        let mut conn = self.conn.clone();
        let extended: i64 = self
            .extend_script
            .key(key)
            .arg(value)
            .arg(ttl.as_millis() as u64)
            .invoke_async(&mut conn)
            .await
            .map_err(store_error)?;
        Ok(extended != 0)
    }

    async fn release(&self, key: &str, value: &str) -> Result<bool, StoreError> {
        let mut conn = self.conn.clone();
        let deleted: i64 = self
            .release_script
            .key(key)
            .arg(value)
            .invoke_async(&mut conn)
            .await
            .map_err(store_error)?;
        Ok(deleted != 0)
    }
}
