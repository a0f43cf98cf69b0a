//! Latch Consul backend
//!
//! Distributed locks built on Consul's session + KV mechanism, following
//! the leader-election pattern Consul documents: a lock is a KV entry
//! acquired with a session attached, and the entry is only valid while
//! that session lives.
//!
//! ## Modules
//! - `client`: HTTP client for the session and KV APIs (`ConsulApi` is
//!   the substitution seam for tests/embedded stores)
//! - `model`: wire models for sessions, KV pairs and blocking reads
//! - `manager`: lock registry and the shared, lazily started session
//!   provider
//! - `lock`: the per-key acquisition/monitoring state machine
//!
//! One session per manager is shared by all of its locks; locks restart
//! their acquisition whenever the published session changes.

pub mod client;
pub mod lock;
pub mod manager;
pub mod model;

pub use client::{ConsulApi, ConsulClient, ConsulConfig};
pub use lock::{ConsulLock, ConsulLockOption, LOCK_FLAG};
pub use manager::{ConsulSessionOption, ConsulSyncManager};
pub use model::{KvPair, ReadOptions, ReadResult, Session, SessionCreateRequest};
