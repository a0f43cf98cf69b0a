//! Latch Redis backend
//!
//! Distributed locks over a quorum of independent Redis instances: an
//! acquisition claims the key on a majority with `SET NX PX`, and the
//! lease is extended / released with check-and-set scripts keyed on a
//! per-acquisition random token.
//!
//! ## Modules
//! - `store`: per-instance primitives (`LockStore` is the substitution
//!   seam for tests)
//! - `lock`: the per-key acquisition/extension state machine
//! - `manager`: lock registry over a fixed instance set
//!
//! Unlike the Consul backend there is no shared session; every lock
//! maintains its own lease.

pub mod lock;
pub mod manager;
pub mod store;

pub use lock::{RedisLock, RedisSyncOption};
pub use manager::RedisSyncManager;
pub use store::{LockStore, RedisInstance};
