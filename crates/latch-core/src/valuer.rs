//! Lock value producers
//!
//! A `LockValuer` produces the opaque payload attached to a lock entry in
//! the backing store. The payload is metadata for operational visibility
//! ("who holds this lock"), never a correctness mechanism. It is invoked
//! once per acquisition attempt so the annotation stays fresh.

use serde::Serialize;

/// Produces the byte payload to attach to a lock entry.
pub trait LockValuer: Send + Sync {
    fn value(&self) -> Vec<u8>;
}

impl<F> LockValuer for F
where
    F: Fn() -> Vec<u8> + Send + Sync,
{
    fn value(&self) -> Vec<u8> {
        self()
    }
}

/// Default `LockValuer`: serializes a fixed value as JSON.
///
/// Serialization failures degrade to an error-message string rather than
/// failing the acquisition; the payload is informational only.
pub struct JsonLockValuer<T>(pub T);

impl<T> LockValuer for JsonLockValuer<T>
where
    T: Serialize + Send + Sync,
{
    fn value(&self) -> Vec<u8> {
        serde_json::to_vec(&self.0)
            .unwrap_or_else(|e| format!("\"marshalling error: {e}\"").into_bytes())
    }
}
