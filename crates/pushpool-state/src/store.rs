//! The `SharedStore` capability consumed by the connection registry.

use std::time::Duration;

use async_trait::async_trait;

use crate::error::StoreResult;

/// A stored value together with the version it was written at.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Versioned {
    pub version: u64,
    pub value: Vec<u8>,
}

/// Key-value store with atomic compare-and-set, shared by every process in
/// the deployment.
///
/// Versions are opaque and never reused for a key, including after a delete,
/// so a stale `expected` version can never match a recreated entry.
#[async_trait]
pub trait SharedStore: Send + Sync {
    /// Read the current value. `Ok(None)` when the key is absent or expired.
    async fn get(&self, key: &str) -> StoreResult<Option<Versioned>>;

    /// Write `value` only if the current version equals `expected`
    /// (`None` = the key must be absent). Returns `Ok(false)` on a version
    /// mismatch, leaving the stored value untouched.
    async fn compare_and_set(
        &self,
        key: &str,
        expected: Option<u64>,
        value: Vec<u8>,
        ttl: Option<Duration>,
    ) -> StoreResult<bool>;

    /// Remove a key. Returns true if it existed.
    async fn delete(&self, key: &str) -> StoreResult<bool>;
}
