//! In-process shared store.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tracing::debug;

use crate::error::{StoreError, StoreResult};
use crate::store::{SharedStore, Versioned};

#[derive(Debug)]
struct Slot {
    version: u64,
    value: Vec<u8>,
    expires_at: Option<Instant>,
}

impl Slot {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.is_none_or(|at| now < at)
    }
}

#[derive(Debug, Default)]
struct Inner {
    slots: HashMap<String, Slot>,
    /// Store-wide counter so versions are never reused across deletes.
    next_version: u64,
}

/// Process-local [`SharedStore`] backed by a mutex-guarded map.
///
/// Coordinates tasks inside one process only; use it for tests and for
/// single-instance deployments.
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> StoreResult<std::sync::MutexGuard<'_, Inner>> {
        self.inner
            .lock()
            .map_err(|_| StoreError::Unavailable("memory store lock poisoned".to_string()))
    }

    /// Number of live keys (for diagnostics and tests).
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.lock()
            .map(|inner| inner.slots.values().filter(|s| s.is_live(now)).count())
            .unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl SharedStore for MemoryStore {
    async fn get(&self, key: &str) -> StoreResult<Option<Versioned>> {
        let now = Instant::now();
        let mut inner = self.lock()?;
        match inner.slots.get(key) {
            Some(slot) if slot.is_live(now) => Ok(Some(Versioned {
                version: slot.version,
                value: slot.value.clone(),
            })),
            Some(_) => {
                inner.slots.remove(key);
                debug!(%key, "expired entry evicted on read");
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn compare_and_set(
        &self,
        key: &str,
        expected: Option<u64>,
        value: Vec<u8>,
        ttl: Option<Duration>,
    ) -> StoreResult<bool> {
        let now = Instant::now();
        let mut inner = self.lock()?;
        let current = inner
            .slots
            .get(key)
            .filter(|slot| slot.is_live(now))
            .map(|slot| slot.version);
        if current != expected {
            return Ok(false);
        }

        inner.next_version += 1;
        let version = inner.next_version;
        inner.slots.insert(
            key.to_string(),
            Slot {
                version,
                value,
                expires_at: ttl.map(|ttl| now + ttl),
            },
        );
        Ok(true)
    }

    async fn delete(&self, key: &str) -> StoreResult<bool> {
        let now = Instant::now();
        let mut inner = self.lock()?;
        Ok(inner
            .slots
            .remove(key)
            .is_some_and(|slot| slot.is_live(now)))
    }
}
