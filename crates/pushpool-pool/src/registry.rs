//! Shared connection registry.
//!
//! One shared-store entry per [`ConnectionKey`] holds the pool's records.
//! Every mutation is a read → modify → compare-and-set round, retried on
//! version conflicts, so concurrent processes never lose each other's
//! updates and no record is ever leased twice.
//!
//! ```text
//! try_checkout(key)
//!   → sweep idle-expired records, free lease-expired ones
//!     → available record       → lease it            → Reuse
//!     → none, room in pool     → reserve empty slot  → Reserved
//!     → none, pool full        →                       Full
//!   → store error / contention →                       Unpooled
//! ```
//!
//! Store failures never escape: the registry degrades to "nothing
//! available" on checkout and "dropped" on return.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use bytes::Bytes;
use pushpool_core::{ConnectionKey, PoolSettings, unix_millis};
use pushpool_state::{SharedStore, StoreError, StoreResult};
use tracing::{debug, info, warn};

use crate::codec;

/// The registry value stored for one connection key.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PoolEntry {
    /// Next record id to hand out; ids are never reused within an entry.
    pub next_id: u64,
    pub records: Vec<PooledRecord>,
}

/// One pooled connection, or a reserved slot while its first handshake runs.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PooledRecord {
    pub id: u64,
    /// Serialized session; `None` for a slot reserved by a fresh establish.
    pub blob: Option<Bytes>,
    pub last_used_ms: u64,
    pub use_count: u32,
    pub lease: Option<LeaseInfo>,
}

/// Lease metadata persisted alongside a record.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LeaseInfo {
    pub token: u128,
    pub expires_at_ms: u64,
    pub owner: String,
}

impl PooledRecord {
    fn lease_live(&self, now_ms: u64) -> bool {
        self.lease.as_ref().is_some_and(|l| now_ms < l.expires_at_ms)
    }

    fn is_available(&self, now_ms: u64) -> bool {
        self.blob.is_some() && !self.lease_live(now_ms)
    }

    fn held_by(&self, lease: &Lease) -> bool {
        self.id == lease.record_id && self.lease.as_ref().is_some_and(|l| l.token == lease.token)
    }
}

/// Proof of a checkout, held by exactly one in-process task.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Lease {
    pub record_id: u64,
    pub token: u128,
    pub expires_at_ms: u64,
}

/// Result of a single checkout attempt.
#[derive(Debug)]
pub enum Checkout {
    /// An idle record was leased; reconstruct it from `blob`.
    Reuse { lease: Lease, blob: Bytes },
    /// No idle record, but a slot was reserved for a fresh connection.
    Reserved { lease: Lease },
    /// Every slot is leased.
    Full,
    /// The store could not be reached; proceed without pooling.
    Unpooled,
}

/// Per-key counts as currently recorded in the shared store.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Records ready for checkout.
    pub available: usize,
    /// Records (or reserved slots) under a live lease.
    pub leased: usize,
    /// All records, including those whose lease expired.
    pub total: usize,
}

fn lease_token() -> u128 {
    static FALLBACK: AtomicU64 = AtomicU64::new(1);
    let mut buf = [0u8; 16];
    if getrandom::getrandom(&mut buf).is_err() {
        // Uniqueness within the lease lifetime is all a token needs.
        let seq = FALLBACK.fetch_add(1, Ordering::Relaxed);
        buf[..8].copy_from_slice(&unix_millis().to_be_bytes());
        buf[8..].copy_from_slice(&(seq ^ u64::from(std::process::id())).to_be_bytes());
    }
    u128::from_be_bytes(buf)
}

/// Drop idle-expired available records, free records whose lease lapsed and
/// remove reserved slots whose establisher vanished. Returns records removed.
fn normalize(entry: &mut PoolEntry, now_ms: u64, max_idle_ms: u64) -> (usize, bool) {
    let before = entry.records.len();
    let mut freed = false;
    entry.records.retain_mut(|record| {
        if record.lease.is_some() && !record.lease_live(now_ms) {
            record.lease = None;
            freed = true;
        }
        match (&record.blob, &record.lease) {
            (None, None) => false,
            (Some(_), None) => now_ms.saturating_sub(record.last_used_ms) <= max_idle_ms,
            _ => true,
        }
    });
    let removed = before - entry.records.len();
    (removed, freed || removed > 0)
}

/// Cross-process registry of pooled connection records.
///
/// Cheap to clone; clones share the store handle.
#[derive(Clone)]
pub struct Registry {
    store: Arc<dyn SharedStore>,
    settings: Arc<PoolSettings>,
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

impl Registry {
    pub fn new(store: Arc<dyn SharedStore>, settings: PoolSettings) -> Self {
        Self {
            store,
            settings: Arc::new(settings),
        }
    }

    pub fn settings(&self) -> &PoolSettings {
        &self.settings
    }

    fn entry_ttl(&self) -> Duration {
        self.settings.idle_timeout + self.settings.lease_ttl
    }

    fn idle_ms(&self) -> u64 {
        self.settings.idle_timeout.as_millis() as u64
    }

    async fn bounded<T>(&self, op: impl Future<Output = StoreResult<T>>) -> StoreResult<T> {
        let limit = self.settings.store_timeout;
        tokio::time::timeout(limit, op)
            .await
            .map_err(|_| StoreError::Timeout(limit))?
    }

    /// Apply `apply` to the current entry and write it back atomically.
    ///
    /// `apply` may run several times (once per conflicting round) and must
    /// derive everything from the entry it is given. It returns the result
    /// plus whether the entry changed.
    async fn mutate<T>(
        &self,
        key: &ConnectionKey,
        mut apply: impl FnMut(&mut PoolEntry, u64) -> (T, bool),
    ) -> StoreResult<T> {
        let store_key = key.store_key();
        for attempt in 1..=self.settings.cas_retries {
            let current = self.bounded(self.store.get(&store_key)).await?;
            let (version, mut entry, corrupt) = match current {
                Some(versioned) => match codec::decode_entry(&versioned.value) {
                    Ok(entry) => (Some(versioned.version), entry, false),
                    Err(err) => {
                        warn!(%key, error = %err, "discarding undecodable pool entry");
                        (Some(versioned.version), PoolEntry::default(), true)
                    }
                },
                None => (None, PoolEntry::default(), false),
            };

            let (value, dirty) = apply(&mut entry, unix_millis());
            if !dirty && !corrupt {
                return Ok(value);
            }

            let raw = codec::encode_entry(&entry);
            let written = self
                .bounded(self.store.compare_and_set(&store_key, version, raw, Some(self.entry_ttl())))
                .await?;
            if written {
                return Ok(value);
            }
            debug!(%key, attempt, "registry update conflicted, retrying");
        }
        Err(StoreError::Unavailable(format!(
            "{} consecutive update conflicts",
            self.settings.cas_retries
        )))
    }

    /// Atomically lease one available record for `key`.
    ///
    /// Idle-expired records are swept first. Among available records the
    /// most recently used wins, since it is the least likely to have been
    /// closed by the peer.
    pub async fn try_checkout(&self, key: &ConnectionKey) -> Checkout {
        let token = lease_token();
        let lease_ms = self.settings.lease_ttl.as_millis() as u64;
        let max_size = self.settings.max_size;
        let idle_ms = self.idle_ms();
        let owner = self.settings.instance_id.clone();

        let result = self
            .mutate(key, |entry, now| {
                let (swept, mut dirty) = normalize(entry, now, idle_ms);
                if swept > 0 {
                    debug!(%key, swept, "swept expired records during checkout");
                }

                let lease_info = LeaseInfo {
                    token,
                    expires_at_ms: now + lease_ms,
                    owner: owner.clone(),
                };
                let newest = entry
                    .records
                    .iter_mut()
                    .filter(|r| r.is_available(now))
                    .max_by_key(|r| r.last_used_ms);

                if let Some(record) = newest {
                    let lease = Lease {
                        record_id: record.id,
                        token,
                        expires_at_ms: lease_info.expires_at_ms,
                    };
                    record.lease = Some(lease_info);
                    let blob = record.blob.clone().unwrap_or_default();
                    return (Checkout::Reuse { lease, blob }, true);
                }

                if entry.records.len() < max_size {
                    let id = entry.next_id;
                    entry.next_id += 1;
                    entry.records.push(PooledRecord {
                        id,
                        blob: None,
                        last_used_ms: now,
                        use_count: 0,
                        lease: Some(lease_info.clone()),
                    });
                    if entry.records.len() == 1 {
                        info!(%key, "pool created");
                    }
                    dirty = true;
                    let lease = Lease {
                        record_id: id,
                        token,
                        expires_at_ms: lease_info.expires_at_ms,
                    };
                    return (Checkout::Reserved { lease }, dirty);
                }

                (Checkout::Full, dirty)
            })
            .await;

        match result {
            Ok(checkout) => {
                match &checkout {
                    Checkout::Reuse { lease, .. } => {
                        debug!(%key, record = lease.record_id, "leased pooled record")
                    }
                    Checkout::Reserved { lease } => {
                        debug!(%key, record = lease.record_id, "reserved slot for new connection")
                    }
                    _ => {}
                }
                checkout
            }
            Err(err) => {
                warn!(%key, error = %err, "registry checkout failed, continuing unpooled");
                Checkout::Unpooled
            }
        }
    }

    /// Put a used connection back.
    ///
    /// With a live `lease`, the leased record takes the new blob in place.
    /// Otherwise a new record is inserted; when the pool is full the oldest
    /// available record is evicted, and if every record is leased the
    /// connection is declined. Returns whether the blob was stored.
    pub async fn return_connection(
        &self,
        key: &ConnectionKey,
        lease: Option<&Lease>,
        blob: Bytes,
    ) -> bool {
        let max_size = self.settings.max_size;
        let idle_ms = self.idle_ms();

        let result = self
            .mutate(key, |entry, now| {
                if let Some(lease) = lease
                    && let Some(record) = entry.records.iter_mut().find(|r| r.held_by(lease))
                {
                    record.blob = Some(blob.clone());
                    record.last_used_ms = now;
                    record.use_count = record.use_count.saturating_add(1);
                    record.lease = None;
                    return (true, true);
                }

                let (_, mut dirty) = normalize(entry, now, idle_ms);
                if entry.records.len() >= max_size {
                    let oldest = entry
                        .records
                        .iter()
                        .enumerate()
                        .filter(|(_, r)| r.is_available(now))
                        .min_by_key(|(_, r)| r.last_used_ms)
                        .map(|(i, _)| i);
                    match oldest {
                        Some(index) => {
                            let evicted = entry.records.remove(index);
                            debug!(%key, record = evicted.id, "evicted oldest idle record");
                        }
                        None => return (false, dirty),
                    }
                }

                let id = entry.next_id;
                entry.next_id += 1;
                entry.records.push(PooledRecord {
                    id,
                    blob: Some(blob.clone()),
                    last_used_ms: now,
                    use_count: 1,
                    lease: None,
                });
                dirty = true;
                (true, dirty)
            })
            .await;

        match result {
            Ok(stored) => {
                if stored {
                    debug!(%key, "connection returned to pool");
                } else {
                    debug!(%key, "pool full of leased records, connection not returned");
                }
                stored
            }
            Err(err) => {
                warn!(%key, error = %err, "registry return failed, dropping connection");
                false
            }
        }
    }

    /// Release `lease` without returning a record. Idempotent: once the
    /// record is gone, further calls change nothing.
    pub async fn discard(&self, key: &ConnectionKey, lease: &Lease) -> bool {
        let result = self
            .mutate(key, |entry, _now| {
                let before = entry.records.len();
                entry.records.retain(|r| !r.held_by(lease));
                let removed = before != entry.records.len();
                (removed, removed)
            })
            .await;

        match result {
            Ok(removed) => {
                if removed {
                    debug!(%key, record = lease.record_id, "discarded leased record");
                }
                removed
            }
            Err(err) => {
                // The lease expires on its own.
                warn!(%key, error = %err, "registry discard failed");
                false
            }
        }
    }

    /// Remove available records idle for longer than `max_idle`.
    pub async fn sweep_expired(&self, key: &ConnectionKey, max_idle: Duration) -> usize {
        let max_idle_ms = max_idle.as_millis() as u64;
        match self
            .mutate(key, |entry, now| {
                let (removed, dirty) = normalize(entry, now, max_idle_ms);
                (removed, dirty)
            })
            .await
        {
            Ok(removed) => {
                if removed > 0 {
                    info!(%key, removed, "swept expired records");
                }
                removed
            }
            Err(err) => {
                warn!(%key, error = %err, "registry sweep failed");
                0
            }
        }
    }

    /// Read-only snapshot of the pool for `key`.
    pub async fn stats(&self, key: &ConnectionKey) -> StoreResult<PoolStats> {
        let Some(versioned) = self.bounded(self.store.get(&key.store_key())).await? else {
            return Ok(PoolStats::default());
        };
        let entry = codec::decode_entry(&versioned.value)
            .map_err(|e| StoreError::Corrupt(e.to_string()))?;
        let now = unix_millis();
        Ok(PoolStats {
            available: entry.records.iter().filter(|r| r.is_available(now)).count(),
            leased: entry.records.iter().filter(|r| r.lease_live(now)).count(),
            total: entry.records.len(),
        })
    }

    /// Forget every record for `key`. Returns true if an entry existed.
    pub async fn purge(&self, key: &ConnectionKey) -> StoreResult<bool> {
        let existed = self.bounded(self.store.delete(&key.store_key())).await?;
        info!(%key, existed, "pool purged");
        Ok(existed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use pushpool_state::{MemoryStore, Versioned};
    use std::sync::atomic::AtomicBool;

    fn test_key() -> ConnectionKey {
        ConnectionKey::new("gateway.test", 2195, "app.pem")
    }

    fn test_settings() -> PoolSettings {
        PoolSettings {
            max_size: 3,
            idle_timeout: Duration::from_secs(120),
            lease_ttl: Duration::from_secs(60),
            checkout_timeout: Duration::from_millis(200),
            store_timeout: Duration::from_millis(200),
            cas_retries: 4,
            instance_id: "test-instance".to_string(),
        }
    }

    fn make_registry(settings: PoolSettings) -> (Registry, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        (Registry::new(store.clone(), settings), store)
    }

    fn blob(tag: &'static [u8]) -> Bytes {
        Bytes::from_static(tag)
    }

    async fn read_entry(store: &MemoryStore, key: &ConnectionKey) -> PoolEntry {
        let raw = store.get(&key.store_key()).await.unwrap().unwrap();
        codec::decode_entry(&raw.value).unwrap()
    }

    /// Store whose every call fails while `down` is set.
    struct FlakyStore {
        inner: MemoryStore,
        down: AtomicBool,
    }

    #[async_trait]
    impl SharedStore for FlakyStore {
        async fn get(&self, key: &str) -> StoreResult<Option<Versioned>> {
            if self.down.load(Ordering::Relaxed) {
                return Err(StoreError::Unavailable("connection refused".into()));
            }
            self.inner.get(key).await
        }

        async fn compare_and_set(
            &self,
            key: &str,
            expected: Option<u64>,
            value: Vec<u8>,
            ttl: Option<Duration>,
        ) -> StoreResult<bool> {
            if self.down.load(Ordering::Relaxed) {
                return Err(StoreError::Unavailable("connection refused".into()));
            }
            self.inner.compare_and_set(key, expected, value, ttl).await
        }

        async fn delete(&self, key: &str) -> StoreResult<bool> {
            if self.down.load(Ordering::Relaxed) {
                return Err(StoreError::Unavailable("connection refused".into()));
            }
            self.inner.delete(key).await
        }
    }

    // ── Checkout ────────────────────────────────────────────────────

    #[tokio::test]
    async fn empty_pool_reserves_slot() {
        let (registry, store) = make_registry(test_settings());
        let key = test_key();

        let Checkout::Reserved { lease } = registry.try_checkout(&key).await else {
            panic!("expected a reserved slot");
        };
        let entry = read_entry(&store, &key).await;
        assert_eq!(entry.records.len(), 1);
        assert_eq!(entry.records[0].id, lease.record_id);
        assert!(entry.records[0].blob.is_none());
        assert_eq!(entry.records[0].lease.as_ref().unwrap().owner, "test-instance");
    }

    #[tokio::test]
    async fn returned_record_is_reused() {
        let (registry, _) = make_registry(test_settings());
        let key = test_key();

        let Checkout::Reserved { lease } = registry.try_checkout(&key).await else {
            panic!("expected a reserved slot");
        };
        assert!(registry.return_connection(&key, Some(&lease), blob(b"s1")).await);

        match registry.try_checkout(&key).await {
            Checkout::Reuse { lease: second, blob } => {
                assert_eq!(second.record_id, lease.record_id);
                assert_ne!(second.token, lease.token);
                assert_eq!(blob, Bytes::from_static(b"s1"));
            }
            other => panic!("expected reuse, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn leased_record_not_handed_out_twice() {
        let (registry, _) = make_registry(test_settings());
        let key = test_key();
        assert!(registry.return_connection(&key, None, blob(b"only")).await);

        let first = registry.try_checkout(&key).await;
        assert!(matches!(first, Checkout::Reuse { .. }));
        // The single record is leased, so the next caller gets a fresh slot.
        let second = registry.try_checkout(&key).await;
        assert!(matches!(second, Checkout::Reserved { .. }));
    }

    #[tokio::test]
    async fn checkout_prefers_most_recent_record() {
        let (registry, store) = make_registry(test_settings());
        let key = test_key();
        registry.return_connection(&key, None, blob(b"old")).await;
        registry.return_connection(&key, None, blob(b"new")).await;

        // Make "old" unambiguously older.
        let mut entry = read_entry(&store, &key).await;
        entry.records[0].last_used_ms -= 10_000;
        let version = store.get(&key.store_key()).await.unwrap().unwrap().version;
        store
            .compare_and_set(&key.store_key(), Some(version), codec::encode_entry(&entry), None)
            .await
            .unwrap();

        match registry.try_checkout(&key).await {
            Checkout::Reuse { blob, .. } => assert_eq!(blob, Bytes::from_static(b"new")),
            other => panic!("expected reuse, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn full_pool_reports_full() {
        let settings = PoolSettings {
            max_size: 2,
            ..test_settings()
        };
        let (registry, _) = make_registry(settings);
        let key = test_key();

        assert!(matches!(registry.try_checkout(&key).await, Checkout::Reserved { .. }));
        assert!(matches!(registry.try_checkout(&key).await, Checkout::Reserved { .. }));
        assert!(matches!(registry.try_checkout(&key).await, Checkout::Full));
    }

    #[tokio::test]
    async fn expired_lease_makes_record_available_again() {
        let settings = PoolSettings {
            max_size: 1,
            lease_ttl: Duration::from_millis(5),
            ..test_settings()
        };
        let (registry, _) = make_registry(settings);
        let key = test_key();
        registry.return_connection(&key, None, blob(b"s")).await;

        assert!(matches!(registry.try_checkout(&key).await, Checkout::Reuse { .. }));
        assert!(matches!(registry.try_checkout(&key).await, Checkout::Full));

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(matches!(registry.try_checkout(&key).await, Checkout::Reuse { .. }));
    }

    #[tokio::test]
    async fn abandoned_reservation_is_freed_after_lease_expiry() {
        let settings = PoolSettings {
            max_size: 1,
            lease_ttl: Duration::from_millis(5),
            ..test_settings()
        };
        let (registry, store) = make_registry(settings);
        let key = test_key();

        assert!(matches!(registry.try_checkout(&key).await, Checkout::Reserved { .. }));
        tokio::time::sleep(Duration::from_millis(20)).await;

        // The dead reservation is dropped and a new one takes its place.
        let Checkout::Reserved { lease } = registry.try_checkout(&key).await else {
            panic!("expected a new reservation");
        };
        let entry = read_entry(&store, &key).await;
        assert_eq!(entry.records.len(), 1);
        assert_eq!(entry.records[0].id, lease.record_id);
    }

    #[tokio::test]
    async fn store_failure_degrades_to_unpooled() {
        let store = Arc::new(FlakyStore {
            inner: MemoryStore::new(),
            down: AtomicBool::new(true),
        });
        let registry = Registry::new(store.clone(), test_settings());
        let key = test_key();

        assert!(matches!(registry.try_checkout(&key).await, Checkout::Unpooled));
        assert!(!registry.return_connection(&key, None, blob(b"s")).await);
        assert_eq!(registry.sweep_expired(&key, Duration::ZERO).await, 0);
        assert!(registry.stats(&key).await.is_err());

        store.down.store(false, Ordering::Relaxed);
        assert!(matches!(registry.try_checkout(&key).await, Checkout::Reserved { .. }));
    }

    /// Store whose reads sit on the blocking pool for `delay`.
    struct SlowStore {
        inner: MemoryStore,
        delay: Duration,
    }

    #[async_trait]
    impl SharedStore for SlowStore {
        async fn get(&self, key: &str) -> StoreResult<Option<Versioned>> {
            let delay = self.delay;
            tokio::task::spawn_blocking(move || std::thread::sleep(delay))
                .await
                .map_err(|e| StoreError::Unavailable(e.to_string()))?;
            self.inner.get(key).await
        }

        async fn compare_and_set(
            &self,
            key: &str,
            expected: Option<u64>,
            value: Vec<u8>,
            ttl: Option<Duration>,
        ) -> StoreResult<bool> {
            self.inner.compare_and_set(key, expected, value, ttl).await
        }

        async fn delete(&self, key: &str) -> StoreResult<bool> {
            self.inner.delete(key).await
        }
    }

    #[tokio::test]
    async fn slow_store_degrades_to_unpooled_within_store_timeout() {
        let store = Arc::new(SlowStore {
            inner: MemoryStore::new(),
            delay: Duration::from_millis(400),
        });
        let registry = Registry::new(
            store,
            PoolSettings {
                store_timeout: Duration::from_millis(50),
                ..test_settings()
            },
        );

        let started = std::time::Instant::now();
        assert!(matches!(registry.try_checkout(&test_key()).await, Checkout::Unpooled));
        assert!(started.elapsed() < Duration::from_millis(300), "took {:?}", started.elapsed());
    }

    #[tokio::test]
    async fn undecodable_entry_is_replaced() {
        let (registry, store) = make_registry(test_settings());
        let key = test_key();
        store
            .compare_and_set(&key.store_key(), None, vec![0xEE, 1, 2], None)
            .await
            .unwrap();

        assert!(matches!(registry.try_checkout(&key).await, Checkout::Reserved { .. }));
        assert_eq!(read_entry(&store, &key).await.records.len(), 1);
    }

    // ── Return ──────────────────────────────────────────────────────

    #[tokio::test]
    async fn return_in_place_clears_lease_and_counts_use() {
        let (registry, store) = make_registry(test_settings());
        let key = test_key();
        let Checkout::Reserved { lease } = registry.try_checkout(&key).await else {
            panic!("expected a reserved slot");
        };

        assert!(registry.return_connection(&key, Some(&lease), blob(b"s1")).await);
        let entry = read_entry(&store, &key).await;
        assert_eq!(entry.records.len(), 1);
        assert!(entry.records[0].lease.is_none());
        assert_eq!(entry.records[0].use_count, 1);
    }

    #[tokio::test]
    async fn return_with_lost_lease_inserts_new_record() {
        let (registry, store) = make_registry(test_settings());
        let key = test_key();
        let Checkout::Reserved { lease } = registry.try_checkout(&key).await else {
            panic!("expected a reserved slot");
        };
        registry.discard(&key, &lease).await;

        assert!(registry.return_connection(&key, Some(&lease), blob(b"s1")).await);
        let entry = read_entry(&store, &key).await;
        assert_eq!(entry.records.len(), 1);
        assert_ne!(entry.records[0].id, lease.record_id);
    }

    #[tokio::test]
    async fn return_to_full_pool_evicts_oldest_idle() {
        let settings = PoolSettings {
            max_size: 2,
            ..test_settings()
        };
        let (registry, store) = make_registry(settings);
        let key = test_key();

        registry.return_connection(&key, None, blob(b"a")).await;
        registry.return_connection(&key, None, blob(b"b")).await;
        assert!(registry.return_connection(&key, None, blob(b"c")).await);

        let entry = read_entry(&store, &key).await;
        let blobs: Vec<_> = entry.records.iter().map(|r| r.blob.clone().unwrap()).collect();
        assert_eq!(blobs, vec![Bytes::from_static(b"b"), Bytes::from_static(b"c")]);
    }

    #[tokio::test]
    async fn return_declined_when_all_leased() {
        let settings = PoolSettings {
            max_size: 1,
            ..test_settings()
        };
        let (registry, store) = make_registry(settings);
        let key = test_key();
        assert!(matches!(registry.try_checkout(&key).await, Checkout::Reserved { .. }));

        assert!(!registry.return_connection(&key, None, blob(b"extra")).await);
        assert_eq!(read_entry(&store, &key).await.records.len(), 1);
    }

    #[tokio::test]
    async fn pool_never_exceeds_max_size() {
        let settings = PoolSettings {
            max_size: 3,
            ..test_settings()
        };
        let (registry, store) = make_registry(settings);
        let key = test_key();

        for _ in 0..20 {
            registry.return_connection(&key, None, blob(b"s")).await;
            assert!(read_entry(&store, &key).await.records.len() <= 3);
        }
        assert_eq!(registry.stats(&key).await.unwrap().available, 3);
    }

    // ── Discard ─────────────────────────────────────────────────────

    #[tokio::test]
    async fn discard_is_idempotent() {
        let (registry, store) = make_registry(test_settings());
        let key = test_key();
        registry.return_connection(&key, None, blob(b"keep")).await;
        let Checkout::Reuse { lease, .. } = registry.try_checkout(&key).await else {
            panic!("expected reuse");
        };
        registry.return_connection(&key, None, blob(b"other")).await;

        assert!(registry.discard(&key, &lease).await);
        let after_first = read_entry(&store, &key).await;
        assert!(!registry.discard(&key, &lease).await);
        let after_second = read_entry(&store, &key).await;

        assert_eq!(after_first, after_second);
        assert_eq!(after_second.records.len(), 1);
    }

    #[tokio::test]
    async fn discard_with_wrong_token_is_ignored() {
        let (registry, store) = make_registry(test_settings());
        let key = test_key();
        let Checkout::Reserved { lease } = registry.try_checkout(&key).await else {
            panic!("expected a reserved slot");
        };
        let forged = Lease {
            token: lease.token.wrapping_add(1),
            ..lease
        };

        assert!(!registry.discard(&key, &forged).await);
        assert_eq!(read_entry(&store, &key).await.records.len(), 1);
    }

    // ── Sweep / stats / purge ───────────────────────────────────────

    #[tokio::test]
    async fn sweep_removes_idle_records_only() {
        let (registry, _) = make_registry(test_settings());
        let key = test_key();
        registry.return_connection(&key, None, blob(b"idle")).await;
        registry.return_connection(&key, None, blob(b"busy")).await;
        let Checkout::Reuse { .. } = registry.try_checkout(&key).await else {
            panic!("expected reuse");
        };

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(registry.sweep_expired(&key, Duration::from_millis(1)).await, 1);

        let stats = registry.stats(&key).await.unwrap();
        assert_eq!(stats, PoolStats {
            available: 0,
            leased: 1,
            total: 1,
        });
    }

    #[tokio::test]
    async fn swept_record_never_checked_out() {
        let settings = PoolSettings {
            idle_timeout: Duration::from_millis(1),
            ..test_settings()
        };
        let (registry, _) = make_registry(settings);
        let key = test_key();
        registry.return_connection(&key, None, blob(b"old")).await;

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(matches!(registry.try_checkout(&key).await, Checkout::Reserved { .. }));
    }

    #[tokio::test]
    async fn stats_for_unknown_key_are_zero() {
        let (registry, _) = make_registry(test_settings());
        assert_eq!(registry.stats(&test_key()).await.unwrap(), PoolStats::default());
    }

    #[tokio::test]
    async fn purge_removes_entry() {
        let (registry, store) = make_registry(test_settings());
        let key = test_key();
        registry.return_connection(&key, None, blob(b"s")).await;

        assert!(registry.purge(&key).await.unwrap());
        assert!(store.is_empty());
        assert!(!registry.purge(&key).await.unwrap());
    }

    #[tokio::test]
    async fn different_keys_use_separate_entries() {
        let (registry, store) = make_registry(test_settings());
        let a = ConnectionKey::new("gw", 2195, "a.pem");
        let b = ConnectionKey::new("gw", 2195, "b.pem");
        registry.return_connection(&a, None, blob(b"a")).await;
        registry.return_connection(&b, None, blob(b"b")).await;

        assert_eq!(store.len(), 2);
        assert_eq!(registry.stats(&a).await.unwrap().available, 1);
    }

    #[test]
    fn lease_tokens_are_distinct() {
        let a = lease_token();
        let b = lease_token();
        assert_ne!(a, b);
    }
}
