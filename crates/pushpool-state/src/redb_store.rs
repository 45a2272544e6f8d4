//! RedbStore, a redb-backed shared store.
//!
//! Each value column holds a 16-byte header (version, expiry) followed by the
//! payload. redb serializes write transactions, which makes the read-compare-
//! write of `compare_and_set` atomic.
//!
//! A redb file is locked exclusively by whoever has it open, so a file-backed
//! store opens the database for one transaction at a time and releases it
//! straight after. Processes on the same host take turns: an operation that
//! finds the file locked backs off and retries until its lock wait runs out,
//! then reports [`StoreError::Unavailable`]. All redb work runs on the
//! blocking pool, so a caller's timeout can always cut a slow operation short.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use pushpool_core::unix_millis;
use redb::{Database, DatabaseError, ReadableDatabase, ReadableTable, TableError};
use tracing::debug;

use crate::error::{StoreError, StoreResult};
use crate::store::{SharedStore, Versioned};
use crate::tables::ENTRIES;

/// Convert any `Display` error into a `StoreError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StoreError::$variant(e.to_string())
    };
}

const HEADER_LEN: usize = 16;

/// Key under which the store-wide version counter lives.
const VERSION_COUNTER_KEY: &str = "\0version";

/// How long one operation keeps retrying a file locked by another handle.
pub const DEFAULT_LOCK_WAIT: Duration = Duration::from_secs(2);

const LOCK_BACKOFF_START: Duration = Duration::from_millis(1);
const LOCK_BACKOFF_MAX: Duration = Duration::from_millis(25);

struct Header {
    version: u64,
    expires_at_ms: u64,
}

impl Header {
    fn is_live(&self, now_ms: u64) -> bool {
        self.expires_at_ms == 0 || now_ms < self.expires_at_ms
    }
}

fn split(raw: &[u8]) -> StoreResult<(Header, &[u8])> {
    if raw.len() < HEADER_LEN {
        return Err(StoreError::Corrupt(format!("entry header truncated ({} bytes)", raw.len())));
    }
    let (head, payload) = raw.split_at(HEADER_LEN);
    let mut version = [0u8; 8];
    let mut expires = [0u8; 8];
    version.copy_from_slice(&head[..8]);
    expires.copy_from_slice(&head[8..]);
    Ok((
        Header {
            version: u64::from_be_bytes(version),
            expires_at_ms: u64::from_be_bytes(expires),
        },
        payload,
    ))
}

fn join(header: &Header, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(HEADER_LEN + payload.len());
    out.extend_from_slice(&header.version.to_be_bytes());
    out.extend_from_slice(&header.expires_at_ms.to_be_bytes());
    out.extend_from_slice(payload);
    out
}

fn ensure_tables(db: &Database) -> StoreResult<()> {
    let txn = db.begin_write().map_err(map_err!(Open))?;
    txn.open_table(ENTRIES).map_err(map_err!(Open))?;
    txn.commit().map_err(map_err!(Open))?;
    Ok(())
}

fn get_in(db: &Database, key: &str) -> StoreResult<Option<Versioned>> {
    let txn = db.begin_read().map_err(map_err!(Unavailable))?;
    let table = match txn.open_table(ENTRIES) {
        Ok(table) => table,
        // Nobody has written yet.
        Err(TableError::TableDoesNotExist(_)) => return Ok(None),
        Err(e) => return Err(StoreError::Unavailable(e.to_string())),
    };
    match table.get(key).map_err(map_err!(Unavailable))? {
        Some(guard) => {
            let (header, payload) = split(guard.value())?;
            if !header.is_live(unix_millis()) {
                return Ok(None);
            }
            Ok(Some(Versioned {
                version: header.version,
                value: payload.to_vec(),
            }))
        }
        None => Ok(None),
    }
}

fn compare_and_set_in(
    db: &Database,
    key: &str,
    expected: Option<u64>,
    value: &[u8],
    ttl: Option<Duration>,
) -> StoreResult<bool> {
    let now_ms = unix_millis();
    let txn = db.begin_write().map_err(map_err!(Unavailable))?;
    let stored;
    {
        let mut table = txn.open_table(ENTRIES).map_err(map_err!(Unavailable))?;
        let current = match table.get(key).map_err(map_err!(Unavailable))? {
            Some(guard) => {
                let (header, _) = split(guard.value())?;
                header.is_live(now_ms).then_some(header.version)
            }
            None => None,
        };

        if current != expected {
            stored = false;
        } else {
            let version = {
                let last = match table.get(VERSION_COUNTER_KEY).map_err(map_err!(Unavailable))? {
                    Some(guard) => split(guard.value())?.0.version,
                    None => 0,
                };
                last + 1
            };
            let counter = join(&Header { version, expires_at_ms: 0 }, &[]);
            table
                .insert(VERSION_COUNTER_KEY, counter.as_slice())
                .map_err(map_err!(Unavailable))?;

            let expires_at_ms = ttl.map(|t| now_ms + t.as_millis() as u64).unwrap_or(0);
            let row = join(&Header { version, expires_at_ms }, value);
            table
                .insert(key, row.as_slice())
                .map_err(map_err!(Unavailable))?;
            stored = true;
        }
    }
    if stored {
        txn.commit().map_err(map_err!(Unavailable))?;
    } else {
        txn.abort().map_err(map_err!(Unavailable))?;
    }
    Ok(stored)
}

fn delete_in(db: &Database, key: &str) -> StoreResult<bool> {
    let now_ms = unix_millis();
    let txn = db.begin_write().map_err(map_err!(Unavailable))?;
    let existed;
    {
        let mut table = txn.open_table(ENTRIES).map_err(map_err!(Unavailable))?;
        existed = match table.remove(key).map_err(map_err!(Unavailable))? {
            Some(guard) => split(guard.value())?.0.is_live(now_ms),
            None => false,
        };
    }
    txn.commit().map_err(map_err!(Unavailable))?;
    debug!(%key, existed, "entry deleted");
    Ok(existed)
}

enum Backend {
    /// Opened per operation so other processes can take their turn.
    File(PathBuf),
    /// Private to this handle, kept open.
    Resident(Database),
}

impl Backend {
    /// Run `op` against the database. `None` means the file is locked by
    /// another handle right now.
    fn attempt<R>(&self, op: &impl Fn(&Database) -> StoreResult<R>) -> Option<StoreResult<R>> {
        match self {
            Backend::Resident(db) => Some(op(db)),
            Backend::File(path) => match Database::create(path) {
                Ok(db) => Some(op(&db)),
                Err(DatabaseError::DatabaseAlreadyOpen) => None,
                Err(e) => Some(Err(StoreError::Unavailable(e.to_string()))),
            },
        }
    }
}

/// Shared store backed by redb; clones share the same backend.
#[derive(Clone)]
pub struct RedbStore {
    backend: Arc<Backend>,
    lock_wait: Duration,
}

impl std::fmt::Debug for RedbStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut out = f.debug_struct("RedbStore");
        match &*self.backend {
            Backend::File(path) => out.field("path", path),
            Backend::Resident(_) => out.field("path", &"<memory>"),
        };
        out.field("lock_wait", &self.lock_wait).finish()
    }
}

impl RedbStore {
    fn from_backend(backend: Backend) -> Self {
        Self {
            backend: Arc::new(backend),
            lock_wait: DEFAULT_LOCK_WAIT,
        }
    }

    /// Open (or create) a persistent store at the given path.
    ///
    /// The file may be in use by another process; opening only fails when
    /// the path itself is unusable.
    pub fn open(path: &Path) -> StoreResult<Self> {
        match Database::create(path) {
            Ok(db) => {
                ensure_tables(&db)?;
                debug!(?path, "redb store opened");
            }
            Err(DatabaseError::DatabaseAlreadyOpen) => {
                debug!(?path, "redb store in use elsewhere, sharing it");
            }
            Err(e) => return Err(StoreError::Open(e.to_string())),
        }
        Ok(Self::from_backend(Backend::File(path.to_path_buf())))
    }

    /// Create an ephemeral in-memory redb store (for testing).
    pub fn open_in_memory() -> StoreResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        ensure_tables(&db)?;
        debug!("in-memory redb store opened");
        Ok(Self::from_backend(Backend::Resident(db)))
    }

    /// Bound how long an operation waits for a file locked elsewhere.
    pub fn with_lock_wait(mut self, lock_wait: Duration) -> Self {
        self.lock_wait = lock_wait;
        self
    }

    async fn run<R, F>(&self, op: F) -> StoreResult<R>
    where
        R: Send + 'static,
        F: Fn(&Database) -> StoreResult<R> + Send + Sync + 'static,
    {
        let op = Arc::new(op);
        let give_up = tokio::time::Instant::now() + self.lock_wait;
        let mut backoff = LOCK_BACKOFF_START;
        loop {
            let backend = self.backend.clone();
            let task_op = op.clone();
            let attempt = tokio::task::spawn_blocking(move || backend.attempt(&*task_op))
                .await
                .map_err(|e| StoreError::Unavailable(format!("store task failed: {e}")))?;
            if let Some(result) = attempt {
                return result;
            }

            let now = tokio::time::Instant::now();
            if now >= give_up {
                return Err(StoreError::Unavailable(format!(
                    "database locked by another handle for {:?}",
                    self.lock_wait
                )));
            }
            tokio::time::sleep(backoff.min(give_up - now)).await;
            backoff = (backoff * 2).min(LOCK_BACKOFF_MAX);
        }
    }
}

#[async_trait]
impl SharedStore for RedbStore {
    async fn get(&self, key: &str) -> StoreResult<Option<Versioned>> {
        let key = key.to_string();
        self.run(move |db| get_in(db, &key)).await
    }

    async fn compare_and_set(
        &self,
        key: &str,
        expected: Option<u64>,
        value: Vec<u8>,
        ttl: Option<Duration>,
    ) -> StoreResult<bool> {
        let key = key.to_string();
        self.run(move |db| compare_and_set_in(db, &key, expected, &value, ttl))
            .await
    }

    async fn delete(&self, key: &str) -> StoreResult<bool> {
        let key = key.to_string();
        self.run(move |db| delete_in(db, &key)).await
    }
}
