//! Pool manager: runs one exchange over a pooled connection.
//!
//! # Flow
//!
//! ```text
//! with_connection(key, timeout, exchange)
//!   → checkout (backoff while the pool is full)
//!     → Reuse     → reconstruct ── stale ──┐
//!     → Reserved  → establish               │ (one fallback)
//!     → Unpooled  → establish (untracked)   ↓
//!   → exchange(conn)                    establish fresh
//!     → Ok / protocol error → serialize → return to registry
//!     → transport error     → discard (+ one retry if conn was reused)
//! ```
//!
//! A lease is always released: explicitly on every exit path, or by
//! [`LeaseGuard`]'s drop if the caller's future is cancelled.

use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use pushpool_core::ConnectionKey;
use pushpool_state::StoreResult;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::error::PoolError;
use crate::registry::{Checkout, Lease, PoolStats, Registry};
use crate::transport::{LiveConnection, Transport};

const INITIAL_BACKOFF: Duration = Duration::from_millis(10);
const MAX_BACKOFF: Duration = Duration::from_millis(250);

/// Owns a registry lease until it is returned or discarded.
///
/// Dropping a guard that still holds its lease (cancellation, panic in the
/// exchange) discards the lease from a spawned task.
struct LeaseGuard {
    registry: Registry,
    key: ConnectionKey,
    lease: Option<Lease>,
    pooled: bool,
}

impl LeaseGuard {
    fn new(registry: Registry, key: &ConnectionKey, checkout: &Checkout) -> Self {
        let (lease, pooled) = match checkout {
            Checkout::Reuse { lease, .. } | Checkout::Reserved { lease } => (Some(lease.clone()), true),
            Checkout::Full | Checkout::Unpooled => (None, false),
        };
        Self {
            registry,
            key: key.clone(),
            lease,
            pooled,
        }
    }

    /// Hand the connection's state back to the registry, then close the
    /// local socket. The next holder resumes from the blob.
    async fn give_back(mut self, connection: &mut LiveConnection, transport: &dyn Transport) {
        if self.pooled {
            let blob = transport.serialize(connection);
            self.registry
                .return_connection(&self.key, self.lease.as_ref(), blob)
                .await;
            self.lease = None;
        }
        connection.shutdown().await;
    }

    async fn discard(mut self) {
        if let Some(lease) = self.lease.as_ref() {
            self.registry.discard(&self.key, lease).await;
        }
        self.lease = None;
    }
}

impl Drop for LeaseGuard {
    fn drop(&mut self) {
        let Some(lease) = self.lease.take() else {
            return;
        };
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            warn!(key = %self.key, record = lease.record_id, "no runtime to release lease; it will expire");
            return;
        };
        debug!(key = %self.key, record = lease.record_id, "releasing lease of cancelled exchange");
        let registry = self.registry.clone();
        let key = self.key.clone();
        handle.spawn(async move {
            registry.discard(&key, &lease).await;
        });
    }
}

/// Callers see transport trouble as a connection failure.
fn surface(key: &ConnectionKey, err: PoolError) -> PoolError {
    match err {
        PoolError::Stale(reason) | PoolError::StoreUnavailable(reason) => PoolError::connect(
            key.authority(),
            std::io::Error::new(std::io::ErrorKind::ConnectionAborted, reason),
        ),
        PoolError::EncodingVersion(tag) => PoolError::connect(
            key.authority(),
            std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("unsupported session encoding {tag}"),
            ),
        ),
        other => other,
    }
}

/// Hands out pooled connections for the duration of one exchange.
#[derive(Clone)]
pub struct PoolManager {
    registry: Registry,
    transport: Arc<dyn Transport>,
}

impl std::fmt::Debug for PoolManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoolManager")
            .field("registry", &self.registry)
            .finish_non_exhaustive()
    }
}

impl PoolManager {
    pub fn new(registry: Registry, transport: Arc<dyn Transport>) -> Self {
        Self { registry, transport }
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Run `exchange` on a connection for `key`, all within `timeout`.
    ///
    /// The exchange may be invoked twice: once on a reused connection and,
    /// if that fails at the transport level, once more on a fresh one. It
    /// must therefore be safe to repeat.
    pub async fn with_connection<R, F>(
        &self,
        key: &ConnectionKey,
        timeout: Duration,
        exchange: F,
    ) -> Result<R, PoolError>
    where
        F: for<'c> Fn(&'c mut LiveConnection) -> BoxFuture<'c, Result<R, PoolError>> + Send + Sync,
        R: Send,
    {
        let deadline = Instant::now() + timeout;
        match tokio::time::timeout_at(deadline, self.run(key, deadline, &exchange)).await {
            Ok(result) => result.map_err(|err| surface(key, err)),
            Err(_) => {
                warn!(%key, ?timeout, "exchange deadline exceeded");
                Err(PoolError::Timeout {
                    stage: "with_connection",
                    after: timeout,
                })
            }
        }
    }

    async fn run<R, F>(&self, key: &ConnectionKey, deadline: Instant, exchange: &F) -> Result<R, PoolError>
    where
        F: for<'c> Fn(&'c mut LiveConnection) -> BoxFuture<'c, Result<R, PoolError>> + Send + Sync,
        R: Send,
    {
        let checkout = self.checkout(key, deadline).await?;
        let guard = LeaseGuard::new(self.registry.clone(), key, &checkout);
        let mut fallback_used = false;

        let acquired = match &checkout {
            Checkout::Reuse { blob, .. } => match self.transport.reconstruct(key, blob).await {
                Ok(conn) => Ok(conn),
                Err(err) => {
                    warn!(%key, error = %err, "pooled session unusable, establishing fresh");
                    fallback_used = true;
                    self.transport.establish(key).await
                }
            },
            _ => self.transport.establish(key).await,
        };
        let mut conn = match acquired {
            Ok(conn) => conn,
            Err(err) => {
                guard.discard().await;
                return Err(err);
            }
        };

        loop {
            match exchange(&mut conn).await {
                Ok(value) => {
                    conn.mark_used();
                    guard.give_back(&mut conn, self.transport.as_ref()).await;
                    return Ok(value);
                }
                Err(err) if !err.is_transport() => {
                    debug!(%key, error = %err, "gateway rejected exchange, keeping connection");
                    conn.mark_used();
                    guard.give_back(&mut conn, self.transport.as_ref()).await;
                    return Err(err);
                }
                Err(err) => {
                    conn.shutdown().await;
                    if conn.is_reused() && !fallback_used {
                        warn!(%key, error = %err, "reused connection failed, retrying on a fresh one");
                        fallback_used = true;
                        conn = match self.transport.establish(key).await {
                            Ok(fresh) => fresh,
                            Err(establish_err) => {
                                guard.discard().await;
                                return Err(establish_err);
                            }
                        };
                        continue;
                    }
                    guard.discard().await;
                    return Err(err);
                }
            }
        }
    }

    /// Check out from the registry, backing off while every slot is leased.
    async fn checkout(&self, key: &ConnectionKey, deadline: Instant) -> Result<Checkout, PoolError> {
        let started = Instant::now();
        let give_up = deadline.min(started + self.registry.settings().checkout_timeout);
        let mut backoff = INITIAL_BACKOFF;
        loop {
            match self.registry.try_checkout(key).await {
                Checkout::Full => {
                    let now = Instant::now();
                    if now >= give_up {
                        return Err(PoolError::Timeout {
                            stage: "checkout",
                            after: now - started,
                        });
                    }
                    // The last nap is cut short so one more attempt lands on the deadline.
                    let nap = backoff.min(give_up - now);
                    debug!(%key, ?nap, "pool full, waiting");
                    tokio::time::sleep(nap).await;
                    backoff = (backoff * 2).min(MAX_BACKOFF);
                }
                Checkout::Unpooled => {
                    warn!(%key, "registry unavailable, using an unpooled connection");
                    return Ok(Checkout::Unpooled);
                }
                other => return Ok(other),
            }
        }
    }

    pub async fn stats(&self, key: &ConnectionKey) -> StoreResult<PoolStats> {
        self.registry.stats(key).await
    }

    /// Sweep records idle beyond the configured idle timeout.
    pub async fn sweep(&self, key: &ConnectionKey) -> usize {
        let idle = self.registry.settings().idle_timeout;
        self.registry.sweep_expired(key, idle).await
    }
}
