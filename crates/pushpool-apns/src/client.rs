//! Batch sender over the connection pool.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use pushpool_core::{ConnectionKey, GatewaySettings};
use pushpool_pool::{LiveConnection, PoolError, PoolManager};
use tracing::{debug, info, warn};

use crate::frame::{self, ERROR_FRAME_LEN, ErrorResponse, Status};
use crate::payload::NotificationRequest;

/// Outcome of a batch the gateway did not reject.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SendReport {
    pub sent: usize,
    /// Identifier of the first frame; the rest follow consecutively.
    pub first_identifier: u32,
}

/// Sends notification batches for one certificate identity.
#[derive(Debug)]
pub struct NotificationClient {
    pool: PoolManager,
    key: ConnectionKey,
    response_timeout: Duration,
    call_timeout: Duration,
    next_identifier: AtomicU32,
}

impl NotificationClient {
    pub fn new(pool: PoolManager, gateway: &GatewaySettings, credential: &str, call_timeout: Duration) -> Self {
        Self {
            pool,
            key: ConnectionKey::new(&gateway.host, gateway.port, credential),
            response_timeout: gateway.response_timeout,
            call_timeout,
            next_identifier: AtomicU32::new(1),
        }
    }

    pub fn key(&self) -> &ConnectionKey {
        &self.key
    }

    pub fn pool(&self) -> &PoolManager {
        &self.pool
    }

    /// Write every frame of `batch` over one pooled connection, then wait
    /// `response_timeout` for an error frame. Silence means accepted.
    ///
    /// If the gateway shuts down mid-batch, the retry on a fresh connection
    /// carries only the frames after the last one it acknowledged.
    pub async fn send(&self, batch: &[NotificationRequest]) -> Result<SendReport, PoolError> {
        if batch.is_empty() {
            return Ok(SendReport {
                sent: 0,
                first_identifier: 0,
            });
        }

        let first = self
            .next_identifier
            .fetch_add(batch.len() as u32, Ordering::Relaxed);
        let frames = Arc::new(Frames::encode(first, batch));
        let wait = self.response_timeout;

        self.pool
            .with_connection(&self.key, self.call_timeout, move |conn| {
                let frames = frames.clone();
                Box::pin(async move { exchange(conn, &frames, wait).await })
            })
            .await?;

        info!(key = %self.key, sent = batch.len(), first, "notification batch accepted");
        Ok(SendReport {
            sent: batch.len(),
            first_identifier: first,
        })
    }
}

/// Encoded batch plus how much of it the gateway has acknowledged.
struct Frames {
    first: u32,
    encoded: Vec<Bytes>,
    acknowledged: AtomicUsize,
}

impl Frames {
    fn encode(first: u32, batch: &[NotificationRequest]) -> Self {
        let encoded = batch
            .iter()
            .enumerate()
            .map(|(offset, request)| {
                let mut buf = BytesMut::new();
                frame::encode_send(&mut buf, first.wrapping_add(offset as u32), request);
                buf.freeze()
            })
            .collect();
        Self {
            first,
            encoded,
            acknowledged: AtomicUsize::new(0),
        }
    }

    /// Frames not yet acknowledged, joined for one write.
    fn pending(&self) -> BytesMut {
        let skip = self.acknowledged.load(Ordering::SeqCst);
        let mut out = BytesMut::new();
        for frame in self.encoded.iter().skip(skip) {
            out.extend_from_slice(frame);
        }
        out
    }

    /// Record that the gateway processed everything up to `identifier`.
    fn acknowledge_through(&self, identifier: u32) {
        let count = identifier.wrapping_sub(self.first).wrapping_add(1) as usize;
        if count <= self.encoded.len() {
            self.acknowledged.fetch_max(count, Ordering::SeqCst);
        }
    }
}

async fn exchange(conn: &mut LiveConnection, frames: &Frames, wait: Duration) -> Result<(), PoolError> {
    let pending = frames.pending();
    if pending.is_empty() {
        return Ok(());
    }
    conn.write_frame(&pending).await?;

    let mut response = [0u8; ERROR_FRAME_LEN];
    match conn.read_some(&mut response[..1], wait).await? {
        None => Ok(()),
        Some(0) => Err(PoolError::Stale("gateway closed the connection".to_string())),
        Some(_) => {
            conn.read_exact(&mut response[1..]).await?;
            let Some(error) = ErrorResponse::decode(&response) else {
                return Err(PoolError::Stale(format!("unexpected gateway command {}", response[0])));
            };
            match error.status {
                Status::NoError => {
                    debug!(identifier = error.identifier, "gateway reported no error");
                    Ok(())
                }
                Status::Shutdown => {
                    // The identifier names the last notification the gateway processed.
                    frames.acknowledge_through(error.identifier);
                    warn!(identifier = error.identifier, "gateway is shutting down");
                    Err(PoolError::Stale(Status::Shutdown.description().to_string()))
                }
                status => Err(PoolError::Protocol {
                    code: status.code(),
                    message: format!("{} (notification {})", status.description(), error.identifier),
                }),
            }
        }
    }
}
