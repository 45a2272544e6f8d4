//! Transport adapter seam.
//!
//! A [`Transport`] turns a [`ConnectionKey`] into a live, authenticated byte
//! stream, either from scratch (`establish`) or from a session blob another
//! process left in the registry (`reconstruct`). The pool manager only ever
//! talks to this trait; [`crate::tls::TlsTransport`] is the production
//! implementation.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use pushpool_core::{ConnectionKey, unix_millis};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::debug;

use crate::codec::{self, SessionState};
use crate::error::PoolError;

/// Byte stream a [`LiveConnection`] runs over.
pub trait SessionStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> SessionStream for T {}

/// How a live connection came to be.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Origin {
    /// Full handshake in this process.
    Established,
    /// Continued from a pooled session blob with an abbreviated handshake.
    Reused,
}

/// Latest resumption session a TLS engine handed out for one connection.
///
/// Peers issue tickets after the handshake, so the slot is filled while the
/// connection is in use and read when it is serialized.
#[derive(Clone, Debug, Default)]
pub struct TicketSlot(Arc<Mutex<Option<Bytes>>>);

impl TicketSlot {
    pub fn store(&self, ticket: Bytes) {
        if let Ok(mut slot) = self.0.lock() {
            *slot = Some(ticket);
        }
    }

    pub fn latest(&self) -> Option<Bytes> {
        self.0.lock().ok().and_then(|slot| slot.clone())
    }
}

/// An authenticated connection usable for one exchange at a time.
pub struct LiveConnection {
    stream: Box<dyn SessionStream>,
    session: SessionState,
    origin: Origin,
    tickets: Option<TicketSlot>,
}

impl std::fmt::Debug for LiveConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LiveConnection")
            .field("peer", &self.session.peer)
            .field("server_name", &self.session.server_name)
            .field("origin", &self.origin)
            .field("use_count", &self.session.use_count)
            .finish()
    }
}

impl LiveConnection {
    pub fn new(stream: impl SessionStream + 'static, session: SessionState, origin: Origin) -> Self {
        Self {
            stream: Box::new(stream),
            session,
            origin,
            tickets: None,
        }
    }

    /// Track tickets the peer issues after the handshake.
    pub fn with_tickets(mut self, tickets: TicketSlot) -> Self {
        self.tickets = Some(tickets);
        self
    }

    pub fn session(&self) -> &SessionState {
        &self.session
    }

    pub fn origin(&self) -> Origin {
        self.origin
    }

    pub fn is_reused(&self) -> bool {
        self.origin == Origin::Reused
    }

    fn endpoint(&self) -> String {
        self.session.peer.to_string()
    }

    /// Write a whole frame and flush it.
    pub async fn write_frame(&mut self, frame: &[u8]) -> Result<(), PoolError> {
        self.stream
            .write_all(frame)
            .await
            .map_err(|e| PoolError::connect(self.endpoint(), e))?;
        self.stream
            .flush()
            .await
            .map_err(|e| PoolError::connect(self.endpoint(), e))
    }

    /// Read whatever arrives within `wait`.
    ///
    /// `Ok(None)` means nothing arrived in time; `Ok(Some(0))` means the peer
    /// closed the stream.
    pub async fn read_some(&mut self, buf: &mut [u8], wait: Duration) -> Result<Option<usize>, PoolError> {
        match tokio::time::timeout(wait, self.stream.read(buf)).await {
            Err(_) => Ok(None),
            Ok(Ok(n)) => Ok(Some(n)),
            Ok(Err(e)) => Err(PoolError::connect(self.endpoint(), e)),
        }
    }

    /// Fill `buf` completely; a short stream is stale.
    pub async fn read_exact(&mut self, buf: &mut [u8]) -> Result<(), PoolError> {
        match self.stream.read_exact(buf).await {
            Ok(_) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                Err(PoolError::Stale("peer closed mid-frame".to_string()))
            }
            Err(e) => Err(PoolError::connect(self.endpoint(), e)),
        }
    }

    /// Best-effort local close.
    pub async fn shutdown(&mut self) {
        if let Err(e) = self.stream.shutdown().await {
            debug!(peer = %self.session.peer, error = %e, "shutdown error ignored");
        }
    }

    /// Record one completed exchange.
    pub(crate) fn mark_used(&mut self) {
        self.session.last_used_ms = unix_millis();
        self.session.use_count = self.session.use_count.saturating_add(1);
    }

    /// Session state as of the last message boundary, carrying the newest
    /// ticket the peer issued.
    pub fn snapshot(&self) -> SessionState {
        let mut session = self.session.clone();
        if let Some(ticket) = self.tickets.as_ref().and_then(TicketSlot::latest) {
            session.ticket = ticket;
        }
        session
    }
}

/// Produces live connections for pool keys.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Open a brand-new connection with a full handshake.
    async fn establish(&self, key: &ConnectionKey) -> Result<LiveConnection, PoolError>;

    /// Resume a previously negotiated session.
    async fn resume(&self, key: &ConnectionKey, session: SessionState) -> Result<LiveConnection, PoolError>;

    /// Rebuild a connection from a pooled blob.
    ///
    /// A blob from an unknown encoder is [`PoolError::EncodingVersion`];
    /// every other failure (wrong pool, dead peer, rejected resumption) is
    /// [`PoolError::Stale`].
    async fn reconstruct(&self, key: &ConnectionKey, blob: &[u8]) -> Result<LiveConnection, PoolError> {
        let session = codec::decode_session(blob)?;
        if session.key_fingerprint != key.fingerprint() {
            return Err(PoolError::Stale(format!("session blob does not belong to {key}")));
        }
        match self.resume(key, session).await {
            Ok(conn) => Ok(conn),
            Err(err @ PoolError::Stale(_)) => Err(err),
            Err(err) => Err(PoolError::Stale(err.to_string())),
        }
    }

    /// Capture a connection's state at a message boundary.
    fn serialize(&self, connection: &LiveConnection) -> Bytes {
        codec::encode_session(&connection.snapshot())
    }
}
