//! OpenSSL-backed transport to the push gateway.
//!
//! Every credential gets one cached `SslConnector`. Session tickets the
//! gateway issues are captured per connection and travel inside the pooled
//! session blob, so whichever process reconstructs the blob presents the
//! ticket and completes an abbreviated handshake.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use openssl::ex_data::Index;
use openssl::ssl::{Ssl, SslConnector, SslMethod, SslSession, SslSessionCacheMode, SslVersion};
use openssl::x509::X509;
use pushpool_core::{ConnectionKey, GatewaySettings, unix_millis};
use tokio::net::TcpStream;
use tokio_openssl::SslStream;
use tracing::{debug, warn};

use crate::codec::SessionState;
use crate::credentials::CredentialProvider;
use crate::error::PoolError;
use crate::transport::{LiveConnection, Origin, TicketSlot, Transport};

/// Timeouts and trust anchors for gateway connections.
#[derive(Clone, Debug)]
pub struct TlsSettings {
    pub connect_timeout: Duration,
    pub handshake_timeout: Duration,
    /// How long a resumed connection is watched for an immediate close.
    pub liveness_timeout: Duration,
    /// PEM bundle of trust anchors; the system store when `None`.
    pub ca_file: Option<PathBuf>,
}

impl TlsSettings {
    pub fn from_gateway(gateway: &GatewaySettings, ca_file: Option<PathBuf>) -> Self {
        Self {
            connect_timeout: gateway.connect_timeout,
            handshake_timeout: gateway.handshake_timeout,
            liveness_timeout: gateway.liveness_timeout,
            ca_file,
        }
    }

    fn trust_anchors(&self) -> Result<Vec<X509>, PoolError> {
        let Some(path) = &self.ca_file else {
            return Ok(Vec::new());
        };

        let fail = |reason: String| PoolError::handshake("trust store", reason);
        let pem = std::fs::read(path).map_err(|e| fail(format!("reading {}: {e}", path.display())))?;
        let anchors = X509::stack_from_pem(&pem).map_err(|e| fail(format!("invalid CA PEM: {e}")))?;
        if anchors.is_empty() {
            return Err(fail(format!("no certificates in {}", path.display())));
        }
        Ok(anchors)
    }
}

/// Production [`Transport`]: TCP + TLS with client-certificate auth.
pub struct TlsTransport {
    settings: TlsSettings,
    trust_anchors: Vec<X509>,
    credentials: Arc<dyn CredentialProvider>,
    connectors: Mutex<HashMap<String, SslConnector>>,
    ticket_index: Index<Ssl, TicketSlot>,
}

impl std::fmt::Debug for TlsTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsTransport")
            .field("settings", &self.settings)
            .field("trust_anchors", &self.trust_anchors.len())
            .finish_non_exhaustive()
    }
}

impl TlsTransport {
    pub fn new(settings: TlsSettings, credentials: Arc<dyn CredentialProvider>) -> Result<Self, PoolError> {
        let trust_anchors = settings.trust_anchors()?;
        let ticket_index = Ssl::new_ex_index().map_err(|e| PoolError::handshake("tls", e))?;
        Ok(Self {
            settings,
            trust_anchors,
            credentials,
            connectors: Mutex::new(HashMap::new()),
            ticket_index,
        })
    }

    fn connector(&self, credential: &str) -> Result<SslConnector, PoolError> {
        if let Ok(connectors) = self.connectors.lock()
            && let Some(connector) = connectors.get(credential)
        {
            return Ok(connector.clone());
        }

        let identity = self.credentials.identity(credential)?;
        let fail = |e: openssl::error::ErrorStack| PoolError::handshake(format!("credential {credential}"), e);
        let mut builder = SslConnector::builder(SslMethod::tls_client()).map_err(fail)?;
        builder.set_min_proto_version(Some(SslVersion::TLS1_2)).map_err(fail)?;
        for anchor in &self.trust_anchors {
            builder.cert_store_mut().add_cert(anchor.clone()).map_err(fail)?;
        }
        builder.set_certificate(&identity.leaf).map_err(fail)?;
        for cert in &identity.intermediates {
            builder.add_extra_chain_cert(cert.clone()).map_err(fail)?;
        }
        builder.set_private_key(&identity.key).map_err(fail)?;

        builder.set_session_cache_mode(SslSessionCacheMode::CLIENT);
        let index = self.ticket_index;
        builder.set_new_session_callback(move |ssl, session| {
            if let Some(slot) = ssl.ex_data(index)
                && let Ok(der) = session.to_der()
            {
                slot.store(Bytes::from(der));
            }
        });

        let connector = builder.build();
        if let Ok(mut connectors) = self.connectors.lock() {
            connectors.insert(credential.to_string(), connector.clone());
        }
        Ok(connector)
    }

    async fn handshake(
        &self,
        key: &ConnectionKey,
        peer: SocketAddr,
        server_name: &str,
        ticket: &[u8],
    ) -> Result<(SslStream<TcpStream>, TicketSlot), PoolError> {
        let endpoint = peer.to_string();
        let limit = self.settings.connect_timeout;
        let tcp = tokio::time::timeout(limit, TcpStream::connect(peer))
            .await
            .map_err(|_| PoolError::Timeout {
                stage: "connect",
                after: limit,
            })?
            .map_err(|e| PoolError::connect(&endpoint, e))?;

        // Frames are small and latency-bound.
        let _ = tcp.set_nodelay(true);

        let fail = |e: openssl::error::ErrorStack| PoolError::handshake(&endpoint, e);
        let tickets = TicketSlot::default();
        let mut config = self.connector(&key.credential)?.configure().map_err(fail)?;
        config.set_ex_data(self.ticket_index, tickets.clone());
        if !ticket.is_empty() {
            match SslSession::from_der(ticket) {
                // SAFETY: the ticket was captured by a connector built for this
                // credential, so the session matches the context it is set on.
                Ok(session) => unsafe { config.set_session(&session).map_err(fail)? },
                Err(e) => warn!(%key, error = %e, "ignoring unreadable session ticket"),
            }
        }
        let ssl = config.into_ssl(server_name).map_err(fail)?;
        let mut tls = SslStream::new(ssl, tcp).map_err(fail)?;

        let limit = self.settings.handshake_timeout;
        tokio::time::timeout(limit, Pin::new(&mut tls).connect())
            .await
            .map_err(|_| PoolError::Timeout {
                stage: "handshake",
                after: limit,
            })?
            .map_err(|e| PoolError::handshake(&endpoint, e))?;

        debug!(
            %key,
            peer = %endpoint,
            resumed = tls.ssl().session_reused(),
            "tls handshake complete"
        );
        Ok((tls, tickets))
    }

    /// Watch a freshly resumed connection for an immediate close.
    async fn check_alive(&self, tls: &SslStream<TcpStream>) -> Result<(), PoolError> {
        let mut byte = [0u8; 1];
        match tokio::time::timeout(self.settings.liveness_timeout, tls.get_ref().peek(&mut byte)).await {
            // Nothing pending: the peer is holding the connection open.
            Err(_) => Ok(()),
            Ok(Ok(0)) => Err(PoolError::Stale("peer closed the connection".to_string())),
            Ok(Ok(_)) => Ok(()),
            Ok(Err(e)) => Err(PoolError::Stale(format!("liveness check failed: {e}"))),
        }
    }
}

/// Wire codes of the negotiated protocol version and cipher suite.
fn negotiated(tls: &SslStream<TcpStream>) -> (u16, u16) {
    let ssl = tls.ssl();
    let version = match ssl.version2() {
        Some(v) if v == SslVersion::TLS1_3 => 0x0304,
        Some(v) if v == SslVersion::TLS1_2 => 0x0303,
        Some(v) if v == SslVersion::TLS1_1 => 0x0302,
        Some(v) if v == SslVersion::TLS1 => 0x0301,
        _ => 0,
    };
    let suite = ssl
        .current_cipher()
        .map(|c| u16::from_be_bytes(c.protocol_id()))
        .unwrap_or(0);
    (version, suite)
}

#[async_trait]
impl Transport for TlsTransport {
    async fn establish(&self, key: &ConnectionKey) -> Result<LiveConnection, PoolError> {
        let authority = key.authority();
        let limit = self.settings.connect_timeout;
        let addrs: Vec<SocketAddr> = tokio::time::timeout(limit, tokio::net::lookup_host(&authority))
            .await
            .map_err(|_| PoolError::Timeout {
                stage: "dns lookup",
                after: limit,
            })?
            .map_err(|e| PoolError::connect(&authority, e))?
            .collect();

        let mut last_err = None;
        for peer in addrs {
            match self.handshake(key, peer, &key.host, &[]).await {
                Ok((tls, tickets)) => {
                    let (protocol_version, cipher_suite) = negotiated(&tls);
                    let now = unix_millis();
                    let session = SessionState {
                        key_fingerprint: key.fingerprint(),
                        peer,
                        server_name: key.host.clone(),
                        protocol_version,
                        cipher_suite,
                        established_at_ms: now,
                        last_used_ms: now,
                        use_count: 0,
                        ticket: Bytes::new(),
                    };
                    debug!(%key, %peer, "established new gateway connection");
                    return Ok(LiveConnection::new(tls, session, Origin::Established).with_tickets(tickets));
                }
                Err(err) => {
                    warn!(%key, %peer, error = %err, "gateway address failed");
                    last_err = Some(err);
                }
            }
        }
        Err(last_err.unwrap_or_else(|| {
            PoolError::connect(
                &authority,
                std::io::Error::new(std::io::ErrorKind::NotFound, "no addresses resolved"),
            )
        }))
    }

    async fn resume(&self, key: &ConnectionKey, mut session: SessionState) -> Result<LiveConnection, PoolError> {
        let (tls, tickets) = self
            .handshake(key, session.peer, &session.server_name, &session.ticket)
            .await?;
        self.check_alive(&tls).await?;

        let (protocol_version, cipher_suite) = negotiated(&tls);
        session.protocol_version = protocol_version;
        session.cipher_suite = cipher_suite;
        let origin = if tls.ssl().session_reused() {
            debug!(%key, peer = %session.peer, uses = session.use_count, "resumed pooled session");
            Origin::Reused
        } else {
            // The gateway declined the ticket; the blob's bookkeeping carries on.
            debug!(%key, peer = %session.peer, "pooled session required a full handshake");
            Origin::Established
        };
        Ok(LiveConnection::new(tls, session, origin).with_tickets(tickets))
    }
}
