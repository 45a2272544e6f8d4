//! Notification client against a scripted in-memory gateway.
//!
//! The test stack: `NotificationClient` → `PoolManager` → `PipeTransport`
//! → duplex pipe → `MockGateway` task that parses send frames.

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use pushpool_apns::{Notification, NotificationClient, NotificationRequest};
use pushpool_core::{ConnectionKey, GatewaySettings, PoolSettings, unix_millis};
use pushpool_pool::{LiveConnection, Origin, PoolError, PoolManager, Registry, SessionState, Transport};
use pushpool_state::MemoryStore;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};

const GOOD_TOKEN: &str = "1111111111111111111111111111111111111111111111111111111111111111";
const BAD_TOKEN: &str = "badbadbadbadbadbadbadbadbadbadbadbadbadbadbadbadbadbadbadbadbadb";

// ── MockGateway ─────────────────────────────────────────────────────

#[derive(Clone, Debug)]
struct Received {
    identifier: u32,
    token: Vec<u8>,
    payload: Vec<u8>,
}

#[derive(Default)]
struct GatewayState {
    received: Mutex<Vec<Received>>,
    /// Answer the next N frames with a shutdown status.
    shutdown_next: AtomicUsize,
    /// Shut down once on reaching this identifier; zero disables.
    shutdown_at: AtomicU32,
}

impl GatewayState {
    fn received(&self) -> Vec<Received> {
        self.received.lock().unwrap().clone()
    }
}

async fn read_frame(stream: &mut DuplexStream) -> Option<Received> {
    let mut head = [0u8; 11];
    stream.read_exact(&mut head).await.ok()?;
    assert_eq!(head[0], 1, "send command");
    let identifier = u32::from_be_bytes([head[1], head[2], head[3], head[4]]);
    let token_len = u16::from_be_bytes([head[9], head[10]]) as usize;
    let mut token = vec![0u8; token_len];
    stream.read_exact(&mut token).await.ok()?;
    let mut len = [0u8; 2];
    stream.read_exact(&mut len).await.ok()?;
    let mut payload = vec![0u8; u16::from_be_bytes(len) as usize];
    stream.read_exact(&mut payload).await.ok()?;
    Some(Received {
        identifier,
        token,
        payload,
    })
}

async fn serve(mut stream: DuplexStream, state: Arc<GatewayState>) {
    let bad = hex_token(BAD_TOKEN);
    while let Some(frame) = read_frame(&mut stream).await {
        let shutting_down = state
            .shutdown_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
            || (frame.identifier != 0
                && state
                    .shutdown_at
                    .compare_exchange(frame.identifier, 0, Ordering::SeqCst, Ordering::SeqCst)
                    .is_ok());
        let status = if shutting_down {
            Some(10u8)
        } else if frame.token == bad {
            Some(8u8)
        } else {
            None
        };
        // A shutdown names the last frame processed, which excludes this one.
        let identifier = match status {
            Some(10) => frame.identifier.wrapping_sub(1),
            _ => frame.identifier,
        };
        state.received.lock().unwrap().push(frame);
        if let Some(status) = status {
            let mut response = vec![8, status];
            response.extend_from_slice(&identifier.to_be_bytes());
            let _ = stream.write_all(&response).await;
            // The gateway hangs up after reporting an error.
            return;
        }
    }
}

fn hex_token(token: &str) -> Vec<u8> {
    pushpool_apns::parse_token(token).unwrap().to_vec()
}

struct PipeTransport {
    gateway: Arc<GatewayState>,
    establishes: AtomicUsize,
}

impl PipeTransport {
    fn open(&self, session: SessionState, origin: Origin) -> LiveConnection {
        let (client, server) = tokio::io::duplex(4096);
        tokio::spawn(serve(server, self.gateway.clone()));
        LiveConnection::new(client, session, origin)
    }
}

#[async_trait]
impl Transport for PipeTransport {
    async fn establish(&self, key: &ConnectionKey) -> Result<LiveConnection, PoolError> {
        self.establishes.fetch_add(1, Ordering::SeqCst);
        let now = unix_millis();
        let session = SessionState {
            key_fingerprint: key.fingerprint(),
            peer: SocketAddr::from((Ipv4Addr::LOCALHOST, key.port)),
            server_name: key.host.clone(),
            protocol_version: 0x0304,
            cipher_suite: 0x1301,
            established_at_ms: now,
            last_used_ms: now,
            use_count: 0,
            ticket: bytes::Bytes::new(),
        };
        Ok(self.open(session, Origin::Established))
    }

    async fn resume(&self, _key: &ConnectionKey, session: SessionState) -> Result<LiveConnection, PoolError> {
        Ok(self.open(session, Origin::Reused))
    }
}

fn gateway_settings() -> GatewaySettings {
    GatewaySettings {
        host: "gateway.test".to_string(),
        port: 2195,
        connect_timeout: Duration::from_secs(1),
        handshake_timeout: Duration::from_secs(1),
        liveness_timeout: Duration::from_millis(5),
        response_timeout: Duration::from_millis(50),
    }
}

fn setup() -> (NotificationClient, Arc<GatewayState>, Arc<PipeTransport>) {
    let gateway = Arc::new(GatewayState::default());
    let transport = Arc::new(PipeTransport {
        gateway: gateway.clone(),
        establishes: AtomicUsize::new(0),
    });
    let pool = PoolSettings {
        max_size: 4,
        idle_timeout: Duration::from_secs(120),
        lease_ttl: Duration::from_secs(60),
        checkout_timeout: Duration::from_secs(1),
        store_timeout: Duration::from_millis(200),
        cas_retries: 8,
        instance_id: "apns-test".to_string(),
    };
    let registry = Registry::new(Arc::new(MemoryStore::new()), pool);
    let manager = PoolManager::new(registry, transport.clone());
    let client = NotificationClient::new(manager, &gateway_settings(), "app.pem", Duration::from_secs(2));
    (client, gateway, transport)
}

fn request(token: &str, message: &str) -> NotificationRequest {
    Notification::new(message).build(token).unwrap()
}

// ── Sending ─────────────────────────────────────────────────────────

#[tokio::test]
async fn accepted_batch_reaches_gateway_in_order() {
    let (client, gateway, _) = setup();
    let batch = vec![request(GOOD_TOKEN, "one"), request(GOOD_TOKEN, "two")];

    let report = client.send(&batch).await.unwrap();
    assert_eq!(report.sent, 2);

    let received = gateway.received();
    assert_eq!(received.len(), 2);
    assert_eq!(received[0].identifier, report.first_identifier);
    assert_eq!(received[1].identifier, report.first_identifier + 1);
    assert_eq!(received[0].token, hex_token(GOOD_TOKEN));
    assert_eq!(received[1].payload, batch[1].payload.to_vec());
}

#[tokio::test]
async fn empty_batch_touches_nothing() {
    let (client, gateway, transport) = setup();
    assert_eq!(client.send(&[]).await.unwrap().sent, 0);
    assert!(gateway.received().is_empty());
    assert_eq!(transport.establishes.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn second_batch_reuses_pooled_connection() {
    let (client, _, transport) = setup();
    client.send(&[request(GOOD_TOKEN, "a")]).await.unwrap();
    client.send(&[request(GOOD_TOKEN, "b")]).await.unwrap();

    assert_eq!(transport.establishes.load(Ordering::SeqCst), 1);
    let stats = client.pool().stats(client.key()).await.unwrap();
    assert_eq!(stats.available, 1);
}

// ── Gateway errors ──────────────────────────────────────────────────

#[tokio::test]
async fn invalid_token_is_protocol_error_and_connection_kept() {
    let (client, _, _) = setup();
    let report = client.send(&[request(GOOD_TOKEN, "warmup")]).await.unwrap();

    let err = client.send(&[request(BAD_TOKEN, "x")]).await.unwrap_err();
    match err {
        PoolError::Protocol { code, message } => {
            assert_eq!(code, 8);
            assert!(message.contains(&format!("notification {}", report.first_identifier + 1)));
        }
        other => panic!("expected protocol error, got {other:?}"),
    }
    assert_eq!(client.pool().stats(client.key()).await.unwrap().available, 1);
}

#[tokio::test]
async fn shutdown_on_reused_connection_falls_back_to_fresh() {
    let (client, gateway, transport) = setup();
    client.send(&[request(GOOD_TOKEN, "first")]).await.unwrap();

    gateway.shutdown_next.store(1, Ordering::SeqCst);
    client.send(&[request(GOOD_TOKEN, "second")]).await.unwrap();

    // The frame went out twice: once on the reused connection, once fresh.
    assert_eq!(gateway.received().len(), 3);
    assert_eq!(transport.establishes.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn shutdown_mid_batch_resends_only_unprocessed_frames() {
    let (client, gateway, transport) = setup();
    let warmup = client.send(&[request(GOOD_TOKEN, "warmup")]).await.unwrap();
    let first = warmup.first_identifier + 1;

    // Frames first and first+1 are processed; the gateway stops at first+2.
    gateway.shutdown_at.store(first + 2, Ordering::SeqCst);
    let batch = vec![
        request(GOOD_TOKEN, "one"),
        request(GOOD_TOKEN, "two"),
        request(GOOD_TOKEN, "three"),
    ];
    let report = client.send(&batch).await.unwrap();
    assert_eq!(report.first_identifier, first);

    let ids: Vec<u32> = gateway.received().iter().map(|r| r.identifier).collect();
    assert_eq!(ids, vec![first - 1, first, first + 1, first + 2, first + 2]);
    let last = gateway.received().pop().unwrap();
    assert_eq!(last.payload, batch[2].payload.to_vec());
    assert_eq!(transport.establishes.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn shutdown_on_fresh_connection_surfaces() {
    let (client, gateway, _) = setup();
    gateway.shutdown_next.store(1, Ordering::SeqCst);

    let err = client.send(&[request(GOOD_TOKEN, "x")]).await.unwrap_err();
    assert!(matches!(err, PoolError::Connect { .. }), "got {err:?}");
    assert_eq!(client.pool().stats(client.key()).await.unwrap().total, 0);
}
