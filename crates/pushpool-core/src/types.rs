//! Shared domain types: connection keys and wall-clock helpers.

use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Identifies a logical pool. Connections with the same key share a pool.
///
/// Equality is exact-match on all three fields. The credential identity is
/// the name the credential provider resolves to certificate + key material.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConnectionKey {
    pub host: String,
    pub port: u16,
    pub credential: String,
}

impl ConnectionKey {
    pub fn new(host: &str, port: u16, credential: &str) -> Self {
        Self {
            host: host.to_string(),
            port,
            credential: credential.to_string(),
        }
    }

    fn digest(&self) -> [u8; 32] {
        let mut hasher = Sha256::new();
        hasher.update(self.host.as_bytes());
        hasher.update([0]);
        hasher.update(self.port.to_be_bytes());
        hasher.update([0]);
        hasher.update(self.credential.as_bytes());
        hasher.finalize().into()
    }

    /// Key of the shared-store entry holding this pool's records.
    ///
    /// Hashed so that arbitrary hostnames and credential names always map to
    /// a short, whitespace-free key accepted by memcache-style stores.
    pub fn store_key(&self) -> String {
        format!("pool:{}", hex::encode(&self.digest()[..12]))
    }

    /// Short fingerprint embedded in session blobs to catch misrouted records.
    pub fn fingerprint(&self) -> [u8; 8] {
        let digest = self.digest();
        let mut out = [0u8; 8];
        out.copy_from_slice(&digest[..8]);
        out
    }

    /// `host:port` form used for DNS resolution.
    pub fn authority(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl std::fmt::Display for ConnectionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}#{}", self.host, self.port, self.credential)
    }
}

/// Milliseconds since the Unix epoch.
///
/// Record timestamps cross process boundaries, so they use wall-clock time
/// rather than `Instant`.
pub fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
