//! Session codec: compact, versioned binary encodings.
//!
//! Two formats live here, each led by its own format tag byte:
//!
//! - **Session blob**: the negotiated state of one TLS connection
//!   ([`SessionState`]), including the TLS engine's serialized resumption
//!   session, enough for another process to continue it without a full
//!   handshake.
//! - **Pool entry**: the registry's per-key record list ([`PoolEntry`]), the
//!   value stored in the shared store.
//!
//! All integers are big-endian. Encoding is pure and deterministic; decoding
//! rejects unknown tags with [`CodecError::UnsupportedVersion`] instead of
//! guessing at a layout.
//!
//! ```text
//! session v2: tag | fingerprint[8] | family u8 | ip[4|16] | port u16
//!             | name_len u8 | name | protocol u16 | suite u16
//!             | established_ms u64 | last_used_ms u64 | use_count u32
//!             | ticket_len u16 | ticket
//! ```
//!
//! v1 blobs carried no ticket and are rejected as an unsupported version.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

use crate::registry::{LeaseInfo, PoolEntry, PooledRecord};

/// Current session blob format.
pub const SESSION_FORMAT_V2: u8 = 2;
/// Current pool entry format.
pub const ENTRY_FORMAT_V1: u8 = 1;

const FAMILY_V4: u8 = 4;
const FAMILY_V6: u8 = 6;

const FLAG_LEASED: u8 = 0b01;
const FLAG_BLOB: u8 = 0b10;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CodecError {
    #[error("unsupported format tag {0}")]
    UnsupportedVersion(u8),

    #[error("malformed encoding: {0}")]
    Malformed(String),
}

/// Snapshot of a TLS session at a message boundary.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SessionState {
    /// [`ConnectionKey::fingerprint`](pushpool_core::ConnectionKey::fingerprint) of the owning pool.
    pub key_fingerprint: [u8; 8],
    /// Resolved peer address the session was negotiated with.
    pub peer: SocketAddr,
    /// SNI name presented during the handshake.
    pub server_name: String,
    /// Negotiated TLS protocol version (wire value, e.g. `0x0304`).
    pub protocol_version: u16,
    /// Negotiated cipher suite (IANA value).
    pub cipher_suite: u16,
    pub established_at_ms: u64,
    pub last_used_ms: u64,
    /// Completed exchanges over this session, across all processes.
    pub use_count: u32,
    /// DER-encoded TLS session for resumption; empty when the peer issued none.
    pub ticket: Bytes,
}

fn need(buf: &impl Buf, n: usize, what: &str) -> Result<(), CodecError> {
    if buf.remaining() < n {
        return Err(CodecError::Malformed(format!(
            "{what}: need {n} bytes, {} left",
            buf.remaining()
        )));
    }
    Ok(())
}

fn put_short_str(buf: &mut BytesMut, s: &str) {
    let bytes = &s.as_bytes()[..s.len().min(u8::MAX as usize)];
    buf.put_u8(bytes.len() as u8);
    buf.put_slice(bytes);
}

fn get_short_bytes(buf: &mut impl Buf, what: &str) -> Result<Vec<u8>, CodecError> {
    need(&*buf, 1, what)?;
    let len = buf.get_u8() as usize;
    need(&*buf, len, what)?;
    let mut out = vec![0u8; len];
    buf.copy_to_slice(&mut out);
    Ok(out)
}

fn expect_tag(buf: &mut impl Buf, supported: u8) -> Result<(), CodecError> {
    need(&*buf, 1, "format tag")?;
    let tag = buf.get_u8();
    if tag != supported {
        return Err(CodecError::UnsupportedVersion(tag));
    }
    Ok(())
}

fn expect_end(buf: &impl Buf) -> Result<(), CodecError> {
    if buf.has_remaining() {
        return Err(CodecError::Malformed(format!(
            "{} trailing bytes",
            buf.remaining()
        )));
    }
    Ok(())
}

// ── Session blob ────────────────────────────────────────────────────

pub fn encode_session(state: &SessionState) -> Bytes {
    let ticket = &state.ticket[..state.ticket.len().min(u16::MAX as usize)];
    let mut buf = BytesMut::with_capacity(50 + state.server_name.len() + ticket.len());
    buf.put_u8(SESSION_FORMAT_V2);
    buf.put_slice(&state.key_fingerprint);
    match state.peer.ip() {
        IpAddr::V4(ip) => {
            buf.put_u8(FAMILY_V4);
            buf.put_slice(&ip.octets());
        }
        IpAddr::V6(ip) => {
            buf.put_u8(FAMILY_V6);
            buf.put_slice(&ip.octets());
        }
    }
    buf.put_u16(state.peer.port());
    put_short_str(&mut buf, &state.server_name);
    buf.put_u16(state.protocol_version);
    buf.put_u16(state.cipher_suite);
    buf.put_u64(state.established_at_ms);
    buf.put_u64(state.last_used_ms);
    buf.put_u32(state.use_count);
    buf.put_u16(ticket.len() as u16);
    buf.put_slice(ticket);
    buf.freeze()
}

pub fn decode_session(blob: &[u8]) -> Result<SessionState, CodecError> {
    let mut buf = blob;
    expect_tag(&mut buf, SESSION_FORMAT_V2)?;

    need(&buf, 9, "fingerprint")?;
    let mut key_fingerprint = [0u8; 8];
    buf.copy_to_slice(&mut key_fingerprint);

    let ip = match buf.get_u8() {
        FAMILY_V4 => {
            need(&buf, 4, "ipv4 address")?;
            let mut octets = [0u8; 4];
            buf.copy_to_slice(&mut octets);
            IpAddr::V4(Ipv4Addr::from(octets))
        }
        FAMILY_V6 => {
            need(&buf, 16, "ipv6 address")?;
            let mut octets = [0u8; 16];
            buf.copy_to_slice(&mut octets);
            IpAddr::V6(Ipv6Addr::from(octets))
        }
        other => return Err(CodecError::Malformed(format!("unknown address family {other}"))),
    };
    need(&buf, 2, "port")?;
    let peer = SocketAddr::new(ip, buf.get_u16());

    let server_name = String::from_utf8(get_short_bytes(&mut buf, "server name")?)
        .map_err(|e| CodecError::Malformed(format!("server name: {e}")))?;

    need(&buf, 26, "session parameters")?;
    let protocol_version = buf.get_u16();
    let cipher_suite = buf.get_u16();
    let established_at_ms = buf.get_u64();
    let last_used_ms = buf.get_u64();
    let use_count = buf.get_u32();
    let ticket_len = buf.get_u16() as usize;
    need(&buf, ticket_len, "ticket")?;
    let state = SessionState {
        key_fingerprint,
        peer,
        server_name,
        protocol_version,
        cipher_suite,
        established_at_ms,
        last_used_ms,
        use_count,
        ticket: buf.copy_to_bytes(ticket_len),
    };
    expect_end(&buf)?;
    Ok(state)
}

// ── Pool entry ──────────────────────────────────────────────────────

pub fn encode_entry(entry: &PoolEntry) -> Vec<u8> {
    let mut buf = BytesMut::with_capacity(16 + entry.records.len() * 96);
    buf.put_u8(ENTRY_FORMAT_V1);
    buf.put_u64(entry.next_id);
    buf.put_u16(entry.records.len().min(u16::MAX as usize) as u16);
    for record in entry.records.iter().take(u16::MAX as usize) {
        buf.put_u64(record.id);
        buf.put_u64(record.last_used_ms);
        buf.put_u32(record.use_count);

        let blob = record
            .blob
            .as_ref()
            .filter(|b| b.len() <= u16::MAX as usize);
        let mut flags = 0u8;
        if record.lease.is_some() {
            flags |= FLAG_LEASED;
        }
        if blob.is_some() {
            flags |= FLAG_BLOB;
        }
        buf.put_u8(flags);

        if let Some(lease) = &record.lease {
            buf.put_u128(lease.token);
            buf.put_u64(lease.expires_at_ms);
            put_short_str(&mut buf, &lease.owner);
        }
        if let Some(blob) = blob {
            buf.put_u16(blob.len() as u16);
            buf.put_slice(blob);
        }
    }
    buf.to_vec()
}

pub fn decode_entry(raw: &[u8]) -> Result<PoolEntry, CodecError> {
    let mut buf = raw;
    expect_tag(&mut buf, ENTRY_FORMAT_V1)?;

    need(&buf, 10, "entry header")?;
    let next_id = buf.get_u64();
    let count = buf.get_u16() as usize;

    let mut records = Vec::with_capacity(count);
    for _ in 0..count {
        need(&buf, 21, "record header")?;
        let id = buf.get_u64();
        let last_used_ms = buf.get_u64();
        let use_count = buf.get_u32();
        let flags = buf.get_u8();

        let lease = if flags & FLAG_LEASED != 0 {
            need(&buf, 24, "lease")?;
            let token = buf.get_u128();
            let expires_at_ms = buf.get_u64();
            let owner = String::from_utf8_lossy(&get_short_bytes(&mut buf, "lease owner")?).into_owned();
            Some(LeaseInfo {
                token,
                expires_at_ms,
                owner,
            })
        } else {
            None
        };

        let blob = if flags & FLAG_BLOB != 0 {
            need(&buf, 2, "blob length")?;
            let len = buf.get_u16() as usize;
            need(&buf, len, "blob")?;
            Some(buf.copy_to_bytes(len))
        } else {
            None
        };

        records.push(PooledRecord {
            id,
            blob,
            last_used_ms,
            use_count,
            lease,
        });
    }
    expect_end(&buf)?;
    Ok(PoolEntry { next_id, records })
}
