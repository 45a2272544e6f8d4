//! Error kinds surfaced by the pool manager and its collaborators.

use std::time::Duration;

use thiserror::Error;

use crate::codec::CodecError;

/// Errors produced while acquiring, using, or returning a pooled connection.
///
/// Only [`Connect`](PoolError::Connect), [`Handshake`](PoolError::Handshake),
/// [`Protocol`](PoolError::Protocol) and [`Timeout`](PoolError::Timeout) ever
/// reach a `with_connection` caller. The other kinds are recovered inside the
/// manager.
#[derive(Debug, Error)]
pub enum PoolError {
    /// Socket-level failure: connect, read, or write.
    #[error("connection to {endpoint} failed: {source}")]
    Connect {
        endpoint: String,
        #[source]
        source: std::io::Error,
    },

    /// TLS negotiation or certificate failure.
    #[error("tls handshake with {endpoint} failed: {reason}")]
    Handshake { endpoint: String, reason: String },

    /// A reused connection turned out to be dead.
    #[error("stale connection: {0}")]
    Stale(String),

    /// Transient shared-store failure.
    #[error("shared store unavailable: {0}")]
    StoreUnavailable(String),

    /// Session blob written by an incompatible encoder.
    #[error("unsupported session encoding version {0}")]
    EncodingVersion(u8),

    /// The remote end rejected a frame; the connection itself is healthy.
    #[error("gateway rejected frame (status {code}): {message}")]
    Protocol { code: u8, message: String },

    /// A deadline elapsed before the step finished.
    #[error("{stage} timed out after {after:?}")]
    Timeout { stage: &'static str, after: Duration },
}

impl PoolError {
    pub fn connect(endpoint: impl Into<String>, source: std::io::Error) -> Self {
        Self::Connect {
            endpoint: endpoint.into(),
            source,
        }
    }

    pub fn handshake(endpoint: impl Into<String>, reason: impl std::fmt::Display) -> Self {
        Self::Handshake {
            endpoint: endpoint.into(),
            reason: reason.to_string(),
        }
    }

    /// Whether the failure leaves the connection unusable.
    ///
    /// Transport failures discard the connection; a protocol rejection
    /// leaves it healthy and it goes back to the pool.
    pub fn is_transport(&self) -> bool {
        !matches!(self, Self::Protocol { .. })
    }
}

impl From<CodecError> for PoolError {
    fn from(err: CodecError) -> Self {
        match err {
            CodecError::UnsupportedVersion(tag) => Self::EncodingVersion(tag),
            other => Self::Stale(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn protocol_errors_are_not_transport() {
        let err = PoolError::Protocol {
            code: 8,
            message: "invalid token".to_string(),
        };
        assert!(!err.is_transport());
    }

    #[test]
    fn socket_failures_are_transport() {
        let io = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "broken pipe");
        assert!(PoolError::connect("gw:2195", io).is_transport());
        assert!(PoolError::Stale("peer closed".into()).is_transport());
        assert!(
            PoolError::Timeout {
                stage: "exchange",
                after: Duration::from_secs(1)
            }
            .is_transport()
        );
    }

    #[test]
    fn codec_version_maps_to_encoding_version() {
        let err: PoolError = CodecError::UnsupportedVersion(9).into();
        assert!(matches!(err, PoolError::EncodingVersion(9)));

        let err: PoolError = CodecError::Malformed("short".into()).into();
        assert!(matches!(err, PoolError::Stale(_)));
    }

    #[test]
    fn display_includes_context() {
        let err = PoolError::handshake("gw:2195", "bad certificate");
        assert_eq!(err.to_string(), "tls handshake with gw:2195 failed: bad certificate");
    }
}
