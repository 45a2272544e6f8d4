//! Error types for the shared store.

use std::time::Duration;

use thiserror::Error;

/// Result type alias for shared store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Failures of a shared store round trip.
///
/// A missing key is not an error: `get` returns `Ok(None)`. Everything here
/// is transient from the registry's point of view.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("failed to open store: {0}")]
    Open(String),

    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("store operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("stored value is corrupt: {0}")]
    Corrupt(String),
}
