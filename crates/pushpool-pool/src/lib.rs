//! pushpool-pool: persistent gateway connections shared across processes.
//!
//! # Architecture
//!
//! ```text
//! PoolManager::with_connection(key, timeout, exchange)
//!   → Registry (shared store, compare-and-set)  lease / return / discard
//!   → Transport (TlsTransport)                  establish / reconstruct
//!   → codec                                     session blob ⇄ SessionState
//! ```
//!
//! No process holds pooled state of its own. A connection is "returned" by
//! writing its session blob to the registry; any process that later leases
//! the record resumes the session from that blob.

pub mod codec;
pub mod credentials;
pub mod error;
pub mod manager;
pub mod registry;
pub mod tls;
pub mod transport;

pub use codec::{CodecError, SessionState};
pub use credentials::{ClientIdentity, CredentialProvider, PemCredentialProvider};
pub use error::PoolError;
pub use manager::PoolManager;
pub use registry::{Checkout, Lease, PoolStats, Registry};
pub use tls::{TlsSettings, TlsTransport};
pub use transport::{LiveConnection, Origin, SessionStream, TicketSlot, Transport};

pub use futures::future::BoxFuture;
