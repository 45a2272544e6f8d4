//! pushpool-state: the shared store capability behind the connection registry.
//!
//! # Architecture
//!
//! The registry only needs three primitives: `get`, `compare_and_set` and
//! `delete`, each optionally carrying an expiry. Every stored value has a
//! version; a write succeeds only if the caller saw the current version, so
//! racing processes never overwrite each other's mutations.
//!
//! [`MemoryStore`] serves single-process deployments and tests.
//! [`RedbStore`] persists entries in a redb file that processes on one host
//! open in turn.

pub mod error;
pub mod memory;
pub mod redb_store;
pub mod store;
pub mod tables;

pub use error::{StoreError, StoreResult};
pub use memory::MemoryStore;
pub use redb_store::RedbStore;
pub use store::{SharedStore, Versioned};
