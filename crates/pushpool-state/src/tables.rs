//! redb table definitions for the shared store.

use redb::TableDefinition;

/// Pool entries keyed by store key. Values are `version (u64 BE) | expires_at_ms (u64 BE) | payload`;
/// an expiry of zero means the entry never expires.
pub const ENTRIES: TableDefinition<&str, &[u8]> = TableDefinition::new("entries");
