//! redb table definitions for the cutover state store.
//!
//! Each table uses `&str` keys and `&[u8]` values (JSON-serialized),
//! except the history counters.

use redb::TableDefinition;

/// Deployment records keyed by `{environment}`.
pub const RECORDS: TableDefinition<&str, &[u8]> = TableDefinition::new("records");

/// Current traffic split keyed by `{environment}`.
pub const SPLITS: TableDefinition<&str, &[u8]> = TableDefinition::new("splits");

/// Routable traffic targets keyed by `{environment}:{revision}`.
pub const TARGETS: TableDefinition<&str, &[u8]> = TableDefinition::new("targets");

/// Locally registered revisions keyed by `{environment}:{revision}`.
pub const REVISIONS: TableDefinition<&str, &[u8]> = TableDefinition::new("revisions");

/// Local service bindings keyed by `{environment}`.
pub const SERVICES: TableDefinition<&str, &[u8]> = TableDefinition::new("services");

/// Deployment reports keyed by `{environment}:{seq:020}`.
pub const HISTORY: TableDefinition<&str, &[u8]> = TableDefinition::new("history");

/// Next history sequence number keyed by `{environment}`.
pub const HISTORY_SEQ: TableDefinition<&str, u64> = TableDefinition::new("history_seq");
