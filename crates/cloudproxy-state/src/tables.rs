//! redb table definitions for the persisted fleet state.
//!
//! Each table uses `&str` keys and `&[u8]` values (JSON-serialized domain types).

use redb::TableDefinition;

/// Instance groups keyed by `{provider}/{instance}`.
pub const GROUPS: TableDefinition<&str, &[u8]> = TableDefinition::new("groups");

/// Destroy queue entries keyed by proxy IP.
pub const DESTROY_QUEUE: TableDefinition<&str, &[u8]> = TableDefinition::new("destroy_queue");

/// Operator settings (rolling policy) keyed by name.
pub const SETTINGS: TableDefinition<&str, &[u8]> = TableDefinition::new("settings");
