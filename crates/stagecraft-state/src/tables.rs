//! redb table definitions for the Stagecraft state store.
//!
//! Each table uses `&str` keys and `&[u8]` values (JSON-serialized domain types).

use redb::TableDefinition;

/// Run records keyed by `{run_id}`.
pub const RUNS: TableDefinition<&str, &[u8]> = TableDefinition::new("runs");

/// Approvals keyed by `{run_id}:{stage}`.
pub const APPROVALS: TableDefinition<&str, &[u8]> = TableDefinition::new("approvals");

/// Abort requests keyed by `{run_id}`.
pub const ABORTS: TableDefinition<&str, &[u8]> = TableDefinition::new("aborts");

/// Last known-good artifact keyed by `{pipeline}/{stage}`.
pub const RELEASES: TableDefinition<&str, &[u8]> = TableDefinition::new("releases");

/// Fleet scaling state keyed by `{pipeline}/{stage}:{fleet}`.
pub const SCALING: TableDefinition<&str, &[u8]> = TableDefinition::new("scaling");
