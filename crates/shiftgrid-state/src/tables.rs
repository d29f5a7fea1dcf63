//! redb table definitions.
//!
//! All tables map a composite `namespace/name` key to a JSON-serialized
//! value.

use redb::TableDefinition;

pub const ROLLOUTS: TableDefinition<&str, &[u8]> = TableDefinition::new("rollouts");
pub const WORKLOADS: TableDefinition<&str, &[u8]> = TableDefinition::new("workloads");
pub const PODS: TableDefinition<&str, &[u8]> = TableDefinition::new("pods");
