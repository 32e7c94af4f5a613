//! redb table definitions shared by every namespace in a database.
//!
//! Namespace tables are created at runtime (`&str` keys, `&[u8]` values
//! prefixed with an 8-byte big-endian version). The metadata table holds
//! the database-wide version sequence.

use redb::TableDefinition;

pub const META_TABLE_NAME: &str = "granary_meta";

/// Database-wide metadata keyed by name.
pub const META: TableDefinition<&str, u64> = TableDefinition::new(META_TABLE_NAME);

/// Key in [`META`] holding the last version handed out.
pub const VERSION_SEQ: &str = "version_seq";

/// Width of the version header on every stored value.
pub const VERSION_HEADER: usize = 8;
