//! The two supported metadata/target dialects.
//!
//! Callers write SQL with `:name` placeholders and ask the dialect for the
//! few fragments that genuinely differ: bind markers, the current-timestamp
//! expression, skip-locked availability, and sequence access.

use dwl_config::DbType;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    Postgres,
    Sqlite,
}

impl From<DbType> for Dialect {
    fn from(t: DbType) -> Self {
        match t {
            DbType::Postgres => Dialect::Postgres,
            DbType::Sqlite => Dialect::Sqlite,
        }
    }
}

impl Dialect {
    /// Positional bind marker for the 1-based parameter `n`.
    pub fn bind_marker(&self, n: usize) -> String {
        match self {
            Dialect::Postgres => format!("${n}"),
            Dialect::Sqlite => "?".to_string(),
        }
    }

    /// Server-side current timestamp expression. Only used in DDL column
    /// defaults; application code always binds its own clock.
    pub fn current_timestamp_sql(&self) -> &'static str {
        match self {
            Dialect::Postgres => "now()",
            Dialect::Sqlite => "CURRENT_TIMESTAMP",
        }
    }

    /// Whether `FOR UPDATE SKIP LOCKED` exists. SQLite is single-writer, so
    /// a plain claim UPDATE is already race-free there.
    pub fn supports_skip_locked(&self) -> bool {
        matches!(self, Dialect::Postgres)
    }

    /// Whether backend sequence objects exist (sequence id strategy).
    pub fn supports_sequences(&self) -> bool {
        matches!(self, Dialect::Postgres)
    }

    /// `nextval` expression for a managed sequence.
    pub fn sequence_next_sql(&self, sequence: &str) -> Option<String> {
        match self {
            Dialect::Postgres => Some(format!("select nextval('{sequence}')")),
            Dialect::Sqlite => None,
        }
    }

    /// Empty a target table. SQLite has no TRUNCATE; an unfiltered DELETE
    /// is its equivalent.
    pub fn truncate_sql(&self, table: &str) -> String {
        match self {
            Dialect::Postgres => format!("truncate table {table}"),
            Dialect::Sqlite => format!("delete from {table}"),
        }
    }
}

/// Compose a schema-qualified object name; an empty prefix is allowed
/// (single-schema deployments).
pub fn qualified(prefix: Option<&str>, object: &str) -> String {
    match prefix {
        Some(p) if !p.is_empty() => format!("{p}.{object}"),
        _ => object.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bind_markers() {
        assert_eq!(Dialect::Postgres.bind_marker(3), "$3");
        assert_eq!(Dialect::Sqlite.bind_marker(3), "?");
    }

    #[test]
    fn qualification() {
        assert_eq!(qualified(Some("meta"), "dwl_mappings"), "meta.dwl_mappings");
        assert_eq!(qualified(None, "dwl_mappings"), "dwl_mappings");
        assert_eq!(qualified(Some(""), "dwl_mappings"), "dwl_mappings");
    }
}
