//! Datatype registry per target dialect. A mapping detail's declared type
//! must resolve here; the resolved [`ValueKind`] drives engine-side
//! coercion.

use dwl_schemas::ValueKind;
use dwl_store::Dialect;

const POSTGRES_TYPES: &[(&str, ValueKind)] = &[
    ("bigint", ValueKind::Int),
    ("integer", ValueKind::Int),
    ("int", ValueKind::Int),
    ("smallint", ValueKind::Int),
    ("numeric", ValueKind::Float),
    ("decimal", ValueKind::Float),
    ("real", ValueKind::Float),
    ("double precision", ValueKind::Float),
    ("text", ValueKind::Text),
    ("varchar", ValueKind::Text),
    ("char", ValueKind::Text),
    ("date", ValueKind::Date),
    ("timestamp", ValueKind::Timestamp),
    ("timestamptz", ValueKind::Timestamp),
    ("boolean", ValueKind::Bool),
];

const SQLITE_TYPES: &[(&str, ValueKind)] = &[
    ("integer", ValueKind::Int),
    ("bigint", ValueKind::Int),
    ("int", ValueKind::Int),
    ("real", ValueKind::Float),
    ("numeric", ValueKind::Float),
    ("text", ValueKind::Text),
    ("varchar", ValueKind::Text),
    ("date", ValueKind::Date),
    ("timestamp", ValueKind::Timestamp),
    ("boolean", ValueKind::Bool),
];

/// Resolve a declared type (size suffixes tolerated, case-insensitive) for
/// the dialect. `None` means the type does not exist for this target.
pub fn resolve(dialect: Dialect, declared: &str) -> Option<ValueKind> {
    let base = declared
        .split('(')
        .next()
        .unwrap_or(declared)
        .trim()
        .to_ascii_lowercase();
    let table = match dialect {
        Dialect::Postgres => POSTGRES_TYPES,
        Dialect::Sqlite => SQLITE_TYPES,
    };
    table
        .iter()
        .find(|(name, _)| *name == base)
        .map(|(_, kind)| *kind)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sizes_and_case_are_tolerated() {
        assert_eq!(
            resolve(Dialect::Postgres, "VARCHAR(50)"),
            Some(ValueKind::Text)
        );
        assert_eq!(
            resolve(Dialect::Postgres, "Numeric(12, 2)"),
            Some(ValueKind::Float)
        );
    }

    #[test]
    fn unknown_types_resolve_to_none() {
        assert_eq!(resolve(Dialect::Sqlite, "clob"), None);
        assert_eq!(resolve(Dialect::Postgres, "number"), None);
    }
}
