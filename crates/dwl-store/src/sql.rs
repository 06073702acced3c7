//! Named-parameter templates and the dynamic value type.
//!
//! Repositories write `:name` placeholders; [`render_named`] turns the
//! template into dialect-positional SQL plus an ordered bind list. Values
//! carry their type through `SqlValue`, so NULLs stay typed on both
//! backends.

use chrono::{DateTime, NaiveDate, Utc};
use sqlx::any::AnyRow;
use sqlx::{Column, Row, TypeInfo};
use uuid::Uuid;

use crate::dialect::Dialect;
use crate::error::StoreError;

/// Timestamps persist as fixed-width RFC-3339 UTC text so lexicographic
/// comparison matches chronological order on both dialects.
const TS_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.6fZ";
const DATE_FORMAT: &str = "%Y-%m-%d";

pub fn fmt_ts(ts: DateTime<Utc>) -> String {
    ts.format(TS_FORMAT).to_string()
}

pub fn parse_ts(s: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| StoreError::Template(format!("bad stored timestamp {s:?}: {e}")))
}

pub fn fmt_date(d: NaiveDate) -> String {
    d.format(DATE_FORMAT).to_string()
}

pub fn parse_date(s: &str) -> Result<NaiveDate, StoreError> {
    NaiveDate::parse_from_str(s, DATE_FORMAT)
        .map_err(|e| StoreError::Template(format!("bad stored date {s:?}: {e}")))
}

// ---------------------------------------------------------------------------
// SqlValue
// ---------------------------------------------------------------------------

/// Dynamically typed bind/decode value. Each variant carries its own
/// nullability so a NULL still binds with the right backend type.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    Int(Option<i64>),
    Float(Option<f64>),
    Bool(Option<bool>),
    Text(Option<String>),
}

impl SqlValue {
    pub fn null_text() -> Self {
        SqlValue::Text(None)
    }

    pub fn null_int() -> Self {
        SqlValue::Int(None)
    }

    pub fn is_null(&self) -> bool {
        matches!(
            self,
            SqlValue::Int(None) | SqlValue::Float(None) | SqlValue::Bool(None) | SqlValue::Text(None)
        )
    }

    /// Idempotent large-text read-back: text passes through, scalars are
    /// rendered. Comparisons over large bodies always go through here.
    pub fn read_large_text(&self) -> String {
        match self {
            SqlValue::Text(Some(s)) => s.clone(),
            SqlValue::Text(None) => String::new(),
            SqlValue::Int(v) => v.map(|v| v.to_string()).unwrap_or_default(),
            SqlValue::Float(v) => v.map(|v| v.to_string()).unwrap_or_default(),
            SqlValue::Bool(v) => v.map(|v| v.to_string()).unwrap_or_default(),
        }
    }
}

impl From<i64> for SqlValue {
    fn from(v: i64) -> Self {
        SqlValue::Int(Some(v))
    }
}

impl From<i32> for SqlValue {
    fn from(v: i32) -> Self {
        SqlValue::Int(Some(v as i64))
    }
}

impl From<f64> for SqlValue {
    fn from(v: f64) -> Self {
        SqlValue::Float(Some(v))
    }
}

impl From<bool> for SqlValue {
    fn from(v: bool) -> Self {
        SqlValue::Bool(Some(v))
    }
}

impl From<&str> for SqlValue {
    fn from(v: &str) -> Self {
        SqlValue::Text(Some(v.to_string()))
    }
}

impl From<String> for SqlValue {
    fn from(v: String) -> Self {
        SqlValue::Text(Some(v))
    }
}

impl From<Option<i64>> for SqlValue {
    fn from(v: Option<i64>) -> Self {
        SqlValue::Int(v)
    }
}

impl From<Option<String>> for SqlValue {
    fn from(v: Option<String>) -> Self {
        SqlValue::Text(v)
    }
}

impl From<DateTime<Utc>> for SqlValue {
    fn from(v: DateTime<Utc>) -> Self {
        SqlValue::Text(Some(fmt_ts(v)))
    }
}

impl From<Option<DateTime<Utc>>> for SqlValue {
    fn from(v: Option<DateTime<Utc>>) -> Self {
        SqlValue::Text(v.map(fmt_ts))
    }
}

impl From<NaiveDate> for SqlValue {
    fn from(v: NaiveDate) -> Self {
        SqlValue::Text(Some(fmt_date(v)))
    }
}

impl From<Option<NaiveDate>> for SqlValue {
    fn from(v: Option<NaiveDate>) -> Self {
        SqlValue::Text(v.map(fmt_date))
    }
}

impl From<Uuid> for SqlValue {
    fn from(v: Uuid) -> Self {
        SqlValue::Text(Some(v.to_string()))
    }
}

// ---------------------------------------------------------------------------
// Template rendering
// ---------------------------------------------------------------------------

/// Render a `:name` template into positional SQL for the dialect, plus the
/// bind values in marker order. A parameter may appear more than once; a
/// name in the SQL without a binding (or the reverse) is a template error.
pub fn render_named(
    sql: &str,
    dialect: Dialect,
    params: &[(&str, SqlValue)],
) -> Result<(String, Vec<SqlValue>), StoreError> {
    let mut out = String::with_capacity(sql.len());
    let mut values: Vec<SqlValue> = Vec::with_capacity(params.len());
    let mut used = vec![false; params.len()];

    let bytes = sql.as_bytes();
    let mut i = 0;
    let mut in_quote = false;

    while i < bytes.len() {
        let c = bytes[i] as char;
        if in_quote {
            out.push(c);
            if c == '\'' {
                in_quote = false;
            }
            i += 1;
            continue;
        }
        match c {
            '\'' => {
                in_quote = true;
                out.push(c);
                i += 1;
            }
            ':' if i + 1 < bytes.len() && bytes[i + 1] == b':' => {
                // Postgres-style cast, not a placeholder.
                out.push_str("::");
                i += 2;
            }
            ':' if i + 1 < bytes.len() && is_ident_start(bytes[i + 1] as char) => {
                let start = i + 1;
                let mut end = start;
                while end < bytes.len() && is_ident_char(bytes[end] as char) {
                    end += 1;
                }
                let name = &sql[start..end];
                let idx = params
                    .iter()
                    .position(|(n, _)| *n == name)
                    .ok_or_else(|| {
                        StoreError::Template(format!("placeholder :{name} has no binding"))
                    })?;
                used[idx] = true;
                values.push(params[idx].1.clone());
                out.push_str(&dialect.bind_marker(values.len()));
                i = end;
            }
            _ => {
                out.push(c);
                i += 1;
            }
        }
    }

    if let Some(pos) = used.iter().position(|u| !u) {
        return Err(StoreError::Template(format!(
            "binding {:?} not referenced by the template",
            params[pos].0
        )));
    }

    Ok((out, values))
}

fn is_ident_start(c: char) -> bool {
    c.is_ascii_alphabetic() || c == '_'
}

fn is_ident_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_'
}

/// Bind rendered values onto a query in marker order.
pub fn bind_values<'q>(
    mut query: sqlx::query::Query<'q, sqlx::Any, sqlx::any::AnyArguments<'q>>,
    values: Vec<SqlValue>,
) -> sqlx::query::Query<'q, sqlx::Any, sqlx::any::AnyArguments<'q>> {
    for v in values {
        query = match v {
            SqlValue::Int(v) => query.bind(v),
            SqlValue::Float(v) => query.bind(v),
            SqlValue::Bool(v) => query.bind(v),
            SqlValue::Text(v) => query.bind(v),
        };
    }
    query
}

// ---------------------------------------------------------------------------
// Row decoding
// ---------------------------------------------------------------------------

/// Decode one column of an Any row into a [`SqlValue`] by declared type
/// family. Unknown families fall back to text.
pub fn value_at(row: &AnyRow, idx: usize) -> Result<SqlValue, StoreError> {
    let type_name = row.column(idx).type_info().name().to_ascii_uppercase();
    let v = if type_name.contains("INT") {
        SqlValue::Int(row.try_get::<Option<i64>, _>(idx).map_err(crate::error::classify)?)
    } else if ["REAL", "FLOAT", "DOUBLE", "NUMERIC", "DECIMAL"]
        .iter()
        .any(|t| type_name.contains(t))
    {
        SqlValue::Float(row.try_get::<Option<f64>, _>(idx).map_err(crate::error::classify)?)
    } else if type_name.contains("BOOL") {
        SqlValue::Bool(row.try_get::<Option<bool>, _>(idx).map_err(crate::error::classify)?)
    } else {
        SqlValue::Text(row.try_get::<Option<String>, _>(idx).map_err(crate::error::classify)?)
    };
    Ok(v)
}

/// Decode a whole row positionally, with its column names. The engine
/// resolves names to positions once per chunk and addresses values by
/// index in the hot path.
pub fn decode_row(row: &AnyRow) -> Result<(Vec<String>, Vec<SqlValue>), StoreError> {
    let names = row
        .columns()
        .iter()
        .map(|c| c.name().to_string())
        .collect::<Vec<_>>();
    let mut values = Vec::with_capacity(names.len());
    for idx in 0..names.len() {
        values.push(value_at(row, idx)?);
    }
    Ok((names, values))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_postgres_markers_in_order() {
        let (sql, values) = render_named(
            "insert into t (a, b, a2) values (:a, :b, :a)",
            Dialect::Postgres,
            &[("a", SqlValue::from(1i64)), ("b", SqlValue::from("x"))],
        )
        .unwrap();
        assert_eq!(sql, "insert into t (a, b, a2) values ($1, $2, $3)");
        assert_eq!(
            values,
            vec![SqlValue::from(1i64), SqlValue::from("x"), SqlValue::from(1i64)]
        );
    }

    #[test]
    fn renders_sqlite_question_marks() {
        let (sql, _) = render_named(
            "select * from t where a = :a",
            Dialect::Sqlite,
            &[("a", SqlValue::from(5i64))],
        )
        .unwrap();
        assert_eq!(sql, "select * from t where a = ?");
    }

    #[test]
    fn skips_quoted_text_and_casts() {
        let (sql, values) = render_named(
            "select ':not_a_param', x::text from t where y = :y",
            Dialect::Postgres,
            &[("y", SqlValue::from(2i64))],
        )
        .unwrap();
        assert_eq!(sql, "select ':not_a_param', x::text from t where y = $1");
        assert_eq!(values.len(), 1);
    }

    #[test]
    fn unknown_placeholder_is_an_error() {
        let err = render_named("select :missing", Dialect::Sqlite, &[]).unwrap_err();
        assert!(matches!(err, StoreError::Template(_)));
    }

    #[test]
    fn unused_binding_is_an_error() {
        let err = render_named(
            "select 1",
            Dialect::Sqlite,
            &[("extra", SqlValue::from(1i64))],
        )
        .unwrap_err();
        assert!(matches!(err, StoreError::Template(_)));
    }

    #[test]
    fn timestamps_are_fixed_width_and_ordered() {
        let a = fmt_ts("2024-01-02T03:04:05Z".parse().unwrap());
        let b = fmt_ts("2024-01-02T03:04:06Z".parse().unwrap());
        assert_eq!(a.len(), b.len());
        assert!(a < b);
        assert_eq!(
            parse_ts(&a).unwrap(),
            "2024-01-02T03:04:05Z".parse::<DateTime<Utc>>().unwrap()
        );
    }

    #[test]
    fn large_text_read_back_is_idempotent() {
        let v = SqlValue::Text(Some("select 1".into()));
        assert_eq!(v.read_large_text(), "select 1");
        assert_eq!(SqlValue::Int(Some(7)).read_large_text(), "7");
    }
}
