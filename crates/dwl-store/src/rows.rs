//! Typed accessors over dynamically decoded rows. Flags are `'Y'`/`'N'`
//! text; timestamps and dates are the fixed-width text forms from
//! [`crate::sql`].

use chrono::{DateTime, NaiveDate, Utc};
use sqlx::any::AnyRow;
use uuid::Uuid;

use crate::error::StoreError;
use crate::sql::{parse_date, parse_ts, SqlValue};
use crate::store::column_value;

pub fn text(row: &AnyRow, name: &str) -> Result<String, StoreError> {
    match column_value(row, name)? {
        SqlValue::Text(Some(s)) => Ok(s),
        other => Err(StoreError::Template(format!(
            "expected text column {name}, got {other:?}"
        ))),
    }
}

pub fn opt_text(row: &AnyRow, name: &str) -> Result<Option<String>, StoreError> {
    match column_value(row, name)? {
        SqlValue::Text(v) => Ok(v),
        other => Err(StoreError::Template(format!(
            "expected text column {name}, got {other:?}"
        ))),
    }
}

pub fn int(row: &AnyRow, name: &str) -> Result<i64, StoreError> {
    match column_value(row, name)? {
        SqlValue::Int(Some(v)) => Ok(v),
        other => Err(StoreError::Template(format!(
            "expected integer column {name}, got {other:?}"
        ))),
    }
}

pub fn opt_int(row: &AnyRow, name: &str) -> Result<Option<i64>, StoreError> {
    match column_value(row, name)? {
        SqlValue::Int(v) => Ok(v),
        SqlValue::Text(None) => Ok(None),
        other => Err(StoreError::Template(format!(
            "expected integer column {name}, got {other:?}"
        ))),
    }
}

pub fn flag(row: &AnyRow, name: &str) -> Result<bool, StoreError> {
    Ok(text(row, name)? == "Y")
}

pub fn opt_flag(row: &AnyRow, name: &str) -> Result<Option<bool>, StoreError> {
    Ok(opt_text(row, name)?.map(|s| s == "Y"))
}

pub fn ts(row: &AnyRow, name: &str) -> Result<DateTime<Utc>, StoreError> {
    parse_ts(&text(row, name)?)
}

pub fn opt_ts(row: &AnyRow, name: &str) -> Result<Option<DateTime<Utc>>, StoreError> {
    opt_text(row, name)?.map(|s| parse_ts(&s)).transpose()
}

pub fn date(row: &AnyRow, name: &str) -> Result<NaiveDate, StoreError> {
    parse_date(&text(row, name)?)
}

pub fn opt_date(row: &AnyRow, name: &str) -> Result<Option<NaiveDate>, StoreError> {
    opt_text(row, name)?.map(|s| parse_date(&s)).transpose()
}

pub fn uuid(row: &AnyRow, name: &str) -> Result<Uuid, StoreError> {
    let raw = text(row, name)?;
    raw.parse()
        .map_err(|e| StoreError::Template(format!("bad stored uuid {raw:?}: {e}")))
}

pub fn yn(v: bool) -> &'static str {
    if v {
        "Y"
    } else {
        "N"
    }
}
