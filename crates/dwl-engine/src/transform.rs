//! Per-row transform: source projection -> typed target row.
//!
//! The synthesized source SQL already aliases every value column under its
//! target column name, so a source row is positionally mapped through an
//! index map resolved once per chunk. Each column then runs its derivation
//! formula (if any), is coerced to the declared kind, falls back to its
//! default when required-but-null, and contributes to the stable row hash.

use chrono::NaiveDateTime;
use sha2::{Digest, Sha256};

use dwl_schemas::{ColumnPlan, CompiledFlow, ValueKind};
use dwl_store::{parse_date, parse_ts, SqlValue};

use crate::expr::{self, EvalError, Expr, RowContext};

/// One transformed target row, values aligned with the flow's column plans.
#[derive(Debug, Clone)]
pub struct TargetRow {
    pub values: Vec<SqlValue>,
    /// Primary-key values in key order.
    pub key: Vec<SqlValue>,
    /// Hex digest over the non-audit columns in declared order.
    pub hash: String,
}

/// Chunk-scoped transformer: parses formulas and resolves the source
/// column index map once, then runs rows through the hot path.
pub struct RowTransformer<'a> {
    flow: &'a CompiledFlow,
    /// Per plan column: position in the source projection.
    source_index: Vec<usize>,
    /// Per plan column: parsed derivation, if declared.
    derivations: Vec<Option<Expr>>,
    /// Plan positions of the primary-key columns, in key order.
    key_positions: Vec<usize>,
}

impl<'a> RowTransformer<'a> {
    pub fn new(flow: &'a CompiledFlow, source_columns: &[String]) -> Result<Self, EvalError> {
        let mut source_index = Vec::with_capacity(flow.columns.len());
        for plan in &flow.columns {
            let idx = source_columns
                .iter()
                .position(|c| c.eq_ignore_ascii_case(&plan.target_column))
                .ok_or_else(|| {
                    EvalError(format!(
                        "source projection is missing column {}",
                        plan.target_column
                    ))
                })?;
            source_index.push(idx);
        }

        let mut derivations = Vec::with_capacity(flow.columns.len());
        for plan in &flow.columns {
            derivations.push(match &plan.derivation_formula {
                Some(formula) => Some(expr::parse(formula)?),
                None => None,
            });
        }

        let mut key_positions = Vec::with_capacity(flow.primary_key.len());
        for key_column in &flow.primary_key {
            let pos = flow
                .columns
                .iter()
                .position(|p| p.target_column.eq_ignore_ascii_case(key_column))
                .ok_or_else(|| EvalError(format!("primary key column {key_column} unplanned")))?;
            key_positions.push(pos);
        }

        Ok(Self {
            flow,
            source_index,
            derivations,
            key_positions,
        })
    }

    pub fn transform(&self, source_values: &[SqlValue]) -> Result<TargetRow, EvalError> {
        let columns = &self.flow.columns;
        let mut out = Vec::with_capacity(columns.len());

        for (pos, plan) in columns.iter().enumerate() {
            let raw = source_values
                .get(self.source_index[pos])
                .cloned()
                .unwrap_or(SqlValue::Text(None));

            let derived = match &self.derivations[pos] {
                Some(expr) => {
                    let ctx = SourceRowContext {
                        flow: self.flow,
                        index: &self.source_index,
                        values: source_values,
                    };
                    expr::eval(expr, &ctx)?
                }
                None => raw,
            };

            let mut coerced = coerce(derived, plan.kind)
                .map_err(|e| EvalError(format!("column {}: {}", plan.target_column, e.0)))?;

            if coerced.is_null() && plan.is_required {
                match &plan.default_value {
                    Some(default) => {
                        coerced = coerce(SqlValue::Text(Some(default.clone())), plan.kind)
                            .map_err(|e| {
                                EvalError(format!(
                                    "default for {}: {}",
                                    plan.target_column, e.0
                                ))
                            })?;
                    }
                    None => {
                        return Err(EvalError(format!(
                            "required column {} is null and has no default",
                            plan.target_column
                        )))
                    }
                }
            }

            out.push(coerced);
        }

        let key: Vec<SqlValue> = self.key_positions.iter().map(|p| out[*p].clone()).collect();
        if key.iter().any(SqlValue::is_null) {
            return Err(EvalError("primary key value is null".into()));
        }

        let hash = row_hash(columns, &out);
        Ok(TargetRow {
            values: out,
            key,
            hash,
        })
    }
}

/// Column lookup over the raw source row, by target column name.
struct SourceRowContext<'a> {
    flow: &'a CompiledFlow,
    index: &'a [usize],
    values: &'a [SqlValue],
}

impl RowContext for SourceRowContext<'_> {
    fn value_of(&self, column: &str) -> Option<SqlValue> {
        let pos = self
            .flow
            .columns
            .iter()
            .position(|p| p.target_column.eq_ignore_ascii_case(column))?;
        self.values.get(self.index[pos]).cloned()
    }
}

/// Stable digest over the declared (non-audit) columns. The same source row
/// always hashes identically, which is what makes SCD skip/update
/// decisions deterministic.
pub fn row_hash(columns: &[ColumnPlan], values: &[SqlValue]) -> String {
    let mut hasher = Sha256::new();
    for (plan, value) in columns.iter().zip(values) {
        hasher.update(plan.target_column.as_bytes());
        hasher.update([0x1f]);
        hasher.update(canonical(value).as_bytes());
        hasher.update([0x1e]);
    }
    hex::encode(hasher.finalize())
}

fn canonical(v: &SqlValue) -> String {
    match v {
        SqlValue::Int(Some(n)) => format!("i:{n}"),
        SqlValue::Float(Some(f)) => format!("f:{f}"),
        SqlValue::Bool(Some(b)) => format!("b:{b}"),
        SqlValue::Text(Some(s)) => format!("t:{s}"),
        _ => "_".to_string(),
    }
}

/// Render a key tuple for logs and checkpoint bookkeeping.
pub fn key_display(key: &[SqlValue]) -> String {
    key.iter()
        .map(|v| v.read_large_text())
        .collect::<Vec<_>>()
        .join("|")
}

// ---------------------------------------------------------------------------
// Coercion
// ---------------------------------------------------------------------------

pub fn coerce(value: SqlValue, kind: ValueKind) -> Result<SqlValue, EvalError> {
    if value.is_null() {
        return Ok(match kind {
            ValueKind::Int => SqlValue::Int(None),
            ValueKind::Float => SqlValue::Float(None),
            ValueKind::Bool => SqlValue::Bool(None),
            ValueKind::Text | ValueKind::Date | ValueKind::Timestamp => SqlValue::Text(None),
        });
    }
    let out = match kind {
        ValueKind::Int => match &value {
            SqlValue::Int(_) => value,
            SqlValue::Float(Some(f)) if f.fract() == 0.0 => SqlValue::Int(Some(*f as i64)),
            SqlValue::Float(Some(f)) => {
                return Err(EvalError(format!("{f} is not an integer")));
            }
            SqlValue::Bool(Some(b)) => SqlValue::Int(Some(i64::from(*b))),
            SqlValue::Text(Some(s)) => SqlValue::Int(Some(
                s.trim()
                    .parse()
                    .map_err(|_| EvalError(format!("{s:?} is not an integer")))?,
            )),
            _ => unreachable!("null handled above"),
        },
        ValueKind::Float => match &value {
            SqlValue::Float(_) => value,
            SqlValue::Int(Some(n)) => SqlValue::Float(Some(*n as f64)),
            SqlValue::Text(Some(s)) => SqlValue::Float(Some(
                s.trim()
                    .parse()
                    .map_err(|_| EvalError(format!("{s:?} is not numeric")))?,
            )),
            SqlValue::Bool(Some(b)) => SqlValue::Float(Some(if *b { 1.0 } else { 0.0 })),
            _ => unreachable!("null handled above"),
        },
        ValueKind::Text => SqlValue::Text(Some(value.read_large_text())),
        ValueKind::Bool => match &value {
            SqlValue::Bool(_) => value,
            SqlValue::Int(Some(n)) => SqlValue::Bool(Some(*n != 0)),
            SqlValue::Text(Some(s)) => {
                let b = match s.trim().to_ascii_lowercase().as_str() {
                    "true" | "y" | "yes" | "1" => true,
                    "false" | "n" | "no" | "0" => false,
                    other => return Err(EvalError(format!("{other:?} is not boolean"))),
                };
                SqlValue::Bool(Some(b))
            }
            _ => return Err(EvalError("value is not boolean".into())),
        },
        ValueKind::Date => {
            let s = value.read_large_text();
            let day: String = s.chars().take(10).collect();
            parse_date(&day).map_err(|_| EvalError(format!("{s:?} is not a date")))?;
            SqlValue::Text(Some(day))
        }
        ValueKind::Timestamp => {
            let s = value.read_large_text();
            let normalized = if parse_ts(&s).is_ok() {
                s
            } else if let Ok(naive) = NaiveDateTime::parse_from_str(&s, "%Y-%m-%d %H:%M:%S") {
                naive.format("%Y-%m-%dT%H:%M:%S%.6fZ").to_string()
            } else if parse_date(&s).is_ok() {
                format!("{s}T00:00:00.000000Z")
            } else {
                return Err(EvalError(format!("{s:?} is not a timestamp")));
            };
            SqlValue::Text(Some(normalized))
        }
    };
    Ok(out)
}

#[cfg(test)]
mod tests {
    use dwl_schemas::codes::{CheckpointStrategy, ScdType};
    use dwl_schemas::CheckpointSpec;

    use super::*;

    fn plan(name: &str, kind: ValueKind, pk: Option<i32>) -> ColumnPlan {
        ColumnPlan {
            target_column: name.to_string(),
            data_type: "text".into(),
            kind,
            scd_type: ScdType::Type1,
            is_required: false,
            default_value: None,
            derivation_formula: None,
            primary_key_sequence: pk,
        }
    }

    fn flow(columns: Vec<ColumnPlan>, pk: Vec<&str>) -> CompiledFlow {
        CompiledFlow {
            mapping_reference: "M1".into(),
            source_sql: "select 1".into(),
            columns,
            primary_key: pk.into_iter().map(str::to_string).collect(),
            checkpoint: CheckpointSpec {
                strategy: CheckpointStrategy::None,
                column: None,
                enabled: false,
            },
            target_schema: String::new(),
            target_table: "t".into(),
            target_connection_id: None,
            block_process_rows: 100,
        }
    }

    #[test]
    fn maps_by_name_and_hashes_stably() {
        let f = flow(
            vec![
                plan("id", ValueKind::Int, Some(1)),
                plan("name", ValueKind::Text, None),
            ],
            vec!["id"],
        );
        let cols = vec!["name".to_string(), "id".to_string()];
        let tr = RowTransformer::new(&f, &cols).unwrap();

        let row = tr
            .transform(&[SqlValue::from("Ada"), SqlValue::from(7i64)])
            .unwrap();
        assert_eq!(row.key, vec![SqlValue::Int(Some(7))]);
        assert_eq!(row.values[0], SqlValue::Int(Some(7)));

        let again = tr
            .transform(&[SqlValue::from("Ada"), SqlValue::from(7i64)])
            .unwrap();
        assert_eq!(row.hash, again.hash);

        let changed = tr
            .transform(&[SqlValue::from("Bob"), SqlValue::from(7i64)])
            .unwrap();
        assert_ne!(row.hash, changed.hash);
    }

    #[test]
    fn derivation_runs_before_coercion() {
        let mut price = plan("price", ValueKind::Float, None);
        price.derivation_formula = Some("ROUND(price * qty, 2)".into());
        let f = flow(
            vec![
                plan("id", ValueKind::Int, Some(1)),
                price,
                plan("qty", ValueKind::Int, None),
            ],
            vec!["id"],
        );
        let cols = vec!["id".to_string(), "price".to_string(), "qty".to_string()];
        let tr = RowTransformer::new(&f, &cols).unwrap();
        let row = tr
            .transform(&[
                SqlValue::from(1i64),
                SqlValue::Float(Some(2.5)),
                SqlValue::from(3i64),
            ])
            .unwrap();
        assert_eq!(row.values[1], SqlValue::Float(Some(7.5)));
    }

    #[test]
    fn required_null_takes_default_or_fails() {
        let mut name = plan("name", ValueKind::Text, None);
        name.is_required = true;
        name.default_value = Some("unknown".into());
        let f = flow(
            vec![plan("id", ValueKind::Int, Some(1)), name],
            vec!["id"],
        );
        let cols = vec!["id".to_string(), "name".to_string()];
        let tr = RowTransformer::new(&f, &cols).unwrap();
        let row = tr
            .transform(&[SqlValue::from(1i64), SqlValue::Text(None)])
            .unwrap();
        assert_eq!(row.values[1], SqlValue::Text(Some("unknown".into())));

        let mut strict = plan("name", ValueKind::Text, None);
        strict.is_required = true;
        let f = flow(
            vec![plan("id", ValueKind::Int, Some(1)), strict],
            vec!["id"],
        );
        let tr = RowTransformer::new(&f, &cols).unwrap();
        assert!(tr
            .transform(&[SqlValue::from(1i64), SqlValue::Text(None)])
            .is_err());
    }

    #[test]
    fn null_primary_key_is_rejected() {
        let f = flow(vec![plan("id", ValueKind::Int, Some(1))], vec!["id"]);
        let cols = vec!["id".to_string()];
        let tr = RowTransformer::new(&f, &cols).unwrap();
        assert!(tr.transform(&[SqlValue::Int(None)]).is_err());
    }

    #[test]
    fn coercions() {
        assert_eq!(
            coerce(SqlValue::from("42"), ValueKind::Int).unwrap(),
            SqlValue::Int(Some(42))
        );
        assert_eq!(
            coerce(SqlValue::Float(Some(3.0)), ValueKind::Int).unwrap(),
            SqlValue::Int(Some(3))
        );
        assert!(coerce(SqlValue::Float(Some(3.5)), ValueKind::Int).is_err());
        assert_eq!(
            coerce(SqlValue::from(1i64), ValueKind::Bool).unwrap(),
            SqlValue::Bool(Some(true))
        );
        assert_eq!(
            coerce(SqlValue::from("2026-08-01"), ValueKind::Date).unwrap(),
            SqlValue::Text(Some("2026-08-01".into()))
        );
        assert_eq!(
            coerce(SqlValue::from("2026-08-01 09:30:00"), ValueKind::Timestamp).unwrap(),
            SqlValue::Text(Some("2026-08-01T09:30:00.000000Z".into()))
        );
        assert!(coerce(SqlValue::from("not a date"), ValueKind::Date).is_err());
    }
}
