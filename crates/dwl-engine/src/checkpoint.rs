//! Source-query assembly: the engine never rewrites the compiled SELECT,
//! it only wraps it: checkpoint predicate, history date range, chunk
//! window, deterministic ordering.

use dwl_schemas::codes::{CheckpointStrategy, LoadType};
use dwl_schemas::{CompiledFlow, RunPayload, ValueKind};
use dwl_store::{fmt_date, SqlValue};

use crate::EngineError;

/// The wrapped source statement plus its bind set. Chunk windows add
/// further conditions at read time.
#[derive(Debug, Clone)]
pub struct SourceQuery {
    base: String,
    conditions: Vec<String>,
    params: Vec<(&'static str, SqlValue)>,
}

impl SourceQuery {
    pub fn params(&self) -> Vec<(&'static str, SqlValue)> {
        self.params.clone()
    }

    pub fn count_sql(&self) -> String {
        format!(
            "select count(*) as n from ({}) src{}",
            self.base,
            self.where_clause(&[])
        )
    }

    pub fn min_max_sql(&self, column: &str) -> String {
        format!(
            "select min(src.{column}) as lo, max(src.{column}) as hi from ({}) src{}",
            self.base,
            self.where_clause(&[])
        )
    }

    pub fn read_sql(
        &self,
        extra_conditions: &[String],
        order_by: Option<&[String]>,
        limit_offset: Option<(i64, i64)>,
    ) -> String {
        let mut sql = format!(
            "select src.* from ({}) src{}",
            self.base,
            self.where_clause(extra_conditions)
        );
        if let Some(columns) = order_by {
            if !columns.is_empty() {
                sql.push_str(" order by ");
                sql.push_str(
                    &columns
                        .iter()
                        .map(|c| format!("src.{c}"))
                        .collect::<Vec<_>>()
                        .join(", "),
                );
            }
        }
        if let Some((limit, offset)) = limit_offset {
            sql.push_str(&format!(" limit {limit} offset {offset}"));
        }
        sql
    }

    fn where_clause(&self, extra: &[String]) -> String {
        let all: Vec<&String> = self.conditions.iter().chain(extra.iter()).collect();
        if all.is_empty() {
            String::new()
        } else {
            format!(
                " where {}",
                all.iter()
                    .map(|c| format!("({c})"))
                    .collect::<Vec<_>>()
                    .join(" and ")
            )
        }
    }
}

/// How this run resumes.
#[derive(Debug, Clone, PartialEq)]
pub enum ResumeMode {
    /// Fresh or checkpoint-free scan.
    None,
    /// KEY predicate already folded into the query.
    Key,
    /// Engine-side discard of the first `n` rows.
    RowSkip { skip: i64 },
}

/// Build the wrapped query for one run. History loads filter on the
/// checkpoint column and ignore any stored checkpoint; regular runs fold
/// the resume predicate in per strategy.
pub fn build_source_query(
    flow: &CompiledFlow,
    payload: &RunPayload,
    stored_checkpoint: Option<&str>,
) -> Result<(SourceQuery, ResumeMode), EngineError> {
    let mut query = SourceQuery {
        base: flow.source_sql.clone(),
        conditions: Vec::new(),
        params: Vec::new(),
    };

    if payload.load_type == LoadType::History {
        let window = payload
            .history
            .as_ref()
            .ok_or_else(|| EngineError::BadRequest("history load without a window".into()))?;
        let column = flow.checkpoint.column.as_deref().ok_or_else(|| {
            EngineError::BadRequest("history load needs a checkpoint column to filter on".into())
        })?;
        query
            .conditions
            .push(format!("src.{column} >= :history_start"));
        query.conditions.push(format!("src.{column} <= :history_end"));
        query
            .params
            .push(("history_start", SqlValue::from(fmt_date(window.start_date))));
        query
            .params
            .push(("history_end", SqlValue::from(fmt_date(window.end_date))));
        return Ok((query, ResumeMode::None));
    }

    match flow.effective_checkpoint() {
        CheckpointStrategy::Key => {
            let column = flow
                .checkpoint
                .column
                .as_deref()
                .ok_or_else(|| EngineError::BadRequest("KEY checkpoint without column".into()))?;
            match stored_checkpoint {
                Some(raw) => {
                    let kind = column_kind(flow, column);
                    query.conditions.push(format!("src.{column} > :checkpoint"));
                    query.params.push(("checkpoint", typed_checkpoint(kind, raw)));
                    Ok((query, ResumeMode::Key))
                }
                None => Ok((query, ResumeMode::Key)),
            }
        }
        CheckpointStrategy::RowSkip => {
            let skip = stored_checkpoint
                .and_then(|s| s.parse::<i64>().ok())
                .unwrap_or(0);
            Ok((query, ResumeMode::RowSkip { skip }))
        }
        _ => Ok((query, ResumeMode::None)),
    }
}

/// Kind of a target column, for typed checkpoint binds.
pub fn column_kind(flow: &CompiledFlow, column: &str) -> Option<ValueKind> {
    flow.columns
        .iter()
        .find(|p| p.target_column.eq_ignore_ascii_case(column))
        .map(|p| p.kind)
}

fn typed_checkpoint(kind: Option<ValueKind>, raw: &str) -> SqlValue {
    match kind {
        Some(ValueKind::Int) => raw
            .parse::<i64>()
            .map(SqlValue::from)
            .unwrap_or_else(|_| SqlValue::from(raw)),
        Some(ValueKind::Float) => raw
            .parse::<f64>()
            .map(SqlValue::from)
            .unwrap_or_else(|_| SqlValue::from(raw)),
        _ => SqlValue::from(raw),
    }
}

#[cfg(test)]
mod tests {
    use chrono::NaiveDate;
    use dwl_schemas::codes::ScdType;
    use dwl_schemas::{CheckpointSpec, ColumnPlan, HistoryWindow};

    use super::*;

    fn flow(strategy: CheckpointStrategy, column: Option<&str>) -> CompiledFlow {
        CompiledFlow {
            mapping_reference: "M1".into(),
            source_sql: "select id, name from customers".into(),
            columns: vec![ColumnPlan {
                target_column: "id".into(),
                data_type: "bigint".into(),
                kind: ValueKind::Int,
                scd_type: ScdType::Type1,
                is_required: true,
                default_value: None,
                derivation_formula: None,
                primary_key_sequence: Some(1),
            }],
            primary_key: vec!["id".into()],
            checkpoint: CheckpointSpec {
                strategy,
                column: column.map(str::to_string),
                enabled: true,
            },
            target_schema: String::new(),
            target_table: "t".into(),
            target_connection_id: None,
            block_process_rows: 100,
        }
    }

    #[test]
    fn key_resume_prefixes_predicate_with_typed_bind() {
        let f = flow(CheckpointStrategy::Key, Some("id"));
        let (q, mode) = build_source_query(&f, &RunPayload::regular(), Some("430")).unwrap();
        assert_eq!(mode, ResumeMode::Key);
        let sql = q.read_sql(&[], None, None);
        assert!(sql.contains("(src.id > :checkpoint)"));
        assert_eq!(q.params(), vec![("checkpoint", SqlValue::Int(Some(430)))]);
    }

    #[test]
    fn first_key_run_has_no_predicate() {
        let f = flow(CheckpointStrategy::Key, Some("id"));
        let (q, mode) = build_source_query(&f, &RunPayload::regular(), None).unwrap();
        assert_eq!(mode, ResumeMode::Key);
        assert!(!q.read_sql(&[], None, None).contains("where"));
    }

    #[test]
    fn row_skip_parses_stored_count() {
        let f = flow(CheckpointStrategy::RowSkip, None);
        let (_, mode) = build_source_query(&f, &RunPayload::regular(), Some("250")).unwrap();
        assert_eq!(mode, ResumeMode::RowSkip { skip: 250 });
    }

    #[test]
    fn history_filters_on_checkpoint_column_and_ignores_resume() {
        let f = flow(CheckpointStrategy::Key, Some("id"));
        let payload = RunPayload::history(HistoryWindow {
            start_date: NaiveDate::from_ymd_opt(2026, 1, 1).unwrap(),
            end_date: NaiveDate::from_ymd_opt(2026, 6, 30).unwrap(),
            truncate: false,
        });
        let (q, mode) = build_source_query(&f, &payload, Some("430")).unwrap();
        assert_eq!(mode, ResumeMode::None);
        let sql = q.read_sql(&[], None, None);
        assert!(sql.contains(":history_start") && sql.contains(":history_end"));
        assert!(!sql.contains(":checkpoint"));
    }

    #[test]
    fn chunk_conditions_and_ordering_compose() {
        let f = flow(CheckpointStrategy::None, None);
        let (q, _) = build_source_query(&f, &RunPayload::regular(), None).unwrap();
        let sql = q.read_sql(
            &["src.id >= 100".into(), "src.id < 200".into()],
            Some(&["id".to_string()]),
            Some((50, 10)),
        );
        assert!(sql.contains("(src.id >= 100) and (src.id < 200)"));
        assert!(sql.ends_with("order by src.id limit 50 offset 10"));
    }
}
