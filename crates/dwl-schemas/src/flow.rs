//! The compiled execution plan for one mapping.
//!
//! Produced by the compiler, serialized into `dwl_job_flows.dw_logic`, and
//! deserialized by the execution engine. Self-contained: the engine needs
//! nothing beyond this struct and the run payload to execute.

use serde::{Deserialize, Serialize};

use crate::codes::{CheckpointStrategy, ScdType};
use crate::CheckpointSpec;

/// Audit columns the engine fills on target rows.
pub const COL_INSERT_BY: &str = "insrtby";
pub const COL_INSERT_DT: &str = "insrtdt";
pub const COL_UPDATE_BY: &str = "updtby";
pub const COL_UPDATE_DT: &str = "updtdt";

/// SCD-2 validity columns on target rows.
pub const COL_CURRENT_FLAG: &str = "curr_flag";
pub const COL_START_DT: &str = "start_dt";
pub const COL_END_DT: &str = "end_dt";

/// Columns excluded from the change-detection row hash.
pub const NON_HASHED_COLUMNS: [&str; 7] = [
    COL_INSERT_BY,
    COL_INSERT_DT,
    COL_UPDATE_BY,
    COL_UPDATE_DT,
    COL_CURRENT_FLAG,
    COL_START_DT,
    COL_END_DT,
];

/// SCD-3 "previous value" column for a target column.
pub fn previous_column(target_column: &str) -> String {
    format!("{target_column}_prev")
}

/// Coercion family a target column's declared data type maps to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ValueKind {
    Int,
    Float,
    Text,
    Bool,
    Date,
    Timestamp,
}

/// Per-target-column plan inside a compiled flow, in declared order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnPlan {
    pub target_column: String,
    /// Declared data type, verbatim, for DDL-facing messages.
    pub data_type: String,
    pub kind: ValueKind,
    pub scd_type: ScdType,
    pub is_required: bool,
    pub default_value: Option<String>,
    /// Engine-side formula evaluated over the projected row, if any.
    pub derivation_formula: Option<String>,
    /// Dense 1-based position within the primary key, if part of it.
    pub primary_key_sequence: Option<i32>,
}

impl ColumnPlan {
    pub fn is_primary_key(&self) -> bool {
        self.primary_key_sequence.is_some()
    }
}

/// The whole compiled plan. `source_sql` is the single synthesized SELECT;
/// the engine only ever wraps it (checkpoint / history predicates, chunk
/// windows), never rewrites it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompiledFlow {
    pub mapping_reference: String,
    pub source_sql: String,
    pub columns: Vec<ColumnPlan>,
    /// Target PK column names ordered by primary-key sequence.
    pub primary_key: Vec<String>,
    pub checkpoint: CheckpointSpec,
    pub target_schema: String,
    pub target_table: String,
    pub target_connection_id: Option<i64>,
    pub block_process_rows: i64,
}

impl CompiledFlow {
    /// Whether any column is governed by SCD-2 (the merge then has to keep
    /// the one-current-row-per-PK invariant).
    pub fn has_scd2(&self) -> bool {
        self.columns.iter().any(|c| c.scd_type == ScdType::Type2)
    }

    /// Effective checkpoint strategy after AUTO resolution: KEY when a
    /// checkpoint column is declared, engine-side row skip otherwise.
    pub fn effective_checkpoint(&self) -> CheckpointStrategy {
        if !self.checkpoint.enabled {
            return CheckpointStrategy::None;
        }
        match self.checkpoint.strategy {
            CheckpointStrategy::Auto => {
                if self.checkpoint.column.is_some() {
                    CheckpointStrategy::Key
                } else {
                    CheckpointStrategy::RowSkip
                }
            }
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn flow_with(strategy: CheckpointStrategy, column: Option<&str>) -> CompiledFlow {
        CompiledFlow {
            mapping_reference: "M1".into(),
            source_sql: "select 1 as id".into(),
            columns: vec![],
            primary_key: vec!["id".into()],
            checkpoint: CheckpointSpec {
                strategy,
                column: column.map(str::to_string),
                enabled: true,
            },
            target_schema: "dw".into(),
            target_table: "t".into(),
            target_connection_id: None,
            block_process_rows: 1000,
        }
    }

    #[test]
    fn auto_resolves_to_key_when_column_present() {
        let f = flow_with(CheckpointStrategy::Auto, Some("id"));
        assert_eq!(f.effective_checkpoint(), CheckpointStrategy::Key);
    }

    #[test]
    fn auto_resolves_to_row_skip_without_column() {
        let f = flow_with(CheckpointStrategy::Auto, None);
        assert_eq!(f.effective_checkpoint(), CheckpointStrategy::RowSkip);
    }

    #[test]
    fn disabled_checkpoint_is_none() {
        let mut f = flow_with(CheckpointStrategy::Key, Some("id"));
        f.checkpoint.enabled = false;
        assert_eq!(f.effective_checkpoint(), CheckpointStrategy::None);
    }

    #[test]
    fn previous_column_naming() {
        assert_eq!(previous_column("price"), "price_prev");
    }
}
