//! Flow construction: details -> combination groups -> synthesized source
//! SQL -> [`CompiledFlow`], plus the dependency-DAG check.

use std::collections::{BTreeMap, HashMap, HashSet};

use dwl_schemas::{ColumnPlan, CompiledFlow, JobFlow, MappingDetailDraft, MappingDraft};
use dwl_store::Dialect;

use crate::errors::{codes, ValidationError};
use crate::registry;
use crate::source::{synthesize, DetailGroup};

/// Assemble the compiled plan. Assumes `validate_details` has already
/// passed; structural errors found here are reported with the same codes.
pub fn build_flow(
    dialect: Dialect,
    mapping: &MappingDraft,
    details: &[MappingDetailDraft],
    resolved_sql: &HashMap<i32, String>,
) -> Result<CompiledFlow, ValidationError> {
    const PROCEDURE: &str = "compile";

    let mut by_combination: BTreeMap<i32, Vec<&MappingDetailDraft>> = BTreeMap::new();
    for d in details {
        by_combination.entry(d.combination_code).or_default().push(d);
    }

    let groups: Vec<DetailGroup> = by_combination
        .iter()
        .map(|(code, members)| {
            let mut members = members.clone();
            members.sort_by_key(|d| d.execution_sequence);
            DetailGroup {
                combination_code: *code,
                source_sql: resolved_sql.get(code).cloned().unwrap_or_default(),
                key_columns: members[0].key_columns.clone(),
                columns: members
                    .iter()
                    .map(|d| (d.target_column.clone(), d.value_column.clone()))
                    .collect(),
                has_primary_key: members.iter().any(|d| d.is_primary_key()),
            }
        })
        .collect();

    let source_sql = synthesize(PROCEDURE, &groups)?;

    // Column plans keep the declared order (combination, then execution
    // sequence): the row hash depends on it.
    let mut plans = Vec::with_capacity(details.len());
    for d in details {
        let kind = registry::resolve(dialect, &d.target_data_type).ok_or_else(|| {
            ValidationError::new(
                codes::UNKNOWN_DATA_TYPE,
                PROCEDURE,
                [d.target_column.clone(), d.target_data_type.clone()],
                format!("Unknown data type {}", d.target_data_type),
            )
        })?;
        plans.push(ColumnPlan {
            target_column: d.target_column.clone(),
            data_type: d.target_data_type.clone(),
            kind,
            scd_type: d.scd_type,
            is_required: d.is_required,
            default_value: d.default_value.clone(),
            derivation_formula: d.derivation_formula.clone(),
            primary_key_sequence: d.primary_key_sequence,
        });
    }

    let mut pk: Vec<(i32, String)> = details
        .iter()
        .filter_map(|d| d.primary_key_sequence.map(|s| (s, d.target_column.clone())))
        .collect();
    pk.sort_by_key(|(seq, _)| *seq);

    check_checkpoint(PROCEDURE, mapping, details)?;

    Ok(CompiledFlow {
        mapping_reference: mapping.reference.clone(),
        source_sql,
        columns: plans,
        primary_key: pk.into_iter().map(|(_, c)| c).collect(),
        checkpoint: mapping.checkpoint.clone(),
        target_schema: mapping.target_schema.clone(),
        target_table: mapping.target_table_name.clone(),
        target_connection_id: mapping.target_connection_id,
        block_process_rows: mapping.block_process_rows,
    })
}

/// A KEY (or column-resolved AUTO) checkpoint must name one of the target
/// columns; the engine filters and chunks on it.
pub fn check_checkpoint(
    procedure: &str,
    mapping: &MappingDraft,
    details: &[MappingDetailDraft],
) -> Result<(), ValidationError> {
    use dwl_schemas::codes::CheckpointStrategy;

    if !mapping.checkpoint.enabled {
        return Ok(());
    }
    let needs_column = matches!(mapping.checkpoint.strategy, CheckpointStrategy::Key);
    match (&mapping.checkpoint.column, needs_column) {
        (None, true) => Err(ValidationError::new(
            codes::CHECKPOINT_COLUMN_MISSING,
            procedure,
            [],
            "KEY checkpoint requires a checkpoint column",
        )),
        (Some(column), _) => {
            let known = details
                .iter()
                .any(|d| d.target_column.eq_ignore_ascii_case(column));
            if !known {
                return Err(ValidationError::new(
                    codes::CHECKPOINT_COLUMN_MISSING,
                    procedure,
                    [column.clone()],
                    format!("Checkpoint column {column} is not a target column"),
                ));
            }
            Ok(())
        }
        (None, false) => Ok(()),
    }
}

/// Walk the (single-parent) dependency chain from `candidate_dependency`;
/// reaching this mapping's own flow means a cycle.
pub fn check_dependency_dag(
    procedure: &str,
    reference: &str,
    candidate_dependency: i64,
    flows: &[JobFlow],
) -> Result<(), ValidationError> {
    let by_id: HashMap<i64, &JobFlow> = flows.iter().map(|f| (f.id, f)).collect();

    let mut visited = HashSet::new();
    let mut cursor = Some(candidate_dependency);
    while let Some(id) = cursor {
        if !visited.insert(id) {
            return Err(cycle_error(procedure, reference));
        }
        let Some(flow) = by_id.get(&id) else {
            return Err(ValidationError::new(
                codes::NULL_FIELD,
                procedure,
                [id.to_string()],
                format!("Dependency job flow {id} does not exist"),
            ));
        };
        if flow.mapping_reference == reference {
            return Err(cycle_error(procedure, reference));
        }
        cursor = flow.dependency_id;
    }
    Ok(())
}

fn cycle_error(procedure: &str, reference: &str) -> ValidationError {
    ValidationError::new(
        codes::DEPENDENCY_CYCLE,
        procedure,
        [reference.to_string()],
        format!("Job flow dependency of {reference} forms a cycle"),
    )
}
