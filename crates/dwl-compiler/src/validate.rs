//! Detail-set validation: the structural rules a mapping must satisfy
//! before it may be activated or compiled. Pure over the drafts; the SQL
//! prepare checks live on the compiler itself (they need a connection).

use std::collections::{BTreeMap, HashSet};

use dwl_schemas::MappingDetailDraft;
use dwl_store::Dialect;

use crate::errors::{codes, ValidationError};
use crate::naming::check_identifier;
use crate::registry;

const PROCEDURE: &str = "validate_mapping";

pub fn validate_details(
    dialect: Dialect,
    details: &[MappingDetailDraft],
) -> Result<(), ValidationError> {
    if details.is_empty() {
        return Err(ValidationError::new(
            codes::NULL_FIELD,
            PROCEDURE,
            ["details".to_string()],
            "mapping has no details",
        ));
    }

    // Target column names are identifiers and unique.
    let mut seen_targets = HashSet::new();
    for d in details {
        check_identifier(PROCEDURE, "target_column", &d.target_column)?;
        if !seen_targets.insert(d.target_column.to_ascii_lowercase()) {
            return Err(ValidationError::new(
                codes::DUPLICATE_TARGET_COLUMN,
                PROCEDURE,
                [d.target_column.clone()],
                format!("Duplicate target column {}", d.target_column),
            ));
        }
    }

    // Declared types must exist for the target dialect.
    for d in details {
        if registry::resolve(dialect, &d.target_data_type).is_none() {
            return Err(ValidationError::new(
                codes::UNKNOWN_DATA_TYPE,
                PROCEDURE,
                [d.target_column.clone(), d.target_data_type.clone()],
                format!(
                    "Unknown data type {} for target column {}",
                    d.target_data_type, d.target_column
                ),
            ));
        }
    }

    // At least one primary key; sequences dense (1..=n) and unique.
    let mut pk_seqs: Vec<i32> = details
        .iter()
        .filter_map(|d| d.primary_key_sequence)
        .collect();
    if pk_seqs.is_empty() {
        return Err(ValidationError::new(
            codes::NO_PRIMARY_KEY,
            PROCEDURE,
            [],
            "At least one primary key column is required",
        ));
    }
    pk_seqs.sort_unstable();
    let dense = pk_seqs
        .iter()
        .enumerate()
        .all(|(i, seq)| *seq == (i + 1) as i32);
    if !dense {
        return Err(ValidationError::new(
            codes::PRIMARY_KEY_SEQUENCE,
            PROCEDURE,
            pk_seqs.iter().map(|s| s.to_string()),
            "Primary key sequence must be dense and unique",
        ));
    }

    // Per combination: value columns unique, execution sequences unique,
    // shared map logic and key columns, and the PK confined to one group.
    let mut by_combination: BTreeMap<i32, Vec<&MappingDetailDraft>> = BTreeMap::new();
    for d in details {
        by_combination.entry(d.combination_code).or_default().push(d);
    }

    let mut pk_combinations = HashSet::new();
    for (code, group) in &by_combination {
        let mut seen_values = HashSet::new();
        let mut seen_sequences = HashSet::new();
        let first = group[0];
        for d in group {
            if !seen_values.insert(d.value_column.to_ascii_lowercase()) {
                return Err(ValidationError::new(
                    codes::DUPLICATE_VALUE_COLUMN,
                    PROCEDURE,
                    [code.to_string(), d.value_column.clone()],
                    format!(
                        "Duplicate value column {} within combination {code}",
                        d.value_column
                    ),
                ));
            }
            if !seen_sequences.insert(d.execution_sequence) {
                return Err(ValidationError::new(
                    codes::COMBINATION_INCONSISTENT,
                    PROCEDURE,
                    [code.to_string(), d.execution_sequence.to_string()],
                    format!("Duplicate execution sequence within combination {code}"),
                ));
            }
            if d.map_logic != first.map_logic {
                return Err(ValidationError::new(
                    codes::COMBINATION_INCONSISTENT,
                    PROCEDURE,
                    [code.to_string(), d.target_column.clone()],
                    format!("Combination {code} mixes different map logic"),
                ));
            }
            if normalized_keys(&d.key_columns) != normalized_keys(&first.key_columns) {
                return Err(ValidationError::new(
                    codes::COMBINATION_INCONSISTENT,
                    PROCEDURE,
                    [code.to_string(), d.target_column.clone()],
                    format!("Combination {code} mixes different key columns"),
                ));
            }
            if d.is_primary_key() {
                pk_combinations.insert(*code);
            }
        }
    }

    if pk_combinations.len() > 1 {
        return Err(ValidationError::new(
            codes::COMBINATION_INCONSISTENT,
            PROCEDURE,
            pk_combinations.iter().map(|c| c.to_string()),
            "Primary key columns must belong to a single combination",
        ));
    }

    Ok(())
}

/// Lookup: combination code of the group carrying the primary key.
pub fn primary_key_combination(details: &[MappingDetailDraft]) -> Option<i32> {
    details
        .iter()
        .find(|d| d.is_primary_key())
        .map(|d| d.combination_code)
}

/// Group key-column sets are order-insensitive.
fn normalized_keys(keys: &[String]) -> Vec<String> {
    let mut k: Vec<String> = keys.iter().map(|s| s.to_ascii_lowercase()).collect();
    k.sort();
    k
}
