//! Source SQL synthesis.
//!
//! A mapping's details are grouped by combination code; each group shares
//! one (snippet-resolved) source query projecting the group's key and value
//! columns. Compilation emits a single SELECT: the group carrying the
//! primary-key details drives, every other group LEFT JOINs to it on the
//! declared key columns, and each detail's value column is projected under
//! its target column name. The engine never rewrites this statement: it
//! only wraps it.

use crate::errors::{codes, ValidationError};

/// One combination group, snippet references already resolved.
#[derive(Debug, Clone)]
pub struct DetailGroup {
    pub combination_code: i32,
    pub source_sql: String,
    pub key_columns: Vec<String>,
    /// `(target_column, value_column)` pairs in execution order.
    pub columns: Vec<(String, String)>,
    pub has_primary_key: bool,
}

/// Synthesize the single source SELECT. Projection order follows the
/// caller's group/column order (declared order), independent of join order.
pub fn synthesize(procedure: &str, groups: &[DetailGroup]) -> Result<String, ValidationError> {
    if groups.is_empty() {
        return Err(ValidationError::new(
            codes::NULL_FIELD,
            procedure,
            ["details".to_string()],
            "mapping has no details",
        ));
    }

    let driving = groups
        .iter()
        .position(|g| g.has_primary_key)
        .ok_or_else(|| {
            ValidationError::new(
                codes::NO_PRIMARY_KEY,
                procedure,
                [],
                "no combination group carries the primary key",
            )
        })?;

    // Stable aliases: driving group is g0, the rest keep combination order.
    let mut alias_order: Vec<usize> = Vec::with_capacity(groups.len());
    alias_order.push(driving);
    alias_order.extend((0..groups.len()).filter(|i| *i != driving));
    let alias_of = |group_idx: usize| -> String {
        let pos = alias_order
            .iter()
            .position(|i| *i == group_idx)
            .expect("every group is aliased");
        format!("g{pos}")
    };

    let mut projections = Vec::new();
    for (idx, group) in groups.iter().enumerate() {
        let alias = alias_of(idx);
        for (target_column, value_column) in &group.columns {
            projections.push(format!("{alias}.{value_column} as {target_column}"));
        }
    }

    let mut sql = format!(
        "select {} from ({}) g0",
        projections.join(", "),
        groups[driving].source_sql.trim()
    );

    for (pos, group_idx) in alias_order.iter().enumerate().skip(1) {
        let group = &groups[*group_idx];
        if group.key_columns.is_empty() {
            return Err(ValidationError::new(
                codes::COMBINATION_INCONSISTENT,
                procedure,
                [group.combination_code.to_string()],
                format!(
                    "combination {} joins the driving query but declares no key columns",
                    group.combination_code
                ),
            ));
        }
        let alias = format!("g{pos}");
        let on = group
            .key_columns
            .iter()
            .map(|k| format!("g0.{k} = {alias}.{k}"))
            .collect::<Vec<_>>()
            .join(" and ");
        sql.push_str(&format!(
            " left join ({}) {alias} on {on}",
            group.source_sql.trim()
        ));
    }

    Ok(sql)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn group(code: i32, sql: &str, keys: &[&str], cols: &[(&str, &str)], pk: bool) -> DetailGroup {
        DetailGroup {
            combination_code: code,
            source_sql: sql.to_string(),
            key_columns: keys.iter().map(|s| s.to_string()).collect(),
            columns: cols
                .iter()
                .map(|(t, v)| (t.to_string(), v.to_string()))
                .collect(),
            has_primary_key: pk,
        }
    }

    #[test]
    fn single_group_projects_value_as_target() {
        let sql = synthesize(
            "compile",
            &[group(
                1,
                "select id, name from customers",
                &["id"],
                &[("cust_id", "id"), ("cust_name", "name")],
                true,
            )],
        )
        .unwrap();
        assert_eq!(
            sql,
            "select g0.id as cust_id, g0.name as cust_name \
             from (select id, name from customers) g0"
        );
    }

    #[test]
    fn second_group_left_joins_on_keys() {
        let sql = synthesize(
            "compile",
            &[
                group(
                    1,
                    "select id, name from customers",
                    &["id"],
                    &[("cust_id", "id"), ("cust_name", "name")],
                    true,
                ),
                group(
                    2,
                    "select id, balance from accounts",
                    &["id"],
                    &[("cust_balance", "balance")],
                    false,
                ),
            ],
        )
        .unwrap();
        assert!(sql.contains("left join (select id, balance from accounts) g1 on g0.id = g1.id"));
        assert!(sql.contains("g1.balance as cust_balance"));
    }

    #[test]
    fn joining_group_without_keys_is_rejected() {
        let err = synthesize(
            "compile",
            &[
                group(1, "select id from a", &["id"], &[("id", "id")], true),
                group(2, "select x from b", &[], &[("x", "x")], false),
            ],
        )
        .unwrap_err();
        assert_eq!(err.code, codes::COMBINATION_INCONSISTENT);
    }

    #[test]
    fn missing_primary_key_group_is_rejected() {
        let err = synthesize(
            "compile",
            &[group(1, "select x from b", &["x"], &[("x", "x")], false)],
        )
        .unwrap_err();
        assert_eq!(err.code, codes::NO_PRIMARY_KEY);
    }
}
