//! SCD merge: batched PK lookups, then INSERT / skip / SCD-1 / SCD-2 /
//! SCD-3 per transformed row, one transaction per chunk.
//!
//! Single-writer-per-PK: with key-aligned chunks the worker applies
//! everything, including SCD-2 expiry, locally. Otherwise the expiry and
//! its replacement insert travel together to one serialized expirer task,
//! so the one-current-row-per-PK invariant never has two writers.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tracing::debug;

use dwl_schemas::codes::ScdType;
use dwl_schemas::flow::{
    previous_column, COL_CURRENT_FLAG, COL_END_DT, COL_INSERT_BY, COL_INSERT_DT, COL_START_DT,
    COL_UPDATE_BY, COL_UPDATE_DT,
};
use dwl_schemas::CompiledFlow;
use dwl_store::{sql::value_at, SqlValue, Store, StoreError, Tx};

use crate::transform::{key_display, row_hash, TargetRow};

const LOOKUP_BATCH: usize = 400;

#[derive(Debug, Default, Clone, Copy)]
pub struct MergeOutcome {
    pub written: i64,
    pub skipped: i64,
}

/// An SCD-2 change routed through the serialized expirer.
pub struct Scd2Pair {
    pub key: Vec<SqlValue>,
    pub row: TargetRow,
}

pub struct Scd2Batch {
    pub pairs: Vec<Scd2Pair>,
    pub ack: oneshot::Sender<Result<i64, StoreError>>,
}

#[derive(Clone)]
pub struct Merger {
    target: Store,
    flow: Arc<CompiledFlow>,
    table: String,
    actor: String,
    /// Effective timestamp of this run: SCD-2 validity boundary and audit
    /// time.
    effective_ts: String,
}

struct Existing {
    values: Vec<SqlValue>,
    hash: String,
}

enum Action<'a> {
    Insert(&'a TargetRow),
    Skip,
    Scd1 {
        row: &'a TargetRow,
        changed: Vec<usize>,
    },
    Scd3 {
        row: &'a TargetRow,
        changed: Vec<usize>,
        previous: Vec<(String, SqlValue)>,
    },
    Scd2(&'a TargetRow),
}

impl Merger {
    pub fn new(target: Store, flow: Arc<CompiledFlow>, actor: &str, effective_ts: String) -> Self {
        let table = target.data_object(&flow.target_schema, &flow.target_table);
        Self {
            target,
            flow,
            table,
            actor: actor.to_string(),
            effective_ts,
        }
    }

    pub fn store(&self) -> &Store {
        &self.target
    }

    /// Merge one chunk's rows. Within the chunk the last row per key wins
    /// (deterministic: source order).
    pub async fn merge_rows(
        &self,
        rows: &[TargetRow],
        scd2_tx: Option<&mpsc::Sender<Scd2Batch>>,
    ) -> Result<MergeOutcome, StoreError> {
        if rows.is_empty() {
            return Ok(MergeOutcome::default());
        }

        let mut by_key: HashMap<String, &TargetRow> = HashMap::new();
        for row in rows {
            by_key.insert(key_display(&row.key), row);
        }
        let deduped: Vec<&TargetRow> = by_key.values().copied().collect();

        let existing = self.lookup(&deduped).await?;

        let mut outcome = MergeOutcome::default();
        let mut scd2_pairs: Vec<Scd2Pair> = Vec::new();
        let mut tx = self.target.begin().await?;

        for row in &deduped {
            let action = self.classify(row, existing.get(&key_display(&row.key)));
            match action {
                Action::Skip => outcome.skipped += 1,
                Action::Insert(row) => {
                    self.insert_row(&mut tx, row).await?;
                    outcome.written += 1;
                }
                Action::Scd1 { row, changed } => {
                    self.update_row(&mut tx, row, &changed, &[]).await?;
                    outcome.written += 1;
                }
                Action::Scd3 {
                    row,
                    changed,
                    previous,
                } => {
                    self.update_row(&mut tx, row, &changed, &previous).await?;
                    outcome.written += 1;
                }
                Action::Scd2(row) => {
                    if scd2_tx.is_some() {
                        scd2_pairs.push(Scd2Pair {
                            key: row.key.clone(),
                            row: (*row).clone(),
                        });
                    } else {
                        self.expire_and_insert(&mut tx, &row.key, row).await?;
                        outcome.written += 1;
                    }
                }
            }
        }

        tx.commit().await?;

        if let Some(sender) = scd2_tx {
            if !scd2_pairs.is_empty() {
                let (ack, done) = oneshot::channel();
                sender
                    .send(Scd2Batch {
                        pairs: scd2_pairs,
                        ack,
                    })
                    .await
                    .map_err(|_| StoreError::Template("scd2 expirer is gone".into()))?;
                let written = done
                    .await
                    .map_err(|_| StoreError::Template("scd2 expirer dropped the ack".into()))??;
                outcome.written += written;
            }
        }

        Ok(outcome)
    }

    /// Apply one serialized SCD-2 batch (runs on the dedicated expirer
    /// task).
    pub async fn apply_scd2_batch(&self, pairs: &[Scd2Pair]) -> Result<i64, StoreError> {
        let mut tx = self.target.begin().await?;
        for pair in pairs {
            self.expire_and_insert(&mut tx, &pair.key, &pair.row).await?;
        }
        tx.commit().await?;
        debug!(pairs = pairs.len(), "scd2 batch applied");
        Ok(pairs.len() as i64)
    }

    fn classify<'a>(&self, row: &'a TargetRow, existing: Option<&Existing>) -> Action<'a> {
        let Some(existing) = existing else {
            return Action::Insert(row);
        };
        if existing.hash == row.hash {
            return Action::Skip;
        }

        let columns = &self.flow.columns;
        let changed: Vec<usize> = (0..columns.len())
            .filter(|i| existing.values.get(*i) != row.values.get(*i))
            .collect();
        if changed.is_empty() {
            // Hash covers exactly these columns; a hash mismatch with no
            // column delta cannot happen, but skip is the safe answer.
            return Action::Skip;
        }

        if changed.iter().any(|i| columns[*i].scd_type == ScdType::Type2) {
            return Action::Scd2(row);
        }
        if changed.iter().any(|i| columns[*i].scd_type == ScdType::Type3) {
            let previous = changed
                .iter()
                .filter(|i| columns[**i].scd_type == ScdType::Type3)
                .map(|i| {
                    (
                        previous_column(&columns[*i].target_column),
                        existing.values[*i].clone(),
                    )
                })
                .collect();
            return Action::Scd3 {
                row,
                changed,
                previous,
            };
        }
        Action::Scd1 { row, changed }
    }

    // -- lookup --------------------------------------------------------------

    async fn lookup(
        &self,
        rows: &[&TargetRow],
    ) -> Result<HashMap<String, Existing>, StoreError> {
        let mut found = HashMap::new();
        let key_columns = &self.flow.primary_key;
        let select_list = self
            .flow
            .columns
            .iter()
            .map(|c| c.target_column.clone())
            .collect::<Vec<_>>()
            .join(", ");
        let current_filter = if self.flow.has_scd2() {
            format!(" and {COL_CURRENT_FLAG} = 'Y'")
        } else {
            String::new()
        };

        for batch in rows.chunks(LOOKUP_BATCH) {
            let mut names: Vec<String> = Vec::new();
            let mut values: Vec<SqlValue> = Vec::new();
            let predicate = if key_columns.len() == 1 {
                let mut markers = Vec::with_capacity(batch.len());
                for (i, row) in batch.iter().enumerate() {
                    names.push(format!("k{i}"));
                    values.push(row.key[0].clone());
                    markers.push(format!(":k{i}"));
                }
                format!("{} in ({})", key_columns[0], markers.join(", "))
            } else {
                let mut groups = Vec::with_capacity(batch.len());
                for (i, row) in batch.iter().enumerate() {
                    let mut parts = Vec::with_capacity(key_columns.len());
                    for (j, column) in key_columns.iter().enumerate() {
                        names.push(format!("k{i}_{j}"));
                        values.push(row.key[j].clone());
                        parts.push(format!("{column} = :k{i}_{j}"));
                    }
                    groups.push(format!("({})", parts.join(" and ")));
                }
                groups.join(" or ")
            };

            let sql = format!(
                "select {select_list} from {} where ({predicate}){current_filter}",
                self.table
            );
            let params: Vec<(&str, SqlValue)> = names
                .iter()
                .map(String::as_str)
                .zip(values.into_iter())
                .collect();

            for db_row in self.target.query(&sql, &params).await? {
                let mut decoded = Vec::with_capacity(self.flow.columns.len());
                for (i, plan) in self.flow.columns.iter().enumerate() {
                    let raw = value_at(&db_row, i)?;
                    // Normalize through the declared kind so text/number
                    // representation differences do not read as changes.
                    let v = crate::transform::coerce(raw.clone(), plan.kind).unwrap_or(raw);
                    decoded.push(v);
                }
                let key: Vec<SqlValue> = self
                    .flow
                    .primary_key
                    .iter()
                    .map(|k| {
                        let pos = self
                            .flow
                            .columns
                            .iter()
                            .position(|c| c.target_column.eq_ignore_ascii_case(k))
                            .expect("pk columns are planned");
                        decoded[pos].clone()
                    })
                    .collect();
                let hash = row_hash(&self.flow.columns, &decoded);
                found.insert(
                    key_display(&key),
                    Existing {
                        values: decoded,
                        hash,
                    },
                );
            }
        }
        Ok(found)
    }

    // -- writes --------------------------------------------------------------

    async fn insert_row(&self, tx: &mut Tx, row: &TargetRow) -> Result<(), StoreError> {
        let mut columns: Vec<String> = self
            .flow
            .columns
            .iter()
            .map(|c| c.target_column.clone())
            .collect();
        let mut values: Vec<SqlValue> = row.values.clone();

        columns.push(COL_INSERT_BY.into());
        values.push(SqlValue::from(self.actor.as_str()));
        columns.push(COL_INSERT_DT.into());
        values.push(SqlValue::from(self.effective_ts.as_str()));

        if self.flow.has_scd2() {
            columns.push(COL_CURRENT_FLAG.into());
            values.push(SqlValue::from("Y"));
            columns.push(COL_START_DT.into());
            values.push(SqlValue::from(self.effective_ts.as_str()));
            columns.push(COL_END_DT.into());
            values.push(SqlValue::null_text());
        }

        let names: Vec<String> = (0..columns.len()).map(|i| format!("p{i}")).collect();
        let sql = format!(
            "insert into {} ({}) values ({})",
            self.table,
            columns.join(", "),
            names
                .iter()
                .map(|n| format!(":{n}"))
                .collect::<Vec<_>>()
                .join(", ")
        );
        let params: Vec<(&str, SqlValue)> = names
            .iter()
            .map(String::as_str)
            .zip(values.into_iter())
            .collect();
        tx.exec(&sql, &params).await?;
        Ok(())
    }

    async fn update_row(
        &self,
        tx: &mut Tx,
        row: &TargetRow,
        changed: &[usize],
        previous: &[(String, SqlValue)],
    ) -> Result<(), StoreError> {
        let mut sets: Vec<String> = Vec::new();
        let mut names: Vec<String> = Vec::new();
        let mut values: Vec<SqlValue> = Vec::new();

        for idx in changed {
            let n = format!("s{idx}");
            sets.push(format!("{} = :{n}", self.flow.columns[*idx].target_column));
            names.push(n);
            values.push(row.values[*idx].clone());
        }
        for (i, (column, value)) in previous.iter().enumerate() {
            let n = format!("prev{i}");
            sets.push(format!("{column} = :{n}"));
            names.push(n);
            values.push(value.clone());
        }
        sets.push(format!("{COL_UPDATE_BY} = :audit_by"));
        names.push("audit_by".into());
        values.push(SqlValue::from(self.actor.as_str()));
        sets.push(format!("{COL_UPDATE_DT} = :audit_dt"));
        names.push("audit_dt".into());
        values.push(SqlValue::from(self.effective_ts.as_str()));

        let (where_sql, where_names, where_values) = self.key_predicate(&row.key);
        names.extend(where_names);
        values.extend(where_values);

        let sql = format!(
            "update {} set {} where {}{}",
            self.table,
            sets.join(", "),
            where_sql,
            if self.flow.has_scd2() {
                format!(" and {COL_CURRENT_FLAG} = 'Y'")
            } else {
                String::new()
            }
        );
        let params: Vec<(&str, SqlValue)> = names
            .iter()
            .map(String::as_str)
            .zip(values.into_iter())
            .collect();
        tx.exec(&sql, &params).await?;
        Ok(())
    }

    /// SCD-2: close the current row's validity, then insert the
    /// replacement as the single current row.
    async fn expire_and_insert(
        &self,
        tx: &mut Tx,
        key: &[SqlValue],
        row: &TargetRow,
    ) -> Result<(), StoreError> {
        let (where_sql, where_names, where_values) = self.key_predicate(key);
        let mut names = vec!["end_dt".to_string(), "by".to_string(), "dt".to_string()];
        let mut values = vec![
            SqlValue::from(self.effective_ts.as_str()),
            SqlValue::from(self.actor.as_str()),
            SqlValue::from(self.effective_ts.as_str()),
        ];
        names.extend(where_names);
        values.extend(where_values);

        let sql = format!(
            "update {} set {COL_CURRENT_FLAG} = 'N', {COL_END_DT} = :end_dt, \
             {COL_UPDATE_BY} = :by, {COL_UPDATE_DT} = :dt \
             where {where_sql} and {COL_CURRENT_FLAG} = 'Y'",
            self.table
        );
        let params: Vec<(&str, SqlValue)> = names
            .iter()
            .map(String::as_str)
            .zip(values.into_iter())
            .collect();
        tx.exec(&sql, &params).await?;

        self.insert_row(tx, row).await
    }

    fn key_predicate(&self, key: &[SqlValue]) -> (String, Vec<String>, Vec<SqlValue>) {
        let mut parts = Vec::with_capacity(key.len());
        let mut names = Vec::with_capacity(key.len());
        let mut values = Vec::with_capacity(key.len());
        for (i, column) in self.flow.primary_key.iter().enumerate() {
            let n = format!("w{i}");
            parts.push(format!("{column} = :{n}"));
            names.push(n);
            values.push(key[i].clone());
        }
        (parts.join(" and "), names, values)
    }
}
