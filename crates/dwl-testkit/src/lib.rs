//! Test harness: a tempfile-backed SQLite metadata/target store with the
//! schema applied, plus draft builders for mappings, details and
//! schedules. File-backed (not `:memory:`) so every pooled connection
//! sees the same database.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::NaiveDate;
use tempfile::TempDir;

use dwl_config::{CoreConfig, DbType, IdMode};
use dwl_schemas::codes::{
    CheckpointStrategy, FrequencyCode, ScdType, StatusFlag, TableType,
};
use dwl_schemas::{
    CheckpointSpec, MapLogic, MappingDetailDraft, MappingDraft, ScheduleDraft,
};
use dwl_store::{Dialect, IdProvider, SqlValue, Store};

pub const TEST_ACTOR: &str = "testkit";

/// One isolated SQLite-backed deployment. Keep the harness alive for the
/// duration of the test; the temp directory dies with it.
pub struct TestHarness {
    pub config: CoreConfig,
    pub store: Store,
    pub ids: Arc<IdProvider>,
    _dir: TempDir,
}

pub async fn sqlite_harness() -> Result<TestHarness> {
    let dir = TempDir::new().context("create temp dir")?;
    let db_path = dir.path().join("dwl.db");
    let url = format!("sqlite://{}?mode=rwc", db_path.display());

    let config = CoreConfig {
        db_type: DbType::Sqlite,
        database_url: url.clone(),
        target_url: Some(url),
        target_urls: HashMap::new(),
        metadata_schema: None,
        data_schema: None,
        id_mode: IdMode::BlockCounter,
        id_block_size: 50,
        sync_period: Duration::from_secs(60),
        poll_period: Duration::from_secs(15),
        max_workers: 4,
        min_rows_for_parallel: 100,
        chunk_size: 50,
        block_process_rows: 0,
        retry_max: 2,
        retry_base_ms: 5,
        retry_cap_ms: 50,
        run_timeout: None,
        stop_stuck_after: Duration::from_secs(7200),
        tz: chrono_tz::UTC,
    };

    let store = Store::from_config(&config).await.context("connect store")?;
    store.ensure_schema().await.context("apply schema")?;
    let ids = Arc::new(IdProvider::new(store.clone(), &config));

    Ok(TestHarness {
        config,
        store,
        ids,
        _dir: dir,
    })
}

impl TestHarness {
    pub fn dialect(&self) -> Dialect {
        self.store.dialect()
    }

    /// Create a source table and fill it with `(id, name)` rows.
    pub async fn seed_source(&self, table: &str, rows: &[(i64, &str)]) -> Result<()> {
        self.store
            .exec(
                &format!(
                    "create table if not exists {table} (id integer primary key, name text)"
                ),
                &[],
            )
            .await?;
        for (id, name) in rows {
            self.store
                .exec(
                    &format!("insert into {table} (id, name) values (:id, :name)"),
                    &[("id", SqlValue::from(*id)), ("name", SqlValue::from(*name))],
                )
                .await?;
        }
        Ok(())
    }

    /// Create a target table carrying the audit and SCD-2 columns the
    /// engine fills.
    pub async fn create_target(&self, table: &str, columns: &[(&str, &str)]) -> Result<()> {
        let mut defs: Vec<String> = columns
            .iter()
            .map(|(name, ty)| format!("{name} {ty}"))
            .collect();
        for audit in [
            "insrtby text",
            "insrtdt text",
            "updtby text",
            "updtdt text",
            "curr_flag text",
            "start_dt text",
            "end_dt text",
        ] {
            defs.push(audit.to_string());
        }
        self.store
            .exec(
                &format!("create table if not exists {table} ({})", defs.join(", ")),
                &[],
            )
            .await?;
        Ok(())
    }

    pub async fn count(&self, sql: &str) -> Result<i64> {
        let row = self.store.query_one(sql, &[]).await?;
        match dwl_store::column_value(&row, "n")? {
            SqlValue::Int(Some(n)) => Ok(n),
            other => anyhow::bail!("expected integer count, got {other:?}"),
        }
    }
}

// ---------------------------------------------------------------------------
// Draft builders
// ---------------------------------------------------------------------------

pub fn mapping_draft(reference: &str, target_table: &str) -> MappingDraft {
    MappingDraft {
        reference: reference.to_string(),
        description: None,
        target_schema: String::new(),
        target_table_type: TableType::Dimension,
        target_table_name: target_table.to_string(),
        frequency_code: FrequencyCode::Daily,
        source_system: Some("test".into()),
        logic_verified: None,
        status_flag: StatusFlag::Inactive,
        block_process_rows: 0,
        target_connection_id: None,
        checkpoint: CheckpointSpec::disabled(),
    }
}

pub fn key_checkpoint(column: &str) -> CheckpointSpec {
    CheckpointSpec {
        strategy: CheckpointStrategy::Key,
        column: Some(column.to_string()),
        enabled: true,
    }
}

pub fn detail_draft(
    reference: &str,
    target_column: &str,
    value_column: &str,
    source_sql: &str,
    pk: Option<i32>,
    seq: i32,
) -> MappingDetailDraft {
    MappingDetailDraft {
        mapping_reference: reference.to_string(),
        target_column: target_column.to_string(),
        target_data_type: if pk.is_some() { "integer" } else { "text" }.to_string(),
        primary_key_sequence: pk,
        description: None,
        map_logic: MapLogic::Sql(source_sql.to_string()),
        key_columns: vec!["id".into()],
        value_column: value_column.to_string(),
        combination_code: 1,
        execution_sequence: seq,
        scd_type: ScdType::Type1,
        logic_verified: None,
        default_value: None,
        is_required: false,
        derivation_formula: None,
    }
}

pub fn schedule_draft(reference: &str, frequency: FrequencyCode) -> ScheduleDraft {
    ScheduleDraft {
        mapping_reference: reference.to_string(),
        frequency_code: frequency,
        frequency_day: None,
        hour_of_day: 9,
        minute_of_hour: 30,
        start_date: NaiveDate::from_ymd_opt(2020, 1, 1).expect("valid date"),
        end_date: None,
        status_flag: StatusFlag::Active,
    }
}
