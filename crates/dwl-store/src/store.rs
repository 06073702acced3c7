//! The metadata-store adapter.
//!
//! One `Store` wraps one connection pool (metadata database or a target
//! database: the same adapter serves both), the dialect, and the optional
//! schema prefixes. All SQL in the workspace goes through here.

use std::sync::Once;

use sqlx::any::{AnyPoolOptions, AnyRow};
use sqlx::{AnyPool, Column, Executor, Row, Statement};

use dwl_config::CoreConfig;

use crate::dialect::{qualified, Dialect};
use crate::error::{classify, StoreError};
use crate::sql::{bind_values, render_named, SqlValue};

static INSTALL_DRIVERS: Once = Once::new();

const DDL_POSTGRES: &str = include_str!("ddl_postgres.sql");
const DDL_SQLITE: &str = include_str!("ddl_sqlite.sql");

/// Metadata table names, unqualified.
pub mod tables {
    pub const SNIPPETS: &str = "dwl_sql_snippets";
    pub const MAPPINGS: &str = "dwl_mappings";
    pub const MAPPING_DETAILS: &str = "dwl_mapping_details";
    pub const JOB_FLOWS: &str = "dwl_job_flows";
    pub const SCHEDULES: &str = "dwl_schedules";
    pub const REQUESTS: &str = "dwl_requests";
    pub const RUN_LOGS: &str = "dwl_run_logs";
    pub const ID_POOL: &str = "dwl_id_pool";
    pub const ERROR_RECORDS: &str = "dwl_error_records";
}

/// The two schema namespaces the adapter can prefix objects with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchemaKind {
    Metadata,
    Data,
}

#[derive(Clone)]
pub struct Store {
    pool: AnyPool,
    dialect: Dialect,
    metadata_schema: Option<String>,
    data_schema: Option<String>,
}

impl Store {
    /// Connect a pool against `url`. The Any drivers are installed once per
    /// process.
    pub async fn connect(
        url: &str,
        dialect: Dialect,
        metadata_schema: Option<String>,
        data_schema: Option<String>,
        max_connections: u32,
    ) -> Result<Self, StoreError> {
        INSTALL_DRIVERS.call_once(sqlx::any::install_default_drivers);

        let pool = AnyPoolOptions::new()
            .max_connections(max_connections)
            .connect(url)
            .await
            .map_err(classify)?;

        Ok(Self {
            pool,
            dialect,
            metadata_schema,
            data_schema,
        })
    }

    /// Metadata store per the deployment configuration.
    pub async fn from_config(config: &CoreConfig) -> Result<Self, StoreError> {
        Self::connect(
            &config.database_url,
            Dialect::from(config.db_type),
            config.metadata_schema.clone(),
            config.data_schema.clone(),
            10,
        )
        .await
    }

    /// Target-database store for one run: sized `max_workers + 2`, same
    /// dialect and data-schema prefix as the deployment.
    pub async fn connect_target(
        config: &CoreConfig,
        connection_id: Option<i64>,
        max_workers: usize,
    ) -> Result<Self, StoreError> {
        let url = config
            .target_url_for(connection_id)
            .map_err(|e| StoreError::Template(e.to_string()))?;
        Self::connect(
            url,
            Dialect::from(config.db_type),
            config.metadata_schema.clone(),
            config.data_schema.clone(),
            (max_workers + 2) as u32,
        )
        .await
    }

    pub fn dialect(&self) -> Dialect {
        self.dialect
    }

    pub fn pool(&self) -> &AnyPool {
        &self.pool
    }

    pub fn schema_prefix(&self, kind: SchemaKind) -> Option<&str> {
        match kind {
            SchemaKind::Metadata => self.metadata_schema.as_deref(),
            SchemaKind::Data => self.data_schema.as_deref(),
        }
    }

    /// Qualified metadata object name.
    pub fn meta_object(&self, name: &str) -> String {
        qualified(self.schema_prefix(SchemaKind::Metadata), name)
    }

    /// Qualified target object name; a mapping's own non-empty
    /// `target_schema` overrides the deployment's data schema.
    pub fn data_object(&self, target_schema: &str, name: &str) -> String {
        if target_schema.is_empty() {
            qualified(self.schema_prefix(SchemaKind::Data), name)
        } else {
            qualified(Some(target_schema), name)
        }
    }

    // -- statement surface ---------------------------------------------------

    pub async fn exec(&self, sql: &str, params: &[(&str, SqlValue)]) -> Result<u64, StoreError> {
        let (rendered, values) = render_named(sql, self.dialect, params)?;
        let result = bind_values(sqlx::query(&rendered), values)
            .execute(&self.pool)
            .await
            .map_err(classify)?;
        Ok(result.rows_affected())
    }

    pub async fn query(
        &self,
        sql: &str,
        params: &[(&str, SqlValue)],
    ) -> Result<Vec<AnyRow>, StoreError> {
        let (rendered, values) = render_named(sql, self.dialect, params)?;
        bind_values(sqlx::query(&rendered), values)
            .fetch_all(&self.pool)
            .await
            .map_err(classify)
    }

    pub async fn query_opt(
        &self,
        sql: &str,
        params: &[(&str, SqlValue)],
    ) -> Result<Option<AnyRow>, StoreError> {
        let (rendered, values) = render_named(sql, self.dialect, params)?;
        bind_values(sqlx::query(&rendered), values)
            .fetch_optional(&self.pool)
            .await
            .map_err(classify)
    }

    pub async fn query_one(
        &self,
        sql: &str,
        params: &[(&str, SqlValue)],
    ) -> Result<AnyRow, StoreError> {
        let (rendered, values) = render_named(sql, self.dialect, params)?;
        bind_values(sqlx::query(&rendered), values)
            .fetch_one(&self.pool)
            .await
            .map_err(classify)
    }

    /// Execute an INSERT carrying a `returning` clause and hand back the
    /// requested key values in order.
    pub async fn insert_returning(
        &self,
        sql: &str,
        params: &[(&str, SqlValue)],
        return_keys: &[&str],
    ) -> Result<Vec<SqlValue>, StoreError> {
        let row = self.query_one(sql, params).await?;
        return_keys.iter().map(|k| column_value(&row, k)).collect()
    }

    /// Prepare (never execute) a statement and report its projection column
    /// names. This is what SQL/logic validation runs on.
    pub async fn prepare_columns(&self, sql: &str) -> Result<Vec<String>, StoreError> {
        let mut conn = self.pool.acquire().await.map_err(classify)?;
        let stmt = (&mut *conn).prepare(sql).await.map_err(classify)?;
        Ok(stmt
            .columns()
            .iter()
            .map(|c| c.name().to_string())
            .collect())
    }

    pub async fn begin(&self) -> Result<Tx, StoreError> {
        let inner = self.pool.begin().await.map_err(classify)?;
        Ok(Tx {
            inner,
            dialect: self.dialect,
        })
    }

    /// Idempotent DDL bootstrap for the metadata tables (and, on Postgres,
    /// the managed sequences). Replaces a migrator: the Any driver cannot
    /// run one.
    pub async fn ensure_schema(&self) -> Result<(), StoreError> {
        let script = match self.dialect {
            Dialect::Postgres => DDL_POSTGRES,
            Dialect::Sqlite => DDL_SQLITE,
        };
        for statement in script.split(';') {
            let statement = statement.trim();
            if statement.is_empty() {
                continue;
            }
            // Metadata-schema prefixing: the scripts name bare objects and a
            // search-path/attach setup is a deployment concern, so prefixed
            // deployments pre-create objects; the bare form covers the
            // single-schema case the workspace itself manages.
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .map_err(classify)?;
        }
        Ok(())
    }
}

/// One transaction on the adapter's pool. Commit or roll back explicitly;
/// dropping without commit rolls back.
pub struct Tx {
    inner: sqlx::Transaction<'static, sqlx::Any>,
    dialect: Dialect,
}

impl Tx {
    pub async fn exec(&mut self, sql: &str, params: &[(&str, SqlValue)]) -> Result<u64, StoreError> {
        let (rendered, values) = render_named(sql, self.dialect, params)?;
        let result = bind_values(sqlx::query(&rendered), values)
            .execute(&mut *self.inner)
            .await
            .map_err(classify)?;
        Ok(result.rows_affected())
    }

    pub async fn query_opt(
        &mut self,
        sql: &str,
        params: &[(&str, SqlValue)],
    ) -> Result<Option<AnyRow>, StoreError> {
        let (rendered, values) = render_named(sql, self.dialect, params)?;
        bind_values(sqlx::query(&rendered), values)
            .fetch_optional(&mut *self.inner)
            .await
            .map_err(classify)
    }

    pub async fn commit(self) -> Result<(), StoreError> {
        self.inner.commit().await.map_err(classify)
    }

    pub async fn rollback(self) -> Result<(), StoreError> {
        self.inner.rollback().await.map_err(classify)
    }
}

/// Look a column up by name and decode it dynamically.
pub fn column_value(row: &AnyRow, name: &str) -> Result<SqlValue, StoreError> {
    let idx = row
        .columns()
        .iter()
        .position(|c| c.name().eq_ignore_ascii_case(name))
        .ok_or_else(|| StoreError::Template(format!("no column {name:?} in result")))?;
    crate::sql::value_at(row, idx)
}
