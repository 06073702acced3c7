//! Monotonic id allocation over the shared metadata store.
//!
//! Two strategies, selected at startup and never mixed for the same entity:
//! `Sequence` delegates to a backend sequence object; `BlockCounter`
//! reserves blocks from `dwl_id_pool` with an optimistic compare-and-set
//! and serves ids from a per-process cache. The cache mutex is the only
//! process-wide mutable singleton in the workspace; it is held across the
//! allocation round-trip so blocks install in reservation order and ids
//! stay monotonic per process.

use std::collections::HashMap;

use tokio::sync::Mutex;

use dwl_config::{CoreConfig, IdMode};

use crate::error::StoreError;
use crate::sql::SqlValue;
use crate::store::{column_value, tables, Store};

/// Entity names managed by the provider. Sequence mode maps each to the
/// backend sequence `dwl_seq_<entity>`.
pub mod entity {
    pub const SNIPPET: &str = "snippet";
    pub const MAPPING: &str = "mapping";
    pub const MAPPING_DETAIL: &str = "mapping_detail";
    pub const JOB_FLOW: &str = "job_flow";
    pub const SCHEDULE: &str = "schedule";
    pub const REQUEST: &str = "request";
    pub const RUN_LOG: &str = "run_log";
    pub const ERROR_RECORD: &str = "error_record";
}

#[derive(Debug, Clone, Copy)]
struct Block {
    next: i64,
    /// Exclusive upper bound.
    end: i64,
}

pub struct IdProvider {
    store: Store,
    mode: IdMode,
    block_size: i64,
    cache: Mutex<HashMap<String, Block>>,
}

impl IdProvider {
    pub fn new(store: Store, config: &CoreConfig) -> Self {
        Self {
            store,
            mode: config.id_mode,
            block_size: config.id_block_size,
            cache: Mutex::new(HashMap::new()),
        }
    }

    pub async fn next_id(&self, entity_name: &str) -> Result<i64, StoreError> {
        Ok(self.next_ids(entity_name, 1).await?[0])
    }

    pub async fn next_ids(&self, entity_name: &str, n: usize) -> Result<Vec<i64>, StoreError> {
        match self.mode {
            IdMode::Sequence => self.next_from_sequence(entity_name, n).await,
            IdMode::BlockCounter => self.next_from_blocks(entity_name, n).await,
        }
    }

    async fn next_from_sequence(
        &self,
        entity_name: &str,
        n: usize,
    ) -> Result<Vec<i64>, StoreError> {
        let sql = self
            .store
            .dialect()
            .sequence_next_sql(&format!("dwl_seq_{entity_name}"))
            .ok_or_else(|| {
                StoreError::Template("sequence id mode on a dialect without sequences".into())
            })?;
        let mut out = Vec::with_capacity(n);
        for _ in 0..n {
            let row = self.store.query_one(&sql, &[]).await?;
            match column_value(&row, "nextval")? {
                SqlValue::Int(Some(v)) => out.push(v),
                other => {
                    return Err(StoreError::Template(format!(
                        "sequence returned non-integer value {other:?}"
                    )))
                }
            }
        }
        Ok(out)
    }

    async fn next_from_blocks(&self, entity_name: &str, n: usize) -> Result<Vec<i64>, StoreError> {
        let mut cache = self.cache.lock().await;
        let mut out = Vec::with_capacity(n);
        while out.len() < n {
            let exhausted = cache
                .get(entity_name)
                .map(|b| b.next >= b.end)
                .unwrap_or(true);
            if exhausted {
                let fresh = self.reserve_block(entity_name).await?;
                cache.insert(entity_name.to_string(), fresh);
            }
            let block = cache.get_mut(entity_name).expect("block just ensured");
            while block.next < block.end && out.len() < n {
                out.push(block.next);
                block.next += 1;
            }
        }
        Ok(out)
    }

    /// Reserve one block via optimistic concurrency. The unused tail of a
    /// block is discarded on restart; monotonicity survives, contiguity
    /// does not.
    async fn reserve_block(&self, entity_name: &str) -> Result<Block, StoreError> {
        let pool = self.store.meta_object(tables::ID_POOL);
        loop {
            let row = self
                .store
                .query_opt(
                    &format!(
                        "select current_value, block_size, version from {pool} \
                         where entity_name = :entity"
                    ),
                    &[("entity", SqlValue::from(entity_name))],
                )
                .await?;

            let Some(row) = row else {
                self.store
                    .exec(
                        &format!(
                            "insert into {pool} (entity_name, current_value, block_size, version) \
                             values (:entity, 0, :block_size, 0) \
                             on conflict (entity_name) do nothing"
                        ),
                        &[
                            ("entity", SqlValue::from(entity_name)),
                            ("block_size", SqlValue::from(self.block_size)),
                        ],
                    )
                    .await?;
                continue;
            };

            let current = int_column(&row, "current_value")?;
            let block_size = int_column(&row, "block_size")?.max(1);
            let version = int_column(&row, "version")?;

            let updated = self
                .store
                .exec(
                    &format!(
                        "update {pool} \
                         set current_value = :new_value, version = :new_version \
                         where entity_name = :entity and version = :version"
                    ),
                    &[
                        ("new_value", SqlValue::from(current + block_size)),
                        ("new_version", SqlValue::from(version + 1)),
                        ("entity", SqlValue::from(entity_name)),
                        ("version", SqlValue::from(version)),
                    ],
                )
                .await?;

            if updated == 1 {
                return Ok(Block {
                    next: current + 1,
                    end: current + block_size + 1,
                });
            }
            // Lost the race; another process moved the counter. Go again.
        }
    }
}

fn int_column(row: &sqlx::any::AnyRow, name: &str) -> Result<i64, StoreError> {
    match column_value(row, name)? {
        SqlValue::Int(Some(v)) => Ok(v),
        other => Err(StoreError::Template(format!(
            "expected integer column {name}, got {other:?}"
        ))),
    }
}
