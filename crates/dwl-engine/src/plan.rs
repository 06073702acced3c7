//! Row-count estimation and chunk planning.
//!
//! Strategy order: KEY ranges over an integer checkpoint column when one is
//! declared, OFFSET/LIMIT with a deterministic primary-key ordering
//! otherwise. Neither supported dialect exposes an opaque row-identifier
//! range, so that middle strategy falls through. A failed estimate or a
//! small result set yields one sequential full chunk.

use tracing::{debug, warn};

use dwl_schemas::{CompiledFlow, ValueKind};
use dwl_store::{column_value, SqlValue, Store, StoreError};

use crate::checkpoint::{column_kind, SourceQuery};

#[derive(Debug, Clone, PartialEq)]
pub enum ChunkSpec {
    /// Whole (possibly filtered) result set, one worker.
    Full,
    /// Half-open key window; `hi = None` on the last chunk.
    KeyRange { lo: i64, hi: Option<i64> },
    /// Deterministic page over an ORDER BY on the primary key.
    OffsetLimit { offset: i64, limit: i64 },
}

#[derive(Debug, Clone)]
pub struct Chunk {
    pub index: usize,
    pub spec: ChunkSpec,
}

#[derive(Debug, Clone)]
pub struct Plan {
    pub parallel: bool,
    /// Chunk windows partition the PK space (KEY ranges over the PK
    /// column): at most one worker writes any PK, and SCD-2 expiry may run
    /// inside the chunk worker.
    pub key_aligned: bool,
    pub chunks: Vec<Chunk>,
    pub estimated_rows: Option<i64>,
}

impl Plan {
    fn sequential(estimated_rows: Option<i64>) -> Self {
        Plan {
            parallel: false,
            key_aligned: true,
            chunks: vec![Chunk {
                index: 0,
                spec: ChunkSpec::Full,
            }],
            estimated_rows,
        }
    }
}

/// Cheap COUNT(*) wrapper around the filtered source. Failure to estimate
/// is not an error; it selects sequential mode.
pub async fn estimate_rows(store: &Store, query: &SourceQuery) -> Option<i64> {
    let params = query.params();
    match store.query_one(&query.count_sql(), &params).await {
        Ok(row) => match column_value(&row, "n") {
            Ok(SqlValue::Int(Some(n))) => Some(n),
            _ => None,
        },
        Err(e) => {
            warn!(error = %e, "row-count estimate failed; falling back to sequential");
            None
        }
    }
}

pub struct PlanLimits {
    pub chunk_size: i64,
    pub min_rows_for_parallel: i64,
    pub max_workers: usize,
}

pub async fn plan_chunks(
    store: &Store,
    flow: &CompiledFlow,
    query: &SourceQuery,
    limits: &PlanLimits,
) -> Result<Plan, StoreError> {
    let estimate = estimate_rows(store, query).await;

    let Some(rows) = estimate else {
        return Ok(Plan::sequential(None));
    };
    if rows < limits.min_rows_for_parallel {
        debug!(rows, "below parallel threshold; sequential");
        return Ok(Plan::sequential(Some(rows)));
    }

    let chunk_size = limits.chunk_size.max(1);
    let wanted = ((rows + chunk_size - 1) / chunk_size).max(1);

    // (i) KEY ranges over an integer checkpoint column.
    if let Some(column) = flow.checkpoint.column.as_deref() {
        if column_kind(flow, column) == Some(ValueKind::Int) {
            if let Some((lo, hi)) = key_bounds(store, query, column).await? {
                let key_aligned = flow.primary_key.len() == 1
                    && flow.primary_key[0].eq_ignore_ascii_case(column);
                let chunks = key_ranges(lo, hi, wanted);
                debug!(rows, chunks = chunks.len(), key_aligned, "key-range plan");
                return Ok(Plan {
                    parallel: true,
                    key_aligned,
                    chunks,
                    estimated_rows: Some(rows),
                });
            }
        }
    }

    // (iii) OFFSET/LIMIT pages, ordered by the primary key.
    let chunks = (0..wanted)
        .map(|i| Chunk {
            index: i as usize,
            spec: ChunkSpec::OffsetLimit {
                offset: i * chunk_size,
                limit: chunk_size,
            },
        })
        .collect();
    debug!(rows, wanted, "offset/limit plan");
    Ok(Plan {
        parallel: true,
        key_aligned: false,
        chunks,
        estimated_rows: Some(rows),
    })
}

async fn key_bounds(
    store: &Store,
    query: &SourceQuery,
    column: &str,
) -> Result<Option<(i64, i64)>, StoreError> {
    let params = query.params();
    let row = store.query_one(&query.min_max_sql(column), &params).await?;
    let lo = column_value(&row, "lo")?;
    let hi = column_value(&row, "hi")?;
    match (lo, hi) {
        (SqlValue::Int(Some(lo)), SqlValue::Int(Some(hi))) if lo <= hi => Ok(Some((lo, hi))),
        _ => Ok(None),
    }
}

/// Split `[lo, hi]` into up to `wanted` half-open windows; the last window
/// is unbounded above so late-arriving keys still land in a chunk.
fn key_ranges(lo: i64, hi: i64, wanted: i64) -> Vec<Chunk> {
    let span = (hi - lo + 1).max(1);
    let count = wanted.min(span).max(1);
    let width = (span + count - 1) / count;
    (0..count)
        .map(|i| {
            let from = lo + i * width;
            let to = if i == count - 1 {
                None
            } else {
                Some(lo + (i + 1) * width)
            };
            Chunk {
                index: i as usize,
                spec: ChunkSpec::KeyRange { lo: from, hi: to },
            }
        })
        .collect()
}

/// Render a chunk window as SQL conditions over the wrapped source.
pub fn chunk_conditions(spec: &ChunkSpec, checkpoint_column: Option<&str>) -> Vec<String> {
    match spec {
        ChunkSpec::Full | ChunkSpec::OffsetLimit { .. } => Vec::new(),
        ChunkSpec::KeyRange { lo, hi } => {
            let column = checkpoint_column.expect("key ranges require the checkpoint column");
            let mut conditions = vec![format!("src.{column} >= {lo}")];
            if let Some(hi) = hi {
                conditions.push(format!("src.{column} < {hi}"));
            }
            conditions
        }
    }
}
