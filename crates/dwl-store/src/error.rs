//! Error taxonomy of the store layer.
//!
//! Callers branch on transient vs permanent to decide retry; everything
//! else is terminal for the operation that raised it.

use dwl_schemas::CodeError;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Connection loss, deadlock, lock contention, pool exhaustion.
    /// Safe to retry.
    #[error("transient database error: {0}")]
    Transient(#[source] sqlx::Error),

    /// Syntax, constraint, missing object. Retrying cannot help.
    #[error("permanent database error: {0}")]
    Permanent(#[source] sqlx::Error),

    /// The caller's IP run-log row no longer belongs to it. The holder
    /// must exit without further writes.
    #[error("run-log lease lost")]
    LeaseLost,

    /// A persisted wire code did not decode.
    #[error(transparent)]
    Code(#[from] CodeError),

    /// Serialized payload (compiled flow, request payload) did not parse.
    #[error("stored payload did not deserialize: {0}")]
    Payload(#[from] serde_json::Error),

    /// Bad named-parameter template or bind-set mismatch.
    #[error("sql template error: {0}")]
    Template(String),
}

impl StoreError {
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Transient(_))
    }

    /// Unique-constraint violation (Postgres 23505, SQLite constraint
    /// message). The lease acquisition path branches on this.
    pub fn is_unique_violation(&self) -> bool {
        let (StoreError::Transient(sqlx::Error::Database(db))
        | StoreError::Permanent(sqlx::Error::Database(db))) = self
        else {
            return false;
        };
        db.code().map(|c| c == "23505").unwrap_or(false)
            || db
                .message()
                .to_ascii_lowercase()
                .contains("unique constraint")
    }
}

/// Classify a driver error. Postgres SQLSTATE class 08 (connection),
/// 40001/40P01 (serialization/deadlock) and SQLite busy/locked are the
/// retryable set; everything with a database code outside it is permanent.
pub fn classify(err: sqlx::Error) -> StoreError {
    match &err {
        sqlx::Error::Io(_)
        | sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed
        | sqlx::Error::WorkerCrashed => StoreError::Transient(err),
        sqlx::Error::Database(db) => {
            let code = db.code().map(|c| c.to_string()).unwrap_or_default();
            let msg = db.message().to_ascii_lowercase();
            let transient = code.starts_with("08")
                || code == "40001"
                || code == "40P01"
                || code == "57P03"
                || msg.contains("database is locked")
                || msg.contains("database table is locked");
            if transient {
                StoreError::Transient(err)
            } else {
                StoreError::Permanent(err)
            }
        }
        _ => StoreError::Permanent(err),
    }
}
