// crates/dwl-store/src/lib.rs
//
// The metadata-store adapter and everything persisted through it: the
// dialect pair, the named-parameter surface, the id provider, the request
// queue, the run-log lease, and the historized entity repositories.

pub mod details;
pub mod dialect;
pub mod error;
pub mod error_records;
pub mod ids;
pub mod job_flows;
pub mod mappings;
pub mod requests;
pub mod rows;
pub mod run_logs;
pub mod schedules;
pub mod snippets;
pub mod sql;
pub mod store;

pub use dialect::Dialect;
pub use error::StoreError;
pub use ids::IdProvider;
pub use sql::{fmt_date, fmt_ts, parse_date, parse_ts, SqlValue};
pub use store::{column_value, tables, SchemaKind, Store, Tx};
