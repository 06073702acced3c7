//! Shared domain types for the dwl workspace.
//!
//! Everything here is plain data: code enums with stable wire spellings,
//! the persisted entity rows, and the compiled flow shape the execution
//! engine consumes. No I/O, no SQL.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub mod codes;
pub mod flow;

pub use codes::{
    CheckpointStrategy, FrequencyCode, LoadType, RequestStatus, RequestType, RunStatus, ScdType,
    StatusFlag, TableType,
};
pub use flow::{ColumnPlan, CompiledFlow, ValueKind};

/// Bad or unknown wire code encountered while decoding persisted state.
#[derive(Debug, thiserror::Error)]
#[error("unknown {what} code: {got:?}")]
pub struct CodeError {
    pub what: &'static str,
    pub got: String,
}

/// Weekly `frequency_day` spelling ("MON".."SUN", case-insensitive).
pub fn parse_weekday(s: &str) -> Option<chrono::Weekday> {
    use chrono::Weekday::*;
    match s.to_ascii_uppercase().as_str() {
        "MON" => Some(Mon),
        "TUE" => Some(Tue),
        "WED" => Some(Wed),
        "THU" => Some(Thu),
        "FRI" => Some(Fri),
        "SAT" => Some(Sat),
        "SUN" => Some(Sun),
        _ => None,
    }
}

// ---------------------------------------------------------------------------
// SqlSnippet
// ---------------------------------------------------------------------------

/// A named, reusable source SQL body. Historized: the current row per `code`
/// carries `current_flag = true`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SqlSnippet {
    pub id: i64,
    pub code: String,
    pub body: String,
    pub current_flag: bool,
    pub created_by: String,
    pub created_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Mapping
// ---------------------------------------------------------------------------

/// Checkpoint configuration carried by a mapping.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointSpec {
    pub strategy: CheckpointStrategy,
    /// Target column the checkpoint predicate applies to (KEY / AUTO).
    pub column: Option<String>,
    pub enabled: bool,
}

impl CheckpointSpec {
    pub fn disabled() -> Self {
        Self {
            strategy: CheckpointStrategy::None,
            column: None,
            enabled: false,
        }
    }
}

/// Logic-verification mark: flag and date travel together or not at all.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogicVerified {
    pub verified_at: NaiveDate,
}

/// Operator-supplied mapping contract, before persistence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MappingDraft {
    pub reference: String,
    pub description: Option<String>,
    pub target_schema: String,
    pub target_table_type: TableType,
    pub target_table_name: String,
    pub frequency_code: FrequencyCode,
    pub source_system: Option<String>,
    pub logic_verified: Option<LogicVerified>,
    pub status_flag: StatusFlag,
    pub block_process_rows: i64,
    pub target_connection_id: Option<i64>,
    pub checkpoint: CheckpointSpec,
}

/// Persisted mapping row (current or historized).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Mapping {
    pub id: i64,
    pub draft: MappingDraft,
    pub current_flag: bool,
    pub created_by: String,
    pub created_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// MappingDetail
// ---------------------------------------------------------------------------

/// Source logic of a detail: inline SQL or a reference to a stored snippet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum MapLogic {
    Sql(String),
    Snippet(String),
}

impl MapLogic {
    /// Stored single-column form: snippet references carry a `snippet:` tag.
    pub fn as_stored(&self) -> String {
        match self {
            MapLogic::Sql(s) => s.clone(),
            MapLogic::Snippet(code) => format!("snippet:{code}"),
        }
    }

    pub fn from_stored(s: &str) -> Self {
        match s.strip_prefix("snippet:") {
            Some(code) => MapLogic::Snippet(code.to_string()),
            None => MapLogic::Sql(s.to_string()),
        }
    }
}

/// One target column of a mapping, as supplied by the operator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MappingDetailDraft {
    pub mapping_reference: String,
    pub target_column: String,
    pub target_data_type: String,
    /// `Some(seq)` marks this column as part of the primary key; sequences
    /// must be dense and unique within a mapping.
    pub primary_key_sequence: Option<i32>,
    pub description: Option<String>,
    pub map_logic: MapLogic,
    pub key_columns: Vec<String>,
    pub value_column: String,
    pub combination_code: i32,
    pub execution_sequence: i32,
    pub scd_type: ScdType,
    pub logic_verified: Option<LogicVerified>,
    pub default_value: Option<String>,
    pub is_required: bool,
    pub derivation_formula: Option<String>,
}

impl MappingDetailDraft {
    pub fn is_primary_key(&self) -> bool {
        self.primary_key_sequence.is_some()
    }
}

/// Persisted detail row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MappingDetail {
    pub id: i64,
    pub draft: MappingDetailDraft,
    pub current_flag: bool,
    pub created_by: String,
    pub created_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// JobFlow
// ---------------------------------------------------------------------------

/// Compiled, executable plan row for one mapping. `dw_logic` is the
/// serde-serialized [`CompiledFlow`]; exactly one row per mapping is current.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobFlow {
    pub id: i64,
    pub mapping_reference: String,
    pub dw_logic: String,
    pub block_process_rows: i64,
    pub target_connection_id: Option<i64>,
    pub dependency_id: Option<i64>,
    pub current_flag: bool,
    pub created_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Schedule
// ---------------------------------------------------------------------------

/// When a job flow runs. `frequency_day` doubles as the weekday name for
/// weekly schedules ("MON".."SUN"), the day-of-month for monthly ones
/// ("1".."31", clamped to the last day), and the interval in minutes for
/// `ID` schedules.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Schedule {
    pub id: i64,
    pub job_flow_id: i64,
    pub mapping_reference: String,
    pub frequency_code: FrequencyCode,
    pub frequency_day: Option<String>,
    pub hour_of_day: u32,
    pub minute_of_hour: u32,
    pub start_date: NaiveDate,
    pub end_date: Option<NaiveDate>,
    pub status_flag: StatusFlag,
    pub last_run_at: Option<DateTime<Utc>>,
    pub next_run_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduleDraft {
    pub mapping_reference: String,
    pub frequency_code: FrequencyCode,
    pub frequency_day: Option<String>,
    pub hour_of_day: u32,
    pub minute_of_hour: u32,
    pub start_date: NaiveDate,
    pub end_date: Option<NaiveDate>,
    pub status_flag: StatusFlag,
}

// ---------------------------------------------------------------------------
// Request
// ---------------------------------------------------------------------------

/// History-load window: date-range filter over the checkpoint column,
/// optionally preceded by a TRUNCATE of the target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryWindow {
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
    pub truncate: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunPayload {
    pub load_type: LoadType,
    pub history: Option<HistoryWindow>,
}

impl RunPayload {
    pub fn regular() -> Self {
        Self {
            load_type: LoadType::Regular,
            history: None,
        }
    }

    pub fn history(window: HistoryWindow) -> Self {
        Self {
            load_type: LoadType::History,
            history: Some(window),
        }
    }
}

/// Work item in the durable request queue. Append-only; terminal at
/// DONE / FAILED.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    pub id: i64,
    pub mapping_reference: String,
    pub request_type: RequestType,
    pub payload: RunPayload,
    pub status: RequestStatus,
    pub message: Option<String>,
    pub requested_at: DateTime<Utc>,
    pub claimed_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub claimant_id: Option<String>,
}

// ---------------------------------------------------------------------------
// RunLog
// ---------------------------------------------------------------------------

/// One row per execution attempt. The `status = IP` row doubles as the
/// per-mapping lease; all writers compare-and-set on `(id, IP, session_id)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunLog {
    pub id: i64,
    pub mapping_reference: String,
    pub session_id: Uuid,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub heartbeat_at: Option<DateTime<Utc>>,
    pub rows_read: i64,
    pub rows_written: i64,
    pub rows_failed: i64,
    pub message: Option<String>,
    pub checkpoint_value: Option<String>,
}

// ---------------------------------------------------------------------------
// ErrorRecord
// ---------------------------------------------------------------------------

/// Structured validation error persisted by the compiler. Informational.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorRecord {
    pub id: i64,
    pub mapping_reference: Option<String>,
    pub code: i32,
    pub procedure_name: String,
    pub params: Vec<String>,
    pub message: String,
    pub created_at: DateTime<Utc>,
}
