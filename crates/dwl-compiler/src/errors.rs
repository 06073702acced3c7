//! Structured compiler errors.
//!
//! Every rejection carries a small numeric code, the raising procedure,
//! the offending parameters, and a fully qualified human message. The
//! caller gets the error; `dwl_error_records` gets a copy.

use std::fmt;

/// Validation error codes. Stable: messages may be reworded, codes may not.
pub mod codes {
    pub const NULL_FIELD: i32 = 101;
    pub const INVALID_CHARACTER: i32 = 102;
    pub const NO_PRIMARY_KEY: i32 = 121;
    pub const DUPLICATE_TARGET_COLUMN: i32 = 122;
    pub const DUPLICATE_VALUE_COLUMN: i32 = 123;
    pub const UNKNOWN_DATA_TYPE: i32 = 124;
    pub const PRIMARY_KEY_SEQUENCE: i32 = 125;
    pub const COMBINATION_INCONSISTENT: i32 = 126;
    pub const SNIPPET_CODE_NULL: i32 = 133;
    pub const SPACE_NOT_ALLOWED: i32 = 134;
    pub const LOGIC_INVALID: i32 = 135;
    pub const FREQUENCY_INVALID: i32 = 141;
    pub const SCHEDULE_DATES_INVALID: i32 = 142;
    pub const CHECKPOINT_COLUMN_MISSING: i32 = 143;
    pub const DEPENDENCY_CYCLE: i32 = 151;
    pub const DELETE_REFUSED: i32 = 152;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    pub code: i32,
    pub procedure: String,
    pub params: Vec<String>,
    pub message: String,
}

impl ValidationError {
    pub fn new(
        code: i32,
        procedure: &str,
        params: impl IntoIterator<Item = String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            code,
            procedure: procedure.to_string(),
            params: params.into_iter().collect(),
            message: message.into(),
        }
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {} (code {})", self.procedure, self.message, self.code)
    }
}

impl std::error::Error for ValidationError {}

/// Compiler operation outcome: a rejection, or a store failure underneath.
#[derive(Debug, thiserror::Error)]
pub enum CompilerError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error(transparent)]
    Store(#[from] dwl_store::StoreError),
}
