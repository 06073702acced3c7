//! Wire-code enums. Each code round-trips through its stored spelling;
//! decoding an unknown spelling is a [`CodeError`](crate::CodeError), never
//! a panic.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::CodeError;

macro_rules! code_enum {
    ($(#[$meta:meta])* $name:ident, $what:literal, { $($variant:ident => $code:literal),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        pub enum $name {
            $($variant),+
        }

        impl $name {
            pub fn as_code(&self) -> &'static str {
                match self {
                    $(Self::$variant => $code),+
                }
            }
        }

        impl FromStr for $name {
            type Err = CodeError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($code => Ok(Self::$variant),)+
                    other => Err(CodeError { what: $what, got: other.to_string() }),
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_code())
            }
        }
    };
}

code_enum!(
    /// Target table families.
    TableType, "table type", {
        Normalized => "NRM",
        Dimension => "DIM",
        Fact => "FCT",
        Mart => "MRT",
    }
);

code_enum!(
    /// Run frequency of a mapping / schedule.
    FrequencyCode, "frequency", {
        None => "NA",
        Interval => "ID",
        Daily => "DL",
        Weekly => "WK",
        Fortnightly => "FN",
        Monthly => "MN",
        HalfYearly => "HY",
        Yearly => "YR",
    }
);

code_enum!(
    /// Active / inactive flag on mappings and schedules.
    StatusFlag, "status flag", {
        Active => "A",
        Inactive => "N",
    }
);

code_enum!(
    /// Checkpoint resume strategy. `Key` remembers the high-water mark of a
    /// monotonic column; `RowSkip` discards already-processed rows on the
    /// resume cursor; `Auto` picks `Key` when a usable column exists.
    CheckpointStrategy, "checkpoint strategy", {
        Auto => "AUTO",
        Key => "KEY",
        RowSkip => "SKIP",
        None => "NONE",
    }
);

code_enum!(
    /// Work-queue item kind.
    RequestType, "request type", {
        Run => "RUN",
        Stop => "STOP",
    }
);

code_enum!(
    /// Work-queue item state. Terminal at Done / Failed.
    RequestStatus, "request status", {
        New => "NEW",
        Claimed => "CLAIMED",
        Done => "DONE",
        Failed => "FAILED",
    }
);

code_enum!(
    /// Run-log state. The IP row is the per-mapping lease.
    RunStatus, "run status", {
        InProgress => "IP",
        Complete => "PC",
        Failed => "FL",
    }
);

code_enum!(
    /// Load mode carried in a RUN request payload.
    LoadType, "load type", {
        Regular => "regular",
        History => "history",
    }
);

/// Slowly-changing-dimension discipline of one target column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ScdType {
    Type1,
    Type2,
    Type3,
}

impl ScdType {
    pub fn as_number(&self) -> i32 {
        match self {
            ScdType::Type1 => 1,
            ScdType::Type2 => 2,
            ScdType::Type3 => 3,
        }
    }

    pub fn from_number(n: i32) -> Result<Self, CodeError> {
        match n {
            1 => Ok(ScdType::Type1),
            2 => Ok(ScdType::Type2),
            3 => Ok(ScdType::Type3),
            other => Err(CodeError {
                what: "scd type",
                got: other.to_string(),
            }),
        }
    }
}
