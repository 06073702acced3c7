// crates/dwl-config/src/lib.rs
//
// CoreConfig is built once at startup from the environment and passed by
// reference (or clone) into the store, compiler, scheduler and engine
// constructors. There is no module-level mutable configuration anywhere in
// the workspace.

use std::collections::HashMap;
use std::env;
use std::str::FromStr;
use std::time::Duration;

use chrono_tz::Tz;

/// Fatal at startup. The daemon maps this to a non-zero exit code.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("missing required config key {0}")]
    Missing(&'static str),
    #[error("config key {key}: invalid value {value:?}: {reason}")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },
}

/// Metadata-store dialect selector (`DB_TYPE`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DbType {
    Postgres,
    Sqlite,
}

/// Id allocation strategy (`ID_GENERATION_MODE`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdMode {
    Sequence,
    BlockCounter,
}

#[derive(Debug, Clone)]
pub struct CoreConfig {
    pub db_type: DbType,
    pub database_url: String,
    /// Default target connection; per-mapping pins override via
    /// `target_urls`.
    pub target_url: Option<String>,
    /// `DWL_TARGET_URL_<id>` pinned connections, keyed by connection id.
    pub target_urls: HashMap<i64, String>,
    pub metadata_schema: Option<String>,
    pub data_schema: Option<String>,
    pub id_mode: IdMode,
    pub id_block_size: i64,
    pub sync_period: Duration,
    pub poll_period: Duration,
    pub max_workers: usize,
    pub min_rows_for_parallel: i64,
    pub chunk_size: i64,
    pub block_process_rows: i64,
    pub retry_max: u32,
    pub retry_base_ms: u64,
    pub retry_cap_ms: u64,
    /// Zero means no global run timeout.
    pub run_timeout: Option<Duration>,
    pub stop_stuck_after: Duration,
    /// Schedule time-of-day interpretation.
    pub tz: Tz,
}

impl CoreConfig {
    /// Build from process environment. Every key has the spelling of the
    /// deployment contract; unset optional keys fall back to defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        let db_type = match required("DB_TYPE")?.to_ascii_lowercase().as_str() {
            "postgres" => DbType::Postgres,
            "sqlite" => DbType::Sqlite,
            other => {
                return Err(ConfigError::Invalid {
                    key: "DB_TYPE",
                    value: other.to_string(),
                    reason: "expected postgres or sqlite".into(),
                })
            }
        };

        let id_mode = match optional("ID_GENERATION_MODE")
            .unwrap_or_else(|| "block-counter".into())
            .to_ascii_lowercase()
            .as_str()
        {
            "sequence" => IdMode::Sequence,
            "block-counter" => IdMode::BlockCounter,
            other => {
                return Err(ConfigError::Invalid {
                    key: "ID_GENERATION_MODE",
                    value: other.to_string(),
                    reason: "expected sequence or block-counter".into(),
                })
            }
        };

        // Sequences only exist on the Postgres dialect.
        if id_mode == IdMode::Sequence && db_type == DbType::Sqlite {
            return Err(ConfigError::Invalid {
                key: "ID_GENERATION_MODE",
                value: "sequence".into(),
                reason: "sqlite has no sequences; use block-counter".into(),
            });
        }

        let tz_name = optional("TZ").unwrap_or_else(|| "UTC".into());
        let tz = Tz::from_str(&tz_name).map_err(|_| ConfigError::Invalid {
            key: "TZ",
            value: tz_name.clone(),
            reason: "unknown IANA time zone".into(),
        })?;

        let run_timeout_sec: u64 = parsed("RUN_TIMEOUT_SEC", 0)?;

        Ok(Self {
            db_type,
            database_url: required("DWL_DATABASE_URL")?,
            target_url: optional("DWL_TARGET_URL"),
            target_urls: target_urls_from_env(),
            metadata_schema: optional("METADATA_SCHEMA"),
            data_schema: optional("DATA_SCHEMA"),
            id_mode,
            id_block_size: parsed_min("ID_BLOCK_SIZE", 50, 1)?,
            sync_period: Duration::from_secs(parsed_min("SCHEDULER_SYNC_PERIOD_SEC", 60, 1)? as u64),
            poll_period: Duration::from_secs(parsed_min("SCHEDULER_POLL_PERIOD_SEC", 15, 1)? as u64),
            max_workers: parsed_min("MAX_WORKERS", 4, 1)? as usize,
            min_rows_for_parallel: parsed_min("MIN_ROWS_FOR_PARALLEL", 10_000, 1)?,
            chunk_size: parsed_min("CHUNK_SIZE", 5_000, 1)?,
            block_process_rows: parsed_min("BLOCK_PROCESS_ROWS", 5_000, 1)?,
            retry_max: parsed("RETRY_MAX", 3u32)?,
            retry_base_ms: parsed_min("RETRY_BASE_MS", 500, 1)? as u64,
            retry_cap_ms: parsed_min("RETRY_CAP_MS", 30_000, 1)? as u64,
            run_timeout: (run_timeout_sec > 0).then(|| Duration::from_secs(run_timeout_sec)),
            stop_stuck_after: Duration::from_secs(
                parsed_min("STOP_STUCK_AFTER_SEC", 7_200, 1)? as u64,
            ),
            tz,
        })
    }

    /// Resolve the target connection URL for a mapping. Falls back to the
    /// metadata database when no target connection is configured at all
    /// (single-database deployments).
    pub fn target_url_for(&self, connection_id: Option<i64>) -> Result<&str, ConfigError> {
        if let Some(id) = connection_id {
            return self
                .target_urls
                .get(&id)
                .map(String::as_str)
                .ok_or(ConfigError::Missing("DWL_TARGET_URL_<id>"));
        }
        Ok(self
            .target_url
            .as_deref()
            .unwrap_or(self.database_url.as_str()))
    }
}

fn required(key: &'static str) -> Result<String, ConfigError> {
    optional(key).ok_or(ConfigError::Missing(key))
}

fn optional(key: &str) -> Option<String> {
    env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn parsed<T>(key: &'static str, default: T) -> Result<T, ConfigError>
where
    T: FromStr + Copy,
    T::Err: std::fmt::Display,
{
    match optional(key) {
        None => Ok(default),
        Some(raw) => raw.trim().parse::<T>().map_err(|e| ConfigError::Invalid {
            key,
            value: raw,
            reason: e.to_string(),
        }),
    }
}

fn parsed_min(key: &'static str, default: i64, min: i64) -> Result<i64, ConfigError> {
    let v: i64 = parsed(key, default)?;
    if v < min {
        return Err(ConfigError::Invalid {
            key,
            value: v.to_string(),
            reason: format!("must be >= {min}"),
        });
    }
    Ok(v)
}

fn target_urls_from_env() -> HashMap<i64, String> {
    let mut out = HashMap::new();
    for (k, v) in env::vars() {
        if let Some(id) = k.strip_prefix("DWL_TARGET_URL_") {
            if let Ok(id) = id.parse::<i64>() {
                if !v.trim().is_empty() {
                    out.insert(id, v);
                }
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    // Env-var tests mutate process state; keep them in one test so they
    // cannot race each other under the parallel test runner.
    #[test]
    fn from_env_defaults_and_validation() {
        let set = |k: &str, v: &str| env::set_var(k, v);
        let unset = |k: &str| env::remove_var(k);

        for k in [
            "DB_TYPE",
            "DWL_DATABASE_URL",
            "ID_GENERATION_MODE",
            "ID_BLOCK_SIZE",
            "TZ",
            "RUN_TIMEOUT_SEC",
            "DWL_TARGET_URL_7",
        ] {
            unset(k);
        }

        assert!(matches!(
            CoreConfig::from_env(),
            Err(ConfigError::Missing("DB_TYPE"))
        ));

        set("DB_TYPE", "sqlite");
        set("DWL_DATABASE_URL", "sqlite::memory:");
        set("DWL_TARGET_URL_7", "sqlite:target.db");

        let cfg = CoreConfig::from_env().unwrap();
        assert_eq!(cfg.db_type, DbType::Sqlite);
        assert_eq!(cfg.id_mode, IdMode::BlockCounter);
        assert_eq!(cfg.sync_period, Duration::from_secs(60));
        assert_eq!(cfg.poll_period, Duration::from_secs(15));
        assert_eq!(cfg.retry_max, 3);
        assert!(cfg.run_timeout.is_none());
        assert_eq!(cfg.tz, chrono_tz::UTC);
        assert_eq!(cfg.target_url_for(Some(7)).unwrap(), "sqlite:target.db");
        // No default target configured: fall back to the metadata database.
        assert_eq!(cfg.target_url_for(None).unwrap(), "sqlite::memory:");
        assert!(cfg.target_url_for(Some(9)).is_err());

        // Sequence ids are a Postgres-only feature.
        set("ID_GENERATION_MODE", "sequence");
        assert!(matches!(
            CoreConfig::from_env(),
            Err(ConfigError::Invalid { key: "ID_GENERATION_MODE", .. })
        ));
        unset("ID_GENERATION_MODE");

        set("TZ", "Not/AZone");
        assert!(CoreConfig::from_env().is_err());
        set("TZ", "Australia/Sydney");
        let cfg = CoreConfig::from_env().unwrap();
        assert_eq!(cfg.tz, chrono_tz::Australia::Sydney);

        set("RUN_TIMEOUT_SEC", "300");
        let cfg = CoreConfig::from_env().unwrap();
        assert_eq!(cfg.run_timeout, Some(Duration::from_secs(300)));
    }
}
