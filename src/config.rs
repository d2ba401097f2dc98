// ⚙️ Engine Configuration
//
// Defaults are suitable for local runs; every knob can be overridden from the
// environment (`TOLL_*`) or by the CLI.

use crate::error::{EngineError, Result};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::time::Duration;

// ============================================================================
// IMPORT
// ============================================================================

/// What to do when an incoming row has a known identity but different content.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdatePolicy {
    /// Leave the stored record alone and surface a review item.
    FlagForReview,
    /// Correct the stored record in place (identity hash is kept).
    AutoApply,
}

impl FromStr for UpdatePolicy {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "flag_for_review" | "flag" | "review" => Ok(UpdatePolicy::FlagForReview),
            "auto_apply" | "apply" => Ok(UpdatePolicy::AutoApply),
            other => Err(EngineError::validation(
                "update_policy",
                format!("unknown update policy: {}", other),
            )),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImportConfig {
    /// Treat validation warnings as row errors
    pub strict_mode: bool,
    /// Count duplicates as `duplicate` (true) or as row errors (false)
    pub skip_duplicates: bool,
    /// Abort the session once this many row errors accumulate (0 = unlimited)
    pub max_errors: usize,
    /// Rows persisted per transaction
    pub chunk_size: usize,
    /// How many issues an import result carries back to the caller
    pub error_sample_size: usize,
    pub update_policy: UpdatePolicy,
}

impl Default for ImportConfig {
    fn default() -> Self {
        ImportConfig {
            strict_mode: false,
            skip_duplicates: true,
            max_errors: 100,
            chunk_size: 500,
            error_sample_size: 20,
            update_policy: UpdatePolicy::FlagForReview,
        }
    }
}

// ============================================================================
// MATCHING
// ============================================================================

/// Widest ledger search window accepted, in days.
pub const MAX_DATE_WINDOW_DAYS: i64 = 366;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MatchConfig {
    /// Candidates scoring below this are discarded (default: 0.80)
    pub confidence_threshold: f64,
    /// Top candidates at or above this become `active` (default: 0.95)
    pub auto_activate_threshold: f64,
    /// Ledger search window around the usage date, in days (default: 1)
    pub date_window_days: i64,
    /// Ask the ledger for the record's vehicle only
    pub filter_by_vehicle: bool,
    pub weight_date: f64,
    pub weight_vehicle: f64,
    pub weight_amount: f64,
}

impl Default for MatchConfig {
    fn default() -> Self {
        MatchConfig {
            confidence_threshold: 0.80,
            auto_activate_threshold: 0.95,
            date_window_days: 1,
            filter_by_vehicle: false,
            weight_date: 0.4,
            weight_vehicle: 0.4,
            weight_amount: 0.2,
        }
    }
}

// ============================================================================
// JOBS
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobConfig {
    pub workers: usize,
    pub queue_capacity: usize,
    pub submit_timeout: Duration,
    pub job_timeout: Duration,
    pub retention: Duration,
    pub sweep_interval: Duration,
}

impl Default for JobConfig {
    fn default() -> Self {
        JobConfig {
            workers: 4,
            queue_capacity: 64,
            submit_timeout: Duration::from_secs(5),
            job_timeout: Duration::from_secs(30 * 60),
            retention: Duration::from_secs(24 * 60 * 60),
            sweep_interval: Duration::from_secs(10 * 60),
        }
    }
}

// ============================================================================
// ENGINE CONFIG
// ============================================================================

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineConfig {
    pub import: ImportConfig,
    pub matching: MatchConfig,
    pub jobs: JobConfig,
    pub timeouts: TimeoutConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeoutConfig {
    /// Deadline for a single persistence call
    pub storage: Duration,
    /// Deadline for a single ledger query
    pub ledger: Duration,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        TimeoutConfig {
            storage: Duration::from_secs(10),
            ledger: Duration::from_secs(15),
        }
    }
}

impl EngineConfig {
    /// Load configuration from environment variables with defaults.
    ///
    /// | Env Var                        | Default           |
    /// |--------------------------------|-------------------|
    /// | `TOLL_STRICT_MODE`             | `false`           |
    /// | `TOLL_SKIP_DUPLICATES`         | `true`            |
    /// | `TOLL_MAX_ERRORS`              | `100`             |
    /// | `TOLL_CHUNK_SIZE`              | `500`             |
    /// | `TOLL_ERROR_SAMPLE_SIZE`       | `20`              |
    /// | `TOLL_UPDATE_POLICY`           | `flag_for_review` |
    /// | `TOLL_CONFIDENCE_THRESHOLD`    | `0.80`            |
    /// | `TOLL_AUTO_ACTIVATE_THRESHOLD` | `0.95`            |
    /// | `TOLL_DATE_WINDOW_DAYS`        | `1`               |
    /// | `TOLL_JOB_WORKERS`             | `4`               |
    /// | `TOLL_JOB_QUEUE_CAPACITY`      | `64`              |
    /// | `TOLL_JOB_TIMEOUT_SECS`        | `1800`            |
    /// | `TOLL_JOB_RETENTION_SECS`      | `86400`           |
    /// | `TOLL_STORAGE_TIMEOUT_SECS`    | `10`              |
    /// | `TOLL_LEDGER_TIMEOUT_SECS`     | `15`              |
    pub fn from_env() -> Result<Self> {
        let mut config = EngineConfig::default();

        if let Some(v) = env_parse("TOLL_STRICT_MODE")? {
            config.import.strict_mode = v;
        }
        if let Some(v) = env_parse("TOLL_SKIP_DUPLICATES")? {
            config.import.skip_duplicates = v;
        }
        if let Some(v) = env_parse("TOLL_MAX_ERRORS")? {
            config.import.max_errors = v;
        }
        if let Some(v) = env_parse("TOLL_CHUNK_SIZE")? {
            config.import.chunk_size = v;
        }
        if let Some(v) = env_parse("TOLL_ERROR_SAMPLE_SIZE")? {
            config.import.error_sample_size = v;
        }
        if let Some(v) = env_parse("TOLL_UPDATE_POLICY")? {
            config.import.update_policy = v;
        }
        if let Some(v) = env_parse("TOLL_CONFIDENCE_THRESHOLD")? {
            config.matching.confidence_threshold = v;
        }
        if let Some(v) = env_parse("TOLL_AUTO_ACTIVATE_THRESHOLD")? {
            config.matching.auto_activate_threshold = v;
        }
        if let Some(v) = env_parse("TOLL_DATE_WINDOW_DAYS")? {
            config.matching.date_window_days = v;
        }
        if let Some(v) = env_parse("TOLL_JOB_WORKERS")? {
            config.jobs.workers = v;
        }
        if let Some(v) = env_parse("TOLL_JOB_QUEUE_CAPACITY")? {
            config.jobs.queue_capacity = v;
        }
        if let Some(secs) = env_parse::<u64>("TOLL_JOB_TIMEOUT_SECS")? {
            config.jobs.job_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = env_parse::<u64>("TOLL_JOB_RETENTION_SECS")? {
            config.jobs.retention = Duration::from_secs(secs);
        }
        if let Some(secs) = env_parse::<u64>("TOLL_STORAGE_TIMEOUT_SECS")? {
            config.timeouts.storage = Duration::from_secs(secs);
        }
        if let Some(secs) = env_parse::<u64>("TOLL_LEDGER_TIMEOUT_SECS")? {
            config.timeouts.ledger = Duration::from_secs(secs);
        }

        config.validate()?;
        Ok(config)
    }

    /// Reject settings the engine cannot run with.
    pub fn validate(&self) -> Result<()> {
        let m = &self.matching;
        if !(0.0..=1.0).contains(&m.confidence_threshold) {
            return Err(invalid("confidence_threshold", "must be within [0, 1]"));
        }
        if !(0.0..=1.0).contains(&m.auto_activate_threshold) {
            return Err(invalid("auto_activate_threshold", "must be within [0, 1]"));
        }
        if m.weight_date < 0.0 || m.weight_vehicle < 0.0 || m.weight_amount < 0.0 {
            return Err(invalid("weights", "match weights must be non-negative"));
        }
        if m.weight_date + m.weight_vehicle + m.weight_amount <= 0.0 {
            return Err(invalid("weights", "at least one match weight must be positive"));
        }
        if !(0..=MAX_DATE_WINDOW_DAYS).contains(&m.date_window_days) {
            return Err(invalid(
                "date_window_days",
                format!("must be within [0, {}]", MAX_DATE_WINDOW_DAYS),
            ));
        }
        if self.import.chunk_size == 0 {
            return Err(invalid("chunk_size", "must be at least 1"));
        }
        if self.jobs.workers == 0 || self.jobs.queue_capacity == 0 {
            return Err(invalid(
                "jobs",
                "job pool needs at least one worker and one queue slot",
            ));
        }
        Ok(())
    }
}

fn invalid(field: &str, message: impl Into<String>) -> EngineError {
    EngineError::validation(field, message)
}

fn env_parse<T>(key: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(raw) => raw.trim().parse::<T>().map(Some).map_err(|e| {
            EngineError::validation(key, format!("invalid value {:?}: {}", raw, e))
        }),
        Err(_) => Ok(None),
    }
}
