// 🚨 Error Taxonomy - one structured error for the whole engine
//
// Every variant maps onto one of four kinds:
//   Validation - bad input row, recorded and skipped
//   Conflict   - duplicate / active-mapping clash, aborts one operation
//   Transient  - storage, ledger, timeout or backpressure, caller may retry
//   Fatal      - invariant violation, aborts the enclosing batch

use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, EngineError>;

// ============================================================================
// ERROR KIND
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Validation,
    Conflict,
    Transient,
    Fatal,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Validation => "validation",
            ErrorKind::Conflict => "conflict",
            ErrorKind::Transient => "transient",
            ErrorKind::Fatal => "fatal",
        }
    }
}

// ============================================================================
// ENGINE ERROR
// ============================================================================

#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "error", rename_all = "snake_case")]
pub enum EngineError {
    #[error("invalid {field}: {message}")]
    Validation { field: String, message: String },

    #[error("{entity} conflicts with {conflicting_id}: {message}")]
    Conflict {
        entity: String,
        conflicting_id: String,
        message: String,
    },

    #[error("{entity} {id} not found")]
    NotFound { entity: String, id: String },

    #[error("invalid {entity} transition: {from} -> {to}")]
    InvalidTransition {
        entity: String,
        from: String,
        to: String,
    },

    #[error("{entity} {id} is {status} and can no longer change")]
    Terminal {
        entity: String,
        id: String,
        status: String,
    },

    #[error("{operation} failed: {message}")]
    Transient { operation: String, message: String },

    #[error("{operation} timed out after {after_ms}ms")]
    Timeout { operation: String, after_ms: u64 },

    #[error("fatal: {message}")]
    Fatal { message: String },
}

impl EngineError {
    pub fn validation(field: impl Into<String>, message: impl Into<String>) -> Self {
        EngineError::Validation {
            field: field.into(),
            message: message.into(),
        }
    }

    pub fn conflict(
        entity: impl Into<String>,
        conflicting_id: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        EngineError::Conflict {
            entity: entity.into(),
            conflicting_id: conflicting_id.into(),
            message: message.into(),
        }
    }

    pub fn not_found(entity: impl Into<String>, id: impl Into<String>) -> Self {
        EngineError::NotFound {
            entity: entity.into(),
            id: id.into(),
        }
    }

    pub fn transient(operation: impl Into<String>, message: impl Into<String>) -> Self {
        EngineError::Transient {
            operation: operation.into(),
            message: message.into(),
        }
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        EngineError::Fatal {
            message: message.into(),
        }
    }

    /// Machine-readable classification used by callers to decide retry/abort.
    pub fn kind(&self) -> ErrorKind {
        match self {
            EngineError::Validation { .. } | EngineError::NotFound { .. } => ErrorKind::Validation,
            EngineError::Conflict { .. }
            | EngineError::InvalidTransition { .. }
            | EngineError::Terminal { .. } => ErrorKind::Conflict,
            EngineError::Transient { .. } | EngineError::Timeout { .. } => ErrorKind::Transient,
            EngineError::Fatal { .. } => ErrorKind::Fatal,
        }
    }

    pub fn is_transient(&self) -> bool {
        self.kind() == ErrorKind::Transient
    }
}

impl From<rusqlite::Error> for EngineError {
    fn from(err: rusqlite::Error) -> Self {
        match err {
            rusqlite::Error::SqliteFailure(ref code, ref detail)
                if code.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                let message = detail.clone().unwrap_or_else(|| err.to_string());
                let (entity, target) = constraint_target(&message);
                EngineError::conflict(entity, target, message)
            }
            other => EngineError::transient("sqlite", other.to_string()),
        }
    }
}

/// Split "UNIQUE constraint failed: toll_records.identity_hash" into the table
/// and the `table.column` that clashed.
fn constraint_target(message: &str) -> (String, String) {
    let target = message
        .rsplit(": ")
        .next()
        .and_then(|cols| cols.split(',').next())
        .map(str::trim)
        .filter(|col| !col.is_empty() && !col.contains(' '))
        .unwrap_or("constraint");
    let entity = target.split('.').next().unwrap_or(target);
    (entity.to_string(), target.to_string())
}

impl From<serde_json::Error> for EngineError {
    fn from(err: serde_json::Error) -> Self {
        EngineError::fatal(format!("serialization: {}", err))
    }
}

// ============================================================================
// DEADLINES
// ============================================================================

/// Await `fut`, failing with [`EngineError::Timeout`] once `limit` elapses.
///
/// Every suspension point on an external dependency goes through here so a hung
/// store or ledger cannot wedge a worker.
pub async fn with_deadline<T, F>(operation: &str, limit: Duration, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => Err(EngineError::Timeout {
            operation: operation.to_string(),
            after_ms: limit.as_millis() as u64,
        }),
    }
}

// ============================================================================
// TESTS
// ============================================================================
