use rusqlite::ErrorCode;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum GateError {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Malformed input or a reference to an id that does not exist.
    #[error("Validation error: {0}")]
    Validation(String),

    /// A value outside its declared domain (reward bounds, class labels, ...).
    #[error("Constraint error: {0}")]
    Constraint(String),

    /// Counters for a stratum are inconsistent. The stratum is quarantined
    /// until reconciled.
    #[error("Integrity error in stratum '{stratum}': {detail}")]
    Integrity { stratum: String, detail: String },

    /// Context-model input of the wrong dimensionality or non-finite values.
    #[error("Shape error: {0}")]
    Shape(String),

    /// The safety check did not complete in time. Always resolved as defer.
    #[error("Safety check timed out for stratum '{stratum}'")]
    Timeout { stratum: String },

    #[error("{entity} '{id}' not found")]
    NotFound { entity: &'static str, id: String },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl GateError {
    /// True when the underlying SQLite call gave up waiting on a lock.
    pub fn is_busy(&self) -> bool {
        match self {
            GateError::Database(rusqlite::Error::SqliteFailure(err, _)) => matches!(
                err.code,
                ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked
            ),
            _ => false,
        }
    }
}

pub type GateResult<T> = Result<T, GateError>;
