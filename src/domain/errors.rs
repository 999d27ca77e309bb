use crate::domain::repositories::broker::BrokerError;
use thiserror::Error;

/// Top-level engine error kinds. Startup kinds (`Config`, `LockHeld`) are
/// fatal; per-cycle kinds are caught at the loop boundary so one symbol's
/// failure does not stop the others. Risk denials and session gating are
/// not errors: they flow through `RiskDenied` / `SessionDenial` values,
/// and reconciliation verdicts travel in the pass report.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("another instance holds the lock: {0}")]
    LockHeld(String),

    #[error(transparent)]
    Broker(#[from] BrokerError),

    #[error("store persistence error: {0}")]
    Store(String),

    #[error("universe selection halted: {0}")]
    UniverseHalted(String),
}

impl From<sqlx::Error> for EngineError {
    fn from(e: sqlx::Error) -> Self {
        EngineError::Store(e.to_string())
    }
}

impl From<crate::persistence::DatabaseError> for EngineError {
    fn from(e: crate::persistence::DatabaseError) -> Self {
        EngineError::Store(e.to_string())
    }
}
