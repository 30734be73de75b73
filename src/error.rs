//! Error types for Pacekeeper

use thiserror::Error;

/// Errors that can occur while persisting, querying or configuring the engine
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Store error: {0}")]
    Store(String),

    #[error("Invalid calendar day: {0}")]
    InvalidDay(String),

    #[error("Invalid record: {0}")]
    InvalidRecord(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Engine service is not running")]
    ServiceStopped,
}
