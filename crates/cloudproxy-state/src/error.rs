//! Error types for the fleet state store.

use thiserror::Error;

use crate::types::ProxyState;

/// Result type alias for state store operations.
pub type StateResult<T> = Result<T, StateError>;

/// Errors that can occur during state store operations.
#[derive(Debug, Error)]
pub enum StateError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("validation error: {0}")]
    Validation(String),

    #[error("concurrency conflict: {0}")]
    Conflict(String),

    #[error("illegal transition for {ip}: {from:?} -> {to:?}")]
    InvalidTransition {
        ip: String,
        from: ProxyState,
        to: ProxyState,
    },

    #[error("state lock poisoned")]
    Poisoned,

    #[error("failed to open database: {0}")]
    Open(String),

    #[error("transaction error: {0}")]
    Transaction(String),

    #[error("table error: {0}")]
    Table(String),

    #[error("read error: {0}")]
    Read(String),

    #[error("write error: {0}")]
    Write(String),

    #[error("serialization error: {0}")]
    Serialize(String),

    #[error("deserialization error: {0}")]
    Deserialize(String),
}
