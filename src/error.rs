//! Error types for the delivery layer.

use crate::types::GenerationId;
use thiserror::Error;

/// Main error type for flow and dispatch operations.
#[derive(Debug, Error)]
pub enum FlowError {
    #[error("bind rejected by broker: {0}")]
    BindFailure(String),

    #[error("flow is not bound")]
    Unbound,

    #[error("stale message: generation {0} is no longer current")]
    StaleMessage(GenerationId),

    #[error("consumer was closed while in receive")]
    ClosedWhileReceiving,

    #[error("settlement rejected by broker: {0}")]
    SettlementFailure(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("session error: {0}")]
    Session(String),
}

/// Result type for flow and dispatch operations.
pub type Result<T> = std::result::Result<T, FlowError>;
