//! Error types for connection lifecycle operations.

use tether_transport::TransportError;

/// Errors produced by the state store.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("no state for connection {0} and no config to create it")]
    MissingConfig(String),
}

/// Errors produced by a reconnect attempt.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ReconnectError {
    #[error("unknown connection: {0}")]
    NotFound(String),

    #[error("connection {connection_id} exhausted {retries} retries")]
    RetryExhausted { connection_id: String, retries: u32 },

    #[error(transparent)]
    Transport(#[from] TransportError),
}
