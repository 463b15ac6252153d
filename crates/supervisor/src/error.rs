//! Error types returned by supervisor commands.

use tether_connection::{ReconnectError, StoreError};
use tether_protocol::ValidationError;
use tether_sessions::TabError;
use tether_transport::TransportError;

/// Errors produced by a user-facing supervisor command.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SupervisorError {
    #[error("unknown connection: {0}")]
    NotFound(String),

    #[error("connection {0} has no live session")]
    NotConnected(String),

    #[error("invalid connection config: {0}")]
    InvalidConfig(#[from] ValidationError),

    #[error("connection {connection_id} exhausted {retries} retries")]
    RetryExhausted { connection_id: String, retries: u32 },

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Tab(#[from] TabError),
}

impl From<ReconnectError> for SupervisorError {
    fn from(e: ReconnectError) -> Self {
        match e {
            ReconnectError::NotFound(id) => Self::NotFound(id),
            ReconnectError::RetryExhausted {
                connection_id,
                retries,
            } => Self::RetryExhausted {
                connection_id,
                retries,
            },
            ReconnectError::Transport(e) => Self::Transport(e),
        }
    }
}

/// Rejected configuration values.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("health check interval must be at least 1 second")]
    ZeroHealthInterval,

    #[error("backoff base ({base_ms} ms) exceeds backoff cap ({max_ms} ms)")]
    BackoffOrder { base_ms: u64, max_ms: u64 },
}
