//! Public types for connection lifecycle tracking.

use chrono::{DateTime, Utc};

use tether_protocol::{ConnectionConfig, ConnectionStatus};
use tether_transport::SessionId;

/// Default ceiling on consecutive automatic reconnect failures.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Lifecycle state of one connection identity.
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionState {
    pub id: String,
    pub status: ConnectionStatus,
    /// Parameters used for every (re)connect attempt.
    pub config: ConnectionConfig,
    /// Last health observation or status change.
    pub last_check: DateTime<Utc>,
    pub last_error: Option<String>,
    /// Consecutive failures since the last successful connect.
    pub retry_count: u32,
    pub max_retries: u32,
    /// Transport handle of the live session, if any.
    pub session_id: Option<SessionId>,
}

impl ConnectionState {
    pub(crate) fn new(id: &str, config: ConnectionConfig, max_retries: u32) -> Self {
        Self {
            id: id.to_owned(),
            status: ConnectionStatus::Disconnected,
            config,
            last_check: Utc::now(),
            last_error: None,
            retry_count: 0,
            max_retries,
            session_id: None,
        }
    }

    /// Whether automatic recovery has hit the retry ceiling.
    pub fn retries_exhausted(&self) -> bool {
        self.retry_count >= self.max_retries
    }

    /// The live session handle, if the connection has one.
    pub fn session(&self) -> Option<&str> {
        self.session_id.as_deref()
    }
}

/// Partial update merged into a [`ConnectionState`] by
/// [`StateStore::upsert`](crate::StateStore::upsert).
///
/// `None` leaves a field untouched. The nested options on `last_error` and
/// `session_id` distinguish "leave alone" from "clear".
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StatePatch {
    pub status: Option<ConnectionStatus>,
    pub config: Option<ConnectionConfig>,
    pub last_error: Option<Option<String>>,
    pub retry_count: Option<u32>,
    pub max_retries: Option<u32>,
    pub session_id: Option<Option<SessionId>>,
}

impl StatePatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn status(mut self, status: ConnectionStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn config(mut self, config: ConnectionConfig) -> Self {
        self.config = Some(config);
        self
    }

    pub fn last_error(mut self, error: Option<String>) -> Self {
        self.last_error = Some(error);
        self
    }

    pub fn retry_count(mut self, count: u32) -> Self {
        self.retry_count = Some(count);
        self
    }

    pub fn max_retries(mut self, max: u32) -> Self {
        self.max_retries = Some(max);
        self
    }

    pub fn session_id(mut self, session: Option<SessionId>) -> Self {
        self.session_id = Some(session);
        self
    }
}

/// Events broadcast by the state store.
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionEvent {
    /// Status (or error) of a connection changed.
    StateChanged {
        connection_id: String,
        status: ConnectionStatus,
        retry_count: u32,
        error: Option<String>,
    },
    /// A reconnect attempt is starting.
    Reconnecting { connection_id: String, attempt: u32 },
    /// Automatic recovery gave up; only a user reconnect resumes it.
    RetryExhausted { connection_id: String, retries: u32 },
    /// The connection's state was deleted.
    Removed { connection_id: String },
}

impl ConnectionEvent {
    pub fn connection_id(&self) -> &str {
        match self {
            Self::StateChanged { connection_id, .. }
            | Self::Reconnecting { connection_id, .. }
            | Self::RetryExhausted { connection_id, .. }
            | Self::Removed { connection_id } => connection_id,
        }
    }
}
