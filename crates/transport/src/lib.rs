//! Transport backend contract.
//!
//! The supervisor never speaks a remote protocol itself. It drives whatever
//! implements [`Transport`]: opening sessions, probing liveness, running
//! commands, and fetching telemetry snapshots.

use std::future::Future;

use tether_protocol::{ConnectionConfig, TelemetrySnapshot};

#[cfg(any(test, feature = "mock"))]
pub mod mock;

/// Handle returned by [`Transport::connect`] and accepted by every other call.
pub type SessionId = String;

/// Failures reported by a transport backend.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("connect failed: {0}")]
    Connect(String),

    #[error("disconnect failed: {0}")]
    Disconnect(String),

    #[error("command failed: {0}")]
    Exec(String),

    #[error("telemetry unavailable: {0}")]
    Telemetry(String),

    #[error("session not found: {0}")]
    SessionNotFound(String),
}

/// A backend able to open and drive remote sessions.
///
/// Every call may take arbitrarily long; the supervisor awaits them from
/// spawned tasks and never holds a store lock across one.
pub trait Transport: Send + Sync + 'static {
    /// Opens a session for `config`.
    fn connect(
        &self,
        config: &ConnectionConfig,
    ) -> impl Future<Output = Result<SessionId, TransportError>> + Send;

    /// Closes a session.
    fn disconnect(&self, session: &str) -> impl Future<Output = Result<(), TransportError>> + Send;

    /// Cheap liveness probe. Unknown sessions report `false`, never an error.
    fn is_alive(&self, session: &str) -> impl Future<Output = bool> + Send;

    /// Runs a command and returns its output.
    fn execute(
        &self,
        session: &str,
        command: &str,
    ) -> impl Future<Output = Result<String, TransportError>> + Send;

    /// Fetches a hardware metrics snapshot.
    fn get_telemetry(
        &self,
        session: &str,
    ) -> impl Future<Output = Result<TelemetrySnapshot, TransportError>> + Send;
}
