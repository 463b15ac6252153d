//! Connection lifecycle supervisor.
//!
//! Tracks the health of independently opened remote sessions, reconnects
//! them under a bounded retry policy, and polls telemetry for the connection
//! on screen. The transport is supplied by the host through
//! [`tether_transport::Transport`].

pub mod config;
pub mod error;
pub mod supervisor;

pub use config::SupervisorConfig;
pub use error::{ConfigError, SupervisorError};
pub use supervisor::Supervisor;

pub use tether_connection::{ConnectionEvent, ConnectionState};
pub use tether_protocol::{ConnectionConfig, ConnectionStatus, TelemetrySnapshot};
pub use tether_sessions::TabInfo;
pub use tether_telemetry::{FetchOutcome, PooledSnapshot};
pub use tether_transport::{SessionId, Transport, TransportError};

use tracing_subscriber::EnvFilter;

/// Installs a `fmt` subscriber filtered by `RUST_LOG`, defaulting to
/// `info,tether=debug`. Does nothing if a subscriber is already set.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,tether=debug")),
        )
        .try_init();
}
