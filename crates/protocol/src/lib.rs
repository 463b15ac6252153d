//! Shared data types for the Tether connection supervisor.
//!
//! Connection profiles, lifecycle status, and the telemetry snapshot
//! returned by the transport backend.

pub mod telemetry;
pub mod types;

pub use telemetry::TelemetrySnapshot;
pub use types::{AuthMethod, ConnectionConfig, ConnectionStatus, ValidationError};
