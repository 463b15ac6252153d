//! Connection lifecycle tracking for remote sessions.
//!
//! Provides the authoritative state store, the periodic health checker,
//! and the bounded reconnect coordinator.

pub mod error;
pub mod health;
pub mod locks;
pub mod reconnect;
pub mod store;
pub mod types;

pub use error::{ReconnectError, StoreError};
pub use health::{DEFAULT_HEALTH_CHECK_INTERVAL, HealthScheduler, TickReport};
pub use locks::KeyedLocks;
pub use reconnect::{ReconnectCoordinator, Trigger};
pub use store::StateStore;
pub use types::{ConnectionEvent, ConnectionState, DEFAULT_MAX_RETRIES, StatePatch};
