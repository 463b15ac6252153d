//! Telemetry polling for supervised connections.
//!
//! Each polled connection gets its own recurring fetch task. A failed fetch
//! is retried inline with exponential backoff; if every retry fails the
//! cached snapshot is dropped rather than left to go stale.

pub mod backoff;
pub mod pool;
pub mod poller;
pub mod timers;

pub use backoff::BackoffPolicy;
pub use pool::{PooledSnapshot, SnapshotPool};
pub use poller::{FetchOutcome, PollerConfig, TelemetryPoller};
pub use timers::{PollTimer, TimerRegistry};
