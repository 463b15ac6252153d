//! Periodic health checks with tick-paced automatic recovery.
//!
//! Every tick probes each `Connected` entry. A failed probe drops the entry
//! to `Disconnected` and hands it to the [`ReconnectCoordinator`]. Entries
//! left in `Error` below their retry ceiling get one more attempt per tick,
//! so recovery is paced by the check interval and bounded by count.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use futures_util::StreamExt;
use futures_util::stream::FuturesUnordered;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use tether_protocol::ConnectionStatus;
use tether_transport::Transport;

use crate::error::ReconnectError;
use crate::locks::KeyedLocks;
use crate::reconnect::{ReconnectCoordinator, Trigger};
use crate::store::StateStore;
use crate::types::ConnectionEvent;

/// Default interval between health checks.
pub const DEFAULT_HEALTH_CHECK_INTERVAL: Duration = Duration::from_secs(30);

/// What a single pass did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickReport {
    pub healthy: usize,
    pub reconnected: usize,
    pub failed: usize,
    pub exhausted: usize,
}

enum Outcome {
    Skipped,
    Healthy,
    Reconnected,
    Failed,
    Exhausted,
}

pub struct HealthScheduler<T> {
    store: Arc<StateStore>,
    transport: Arc<T>,
    coordinator: Arc<ReconnectCoordinator<T>>,
    locks: Arc<KeyedLocks>,
    interval: Duration,
    cancel: Mutex<Option<CancellationToken>>,
}

impl<T: Transport> HealthScheduler<T> {
    pub fn new(
        store: Arc<StateStore>,
        transport: Arc<T>,
        coordinator: Arc<ReconnectCoordinator<T>>,
        locks: Arc<KeyedLocks>,
        interval: Duration,
    ) -> Self {
        Self {
            store,
            transport,
            coordinator,
            locks,
            interval,
            cancel: Mutex::new(None),
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Starts the recurring check. Returns `false` if it was already running.
    pub fn start(self: &Arc<Self>) -> bool {
        let mut guard = self.cancel.lock().unwrap_or_else(PoisonError::into_inner);
        if guard.is_some() {
            return false;
        }
        let cancel = CancellationToken::new();
        *guard = Some(cancel.clone());
        drop(guard);

        let scheduler = Arc::clone(self);
        tokio::spawn(async move {
            scheduler.check_loop(cancel).await;
        });
        info!(interval_secs = self.interval.as_secs(), "health check started");
        true
    }

    /// Stops the recurring check. No-op when not running.
    pub fn stop(&self) {
        let token = self
            .cancel
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(token) = token {
            token.cancel();
            info!("health check stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        self.cancel
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    async fn check_loop(&self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.interval);
        // Ticks that come due while a pass runs collapse into one, taken
        // when the pass ends. Passes never overlap.
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    // A started pass runs to completion so no entry is left
                    // stranded in `Reconnecting`.
                    let report = self.run_once().await;
                    debug!(?report, "health check pass finished");
                }
            }
        }
    }

    /// Runs one pass over every candidate entry, concurrently per identity.
    pub async fn run_once(&self) -> TickReport {
        let candidates: Vec<String> = self
            .store
            .all()
            .into_iter()
            .filter(|s| {
                s.status == ConnectionStatus::Connected
                    || (s.status == ConnectionStatus::Error && !s.retries_exhausted())
            })
            .map(|s| s.id)
            .collect();

        let mut checks = FuturesUnordered::new();
        for id in candidates {
            checks.push(self.check_one(id));
        }

        let mut report = TickReport::default();
        while let Some(outcome) = checks.next().await {
            match outcome {
                Outcome::Skipped => {}
                Outcome::Healthy => report.healthy += 1,
                Outcome::Reconnected => report.reconnected += 1,
                Outcome::Failed => report.failed += 1,
                Outcome::Exhausted => report.exhausted += 1,
            }
        }
        report
    }

    async fn check_one(&self, id: String) -> Outcome {
        let id = id.as_str();
        let _guard = self.locks.lock(id).await;
        // Re-read under the lock: a user command may have won the race.
        let Some(state) = self.store.get(id) else {
            return Outcome::Skipped;
        };

        match state.status {
            ConnectionStatus::Connected => {
                let alive = match state.session() {
                    Some(session) => self.transport.is_alive(session).await,
                    None => false,
                };
                if alive {
                    self.store.touch(id);
                    return Outcome::Healthy;
                }

                warn!(connection = %id, "health check failed");
                self.store
                    .set_status(id, ConnectionStatus::Disconnected, None);

                if state.retries_exhausted() {
                    warn!(
                        connection = %id,
                        retries = state.retry_count,
                        "retry ceiling reached, leaving connection down"
                    );
                    self.store.publish(ConnectionEvent::RetryExhausted {
                        connection_id: id.to_owned(),
                        retries: state.retry_count,
                    });
                    return Outcome::Exhausted;
                }
                self.recover(id).await
            }
            ConnectionStatus::Error if !state.retries_exhausted() => self.recover(id).await,
            _ => Outcome::Skipped,
        }
    }

    async fn recover(&self, id: &str) -> Outcome {
        match self.coordinator.attempt(id, Trigger::Automatic).await {
            Ok(_) => Outcome::Reconnected,
            Err(ReconnectError::RetryExhausted { .. }) => Outcome::Exhausted,
            Err(ReconnectError::NotFound(_)) => Outcome::Skipped,
            Err(ReconnectError::Transport(_)) => Outcome::Failed,
        }
    }
}
