//! Authoritative store of connection lifecycle state.
//!
//! One [`ConnectionState`] per identity. Every mutation runs under a short
//! synchronous write lock, and readers get cloned snapshots, so no caller
//! ever observes a half-applied update. Changes are broadcast as
//! [`ConnectionEvent`]s after the lock is released.

use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::Utc;
use tokio::sync::broadcast;
use tracing::{debug, trace};

use tether_protocol::ConnectionStatus;
use tether_transport::SessionId;

use crate::error::StoreError;
use crate::types::{ConnectionEvent, ConnectionState, DEFAULT_MAX_RETRIES, StatePatch};

const EVENT_CAPACITY: usize = 256;

/// Shared connection state, constructed once by the host and handed to every
/// component that needs it.
pub struct StateStore {
    states: RwLock<HashMap<String, ConnectionState>>,
    events: broadcast::Sender<ConnectionEvent>,
    default_max_retries: u32,
}

impl StateStore {
    pub fn new() -> Self {
        Self::with_max_retries(DEFAULT_MAX_RETRIES)
    }

    /// Creates a store whose new entries use `max_retries` as their ceiling.
    pub fn with_max_retries(max_retries: u32) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            states: RwLock::new(HashMap::new()),
            events,
            default_max_retries: max_retries,
        }
    }

    /// Subscribes to state change events.
    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.events.subscribe()
    }

    pub(crate) fn publish(&self, event: ConnectionEvent) {
        trace!(connection = %event.connection_id(), ?event, "publishing connection event");
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<String, ConnectionState>> {
        self.states.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<String, ConnectionState>> {
        self.states.write().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn get(&self, id: &str) -> Option<ConnectionState> {
        self.read().get(id).cloned()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.read().contains_key(id)
    }

    /// Merges `patch` into the entry for `id`, creating it when absent.
    ///
    /// Creation requires `patch.config`. `last_check` moves to now whenever
    /// the status changes, and `retry_count` is clamped to `max_retries`.
    pub fn upsert(&self, id: &str, patch: StatePatch) -> Result<ConnectionState, StoreError> {
        let (state, changed) = {
            let mut states = self.write();
            let (entry, created) = match states.entry(id.to_owned()) {
                Entry::Occupied(occupied) => (occupied.into_mut(), false),
                Entry::Vacant(vacant) => {
                    let config = patch
                        .config
                        .clone()
                        .ok_or_else(|| StoreError::MissingConfig(id.to_owned()))?;
                    let fresh = ConnectionState::new(id, config, self.default_max_retries);
                    (vacant.insert(fresh), true)
                }
            };

            let previous = entry.status;
            if let Some(config) = patch.config {
                entry.config = config;
            }
            if let Some(status) = patch.status {
                entry.status = status;
            }
            if let Some(error) = patch.last_error {
                entry.last_error = error;
            }
            if let Some(max) = patch.max_retries {
                entry.max_retries = max;
            }
            if let Some(count) = patch.retry_count {
                entry.retry_count = count;
            }
            if let Some(session) = patch.session_id {
                entry.session_id = session;
            }
            entry.retry_count = entry.retry_count.min(entry.max_retries);

            let changed = created || entry.status != previous;
            if changed {
                entry.last_check = Utc::now();
            }
            (entry.clone(), changed)
        };

        if changed {
            debug!(connection = %id, status = %state.status, "connection state upserted");
            self.publish(state_changed(&state));
        }
        Ok(state)
    }

    /// Moves `id` to `status`.
    ///
    /// `Error` increments `retry_count` by one (never past `max_retries`) and
    /// records `error`. `Connected` resets `retry_count` to 0. Every status
    /// other than `Error` clears `last_error`; transitional statuses leave
    /// the counter alone so an automatic recovery cycle keeps its tally.
    pub fn set_status(
        &self,
        id: &str,
        status: ConnectionStatus,
        error: Option<String>,
    ) -> Option<ConnectionState> {
        let state = {
            let mut states = self.write();
            let entry = states.get_mut(id)?;
            apply_status(entry, status, error);
            entry.clone()
        };
        debug!(
            connection = %id,
            status = %state.status,
            retry_count = state.retry_count,
            "connection status changed"
        );
        self.publish(state_changed(&state));
        Some(state)
    }

    /// Records a successful (re)connect: stores the session handle and
    /// transitions to `Connected` in one step.
    pub fn mark_connected(&self, id: &str, session: SessionId) -> Option<ConnectionState> {
        let state = {
            let mut states = self.write();
            let entry = states.get_mut(id)?;
            entry.session_id = Some(session);
            apply_status(entry, ConnectionStatus::Connected, None);
            entry.clone()
        };
        debug!(connection = %id, "connection marked connected");
        self.publish(state_changed(&state));
        Some(state)
    }

    /// Records a teardown: drops the session handle and moves to
    /// `Disconnected`, resetting the retry counter.
    pub fn mark_disconnected(&self, id: &str) -> Option<ConnectionState> {
        let state = {
            let mut states = self.write();
            let entry = states.get_mut(id)?;
            entry.session_id = None;
            entry.retry_count = 0;
            apply_status(entry, ConnectionStatus::Disconnected, None);
            entry.clone()
        };
        self.publish(state_changed(&state));
        Some(state)
    }

    /// Explicit external reset of the retry counter.
    pub fn reset_retries(&self, id: &str) -> Option<ConnectionState> {
        let mut states = self.write();
        let entry = states.get_mut(id)?;
        entry.retry_count = 0;
        Some(entry.clone())
    }

    /// Records a healthy observation without changing anything else.
    pub fn touch(&self, id: &str) -> bool {
        match self.write().get_mut(id) {
            Some(entry) => {
                entry.last_check = Utc::now();
                true
            }
            None => false,
        }
    }

    /// Deletes the entry for `id`. No-op when absent.
    pub fn remove(&self, id: &str) -> Option<ConnectionState> {
        let removed = self.write().remove(id);
        if removed.is_some() {
            debug!(connection = %id, "connection state removed");
            self.publish(ConnectionEvent::Removed {
                connection_id: id.to_owned(),
            });
        }
        removed
    }

    /// Snapshot of every entry, ordered by identity.
    pub fn all(&self) -> Vec<ConnectionState> {
        let mut states: Vec<ConnectionState> = self.read().values().cloned().collect();
        states.sort_by(|a, b| a.id.cmp(&b.id));
        states
    }

    /// Snapshot of the entries currently in `status`, ordered by identity.
    pub fn with_status(&self, status: ConnectionStatus) -> Vec<ConnectionState> {
        let mut states: Vec<ConnectionState> = self
            .read()
            .values()
            .filter(|s| s.status == status)
            .cloned()
            .collect();
        states.sort_by(|a, b| a.id.cmp(&b.id));
        states
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }
}

impl Default for StateStore {
    fn default() -> Self {
        Self::new()
    }
}

fn apply_status(entry: &mut ConnectionState, status: ConnectionStatus, error: Option<String>) {
    entry.status = status;
    entry.last_check = Utc::now();
    match status {
        ConnectionStatus::Error => {
            entry.retry_count = entry.retry_count.saturating_add(1).min(entry.max_retries);
            entry.last_error = error;
        }
        ConnectionStatus::Connected => {
            entry.retry_count = 0;
            entry.last_error = None;
        }
        _ => entry.last_error = None,
    }
}

fn state_changed(state: &ConnectionState) -> ConnectionEvent {
    ConnectionEvent::StateChanged {
        connection_id: state.id.clone(),
        status: state.status,
        retry_count: state.retry_count,
        error: state.last_error.clone(),
    }
}
