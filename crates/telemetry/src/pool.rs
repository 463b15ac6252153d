//! Cache of the last good telemetry snapshot per connection.

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};

use tether_protocol::TelemetrySnapshot;

/// A cached snapshot and when it was fetched.
#[derive(Debug, Clone, PartialEq)]
pub struct PooledSnapshot {
    pub snapshot: TelemetrySnapshot,
    pub fetched_at: DateTime<Utc>,
}

impl PooledSnapshot {
    /// Time since the snapshot was fetched.
    pub fn age(&self) -> Duration {
        (Utc::now() - self.fetched_at).to_std().unwrap_or_default()
    }
}

#[derive(Default)]
struct PoolInner {
    snapshots: HashMap<String, PooledSnapshot>,
    errors: HashMap<String, String>,
}

/// Last good telemetry per connection.
///
/// Only the poller and the supervisor write here; presentation code reads.
/// An entry exists only while its connection is believed alive.
#[derive(Default)]
pub struct SnapshotPool {
    inner: RwLock<PoolInner>,
}

impl SnapshotPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores a fresh snapshot and clears any fetch error for `id`.
    pub fn store(&self, id: &str, snapshot: TelemetrySnapshot) {
        self.store_if(id, snapshot, || true);
    }

    /// Like [`store`](Self::store), but only if `keep` still holds once the
    /// write lock is taken. Anyone who invalidates `keep` and then calls
    /// [`forget`](Self::forget) is guaranteed to leave no entry behind.
    pub(crate) fn store_if(
        &self,
        id: &str,
        snapshot: TelemetrySnapshot,
        keep: impl FnOnce() -> bool,
    ) -> bool {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        if !keep() {
            return false;
        }
        inner.snapshots.insert(
            id.to_owned(),
            PooledSnapshot {
                snapshot,
                fetched_at: Utc::now(),
            },
        );
        inner.errors.remove(id);
        true
    }

    pub fn get(&self, id: &str) -> Option<PooledSnapshot> {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .snapshots
            .get(id)
            .cloned()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .snapshots
            .contains_key(id)
    }

    /// Drops the snapshot for `id`. Returns whether one was present.
    pub fn remove(&self, id: &str) -> bool {
        self.inner
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .snapshots
            .remove(id)
            .is_some()
    }

    /// Drops the snapshot and any recorded error for `id`.
    pub fn forget(&self, id: &str) {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        inner.snapshots.remove(id);
        inner.errors.remove(id);
    }

    pub(crate) fn record_error(&self, id: &str, error: String) {
        self.inner
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .errors
            .insert(id.to_owned(), error);
    }

    /// Error from the last fetch cycle that exhausted its retries, if the
    /// connection has not produced a good snapshot since.
    pub fn last_error(&self, id: &str) -> Option<String> {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .errors
            .get(id)
            .cloned()
    }

    /// Identities with a cached snapshot, sorted.
    pub fn ids(&self) -> Vec<String> {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        let mut ids: Vec<String> = inner.snapshots.keys().cloned().collect();
        ids.sort_unstable();
        ids
    }

    pub fn clear(&self) {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        inner.snapshots.clear();
        inner.errors.clear();
    }
}
