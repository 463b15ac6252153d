//! Bounded reconnect coordination.
//!
//! One call makes one attempt. Pacing between attempts belongs to the
//! health scheduler, which re-invokes the coordinator on its next tick until
//! the retry ceiling is reached.

use std::sync::Arc;

use tracing::{debug, info, warn};

use tether_protocol::ConnectionStatus;
use tether_transport::Transport;

use crate::error::ReconnectError;
use crate::locks::KeyedLocks;
use crate::store::StateStore;
use crate::types::{ConnectionEvent, ConnectionState};

/// Who asked for a reconnect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    /// Health-check recovery; refused once the retry ceiling is reached.
    Automatic,
    /// Explicit user action; resets the retry counter first.
    User,
}

pub struct ReconnectCoordinator<T> {
    store: Arc<StateStore>,
    transport: Arc<T>,
    locks: Arc<KeyedLocks>,
}

impl<T: Transport> ReconnectCoordinator<T> {
    pub fn new(store: Arc<StateStore>, transport: Arc<T>, locks: Arc<KeyedLocks>) -> Self {
        Self {
            store,
            transport,
            locks,
        }
    }

    /// Makes one reconnect attempt for `id`.
    pub async fn reconnect(
        &self,
        id: &str,
        trigger: Trigger,
    ) -> Result<ConnectionState, ReconnectError> {
        let _guard = self.locks.lock(id).await;
        self.attempt(id, trigger).await
    }

    /// Body of [`reconnect`](Self::reconnect). Callers must hold the
    /// identity's lock.
    pub(crate) async fn attempt(
        &self,
        id: &str,
        trigger: Trigger,
    ) -> Result<ConnectionState, ReconnectError> {
        let mut state = self
            .store
            .get(id)
            .ok_or_else(|| ReconnectError::NotFound(id.to_owned()))?;

        match trigger {
            Trigger::User => {
                if let Some(reset) = self.store.reset_retries(id) {
                    state = reset;
                }
            }
            Trigger::Automatic if state.retries_exhausted() => {
                warn!(
                    connection = %id,
                    retries = state.retry_count,
                    "retry ceiling reached, not reconnecting"
                );
                self.store.publish(ConnectionEvent::RetryExhausted {
                    connection_id: id.to_owned(),
                    retries: state.retry_count,
                });
                return Err(ReconnectError::RetryExhausted {
                    connection_id: id.to_owned(),
                    retries: state.retry_count,
                });
            }
            Trigger::Automatic => {}
        }

        let attempt = state.retry_count + 1;
        self.store
            .set_status(id, ConnectionStatus::Reconnecting, None);
        self.store.publish(ConnectionEvent::Reconnecting {
            connection_id: id.to_owned(),
            attempt,
        });
        info!(
            connection = %id,
            address = %state.config.address(),
            attempt,
            ?trigger,
            "reconnecting"
        );

        // Release the stale session before opening a new one.
        if let Some(stale) = state.session()
            && let Err(e) = self.transport.disconnect(stale).await
        {
            debug!(connection = %id, error = %e, "stale session already gone");
        }

        match self.transport.connect(&state.config).await {
            Ok(session) => {
                let connected = self
                    .store
                    .mark_connected(id, session)
                    .ok_or_else(|| ReconnectError::NotFound(id.to_owned()))?;
                info!(connection = %id, attempt, "reconnected successfully");
                Ok(connected)
            }
            Err(e) => {
                let failed = self
                    .store
                    .set_status(id, ConnectionStatus::Error, Some(e.to_string()));
                warn!(connection = %id, attempt, error = %e, "reconnect attempt failed");

                if trigger == Trigger::Automatic
                    && let Some(failed) = failed.filter(ConnectionState::retries_exhausted)
                {
                    warn!(
                        connection = %id,
                        retries = failed.retry_count,
                        "automatic reconnect exhausted its retries"
                    );
                    self.store.publish(ConnectionEvent::RetryExhausted {
                        connection_id: id.to_owned(),
                        retries: failed.retry_count,
                    });
                }
                Err(e.into())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use tether_protocol::ConnectionConfig;
    use tether_transport::TransportError;
    use tether_transport::mock::ScriptedTransport;

    use super::*;
    use crate::types::StatePatch;

    fn setup() -> (
        Arc<StateStore>,
        Arc<ScriptedTransport>,
        ReconnectCoordinator<ScriptedTransport>,
    ) {
        let store = Arc::new(StateStore::new());
        let transport = Arc::new(ScriptedTransport::new());
        let coordinator = ReconnectCoordinator::new(
            Arc::clone(&store),
            Arc::clone(&transport),
            Arc::new(KeyedLocks::new()),
        );
        store
            .upsert(
                "c1",
                StatePatch::new().config(ConnectionConfig::new("c1", "web", "10.0.0.1", "root")),
            )
            .unwrap();
        (store, transport, coordinator)
    }

    #[tokio::test]
    async fn success_connects_and_resets() {
        let (store, transport, coordinator) = setup();
        store.set_status("c1", ConnectionStatus::Error, Some("old".into()));

        let state = coordinator.reconnect("c1", Trigger::Automatic).await.unwrap();
        assert_eq!(state.status, ConnectionStatus::Connected);
        assert_eq!(state.retry_count, 0);
        assert!(state.last_error.is_none());
        assert_eq!(state.session(), Some("session-c1"));
        assert_eq!(transport.calls().connect, 1);
    }

    #[tokio::test]
    async fn failure_records_error_and_increments() {
        let (store, transport, coordinator) = setup();
        transport.push_connect(Err("host unreachable"));

        let err = coordinator
            .reconnect("c1", Trigger::Automatic)
            .await
            .unwrap_err();
        assert_eq!(
            err,
            ReconnectError::Transport(TransportError::Connect("host unreachable".into()))
        );

        let state = store.get("c1").unwrap();
        assert_eq!(state.status, ConnectionStatus::Error);
        assert_eq!(state.retry_count, 1);
        assert!(state.last_error.unwrap().contains("host unreachable"));
    }

    #[tokio::test]
    async fn automatic_refused_at_ceiling() {
        let (store, transport, coordinator) = setup();
        for _ in 0..3 {
            store.set_status("c1", ConnectionStatus::Error, None);
        }
        let mut events = store.subscribe();

        let err = coordinator
            .reconnect("c1", Trigger::Automatic)
            .await
            .unwrap_err();
        assert!(matches!(err, ReconnectError::RetryExhausted { retries: 3, .. }));
        assert_eq!(transport.calls().connect, 0);
        assert!(matches!(
            events.try_recv().unwrap(),
            ConnectionEvent::RetryExhausted { retries: 3, .. }
        ));
    }

    #[tokio::test]
    async fn user_trigger_resets_ceiling() {
        let (store, transport, coordinator) = setup();
        for _ in 0..3 {
            store.set_status("c1", ConnectionStatus::Error, None);
        }
        transport.push_connect(Err("still down"));

        coordinator.reconnect("c1", Trigger::User).await.unwrap_err();
        let state = store.get("c1").unwrap();
        assert_eq!(state.retry_count, 1, "user reset then one failure");
        assert_eq!(transport.calls().connect, 1);
    }

    #[tokio::test]
    async fn unknown_identity_is_not_found() {
        let (_, transport, coordinator) = setup();
        let err = coordinator.reconnect("nope", Trigger::User).await.unwrap_err();
        assert_eq!(err, ReconnectError::NotFound("nope".into()));
        assert_eq!(transport.calls().connect, 0);
    }

    #[tokio::test]
    async fn emits_reconnecting_with_attempt_number() {
        let (store, transport, coordinator) = setup();
        store.set_status("c1", ConnectionStatus::Error, None);
        transport.push_connect(Err("down"));
        let mut events = store.subscribe();

        let _ = coordinator.reconnect("c1", Trigger::Automatic).await;

        let mut saw = false;
        while let Ok(ev) = events.try_recv() {
            if let ConnectionEvent::Reconnecting { attempt, .. } = ev {
                assert_eq!(attempt, 2);
                saw = true;
            }
        }
        assert!(saw);
    }

    #[tokio::test]
    async fn stale_session_is_released() {
        let (store, transport, coordinator) = setup();
        store.mark_connected("c1", ScriptedTransport::session_for("c1"));
        transport.set_alive("session-c1", true);

        coordinator.reconnect("c1", Trigger::User).await.unwrap();
        assert_eq!(transport.calls().disconnect, 1);
    }
}
