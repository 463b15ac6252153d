//! The supervisor facade.
//!
//! Owns the state store, health scheduler, reconnect coordinator, telemetry
//! poller and tab registry, and exposes the read views and user commands
//! the presentation layer drives. Construct one per process and share it by
//! reference; there is no global instance.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use futures_util::future::join_all;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use tether_connection::{
    ConnectionEvent, ConnectionState, HealthScheduler, KeyedLocks, ReconnectCoordinator,
    StatePatch, StateStore, Trigger,
};
use tether_protocol::{ConnectionConfig, ConnectionStatus};
use tether_sessions::{TabInfo, TabRegistry};
use tether_telemetry::{FetchOutcome, PooledSnapshot, SnapshotPool, TelemetryPoller};
use tether_transport::{Transport, TransportError};

use crate::config::SupervisorConfig;
use crate::error::SupervisorError;

pub struct Supervisor<T: Transport> {
    config: SupervisorConfig,
    store: Arc<StateStore>,
    transport: Arc<T>,
    locks: Arc<KeyedLocks>,
    coordinator: Arc<ReconnectCoordinator<T>>,
    health: Arc<HealthScheduler<T>>,
    pool: Arc<SnapshotPool>,
    poller: Arc<TelemetryPoller<T>>,
    tabs: Arc<TabRegistry>,
    pump: Mutex<Option<CancellationToken>>,
}

impl<T: Transport> Supervisor<T> {
    pub fn new(transport: Arc<T>, config: SupervisorConfig) -> Self {
        let store = Arc::new(StateStore::with_max_retries(config.max_retries));
        let locks = Arc::new(KeyedLocks::new());
        let coordinator = Arc::new(ReconnectCoordinator::new(
            Arc::clone(&store),
            Arc::clone(&transport),
            Arc::clone(&locks),
        ));
        let health = Arc::new(HealthScheduler::new(
            Arc::clone(&store),
            Arc::clone(&transport),
            Arc::clone(&coordinator),
            Arc::clone(&locks),
            config.health_check_interval(),
        ));
        let pool = Arc::new(SnapshotPool::new());
        let poller = Arc::new(TelemetryPoller::new(
            Arc::clone(&transport),
            Arc::clone(&store),
            Arc::clone(&pool),
            config.poller(),
        ));

        Self {
            config,
            store,
            transport,
            locks,
            coordinator,
            health,
            pool,
            poller,
            tabs: Arc::new(TabRegistry::new()),
            pump: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &SupervisorConfig {
        &self.config
    }

    // -- lifecycle ----------------------------------------------------------

    /// Starts the health scheduler and the event pump. Idempotent.
    pub fn start(&self) {
        self.health.start();

        let mut pump = self.pump.lock().unwrap_or_else(PoisonError::into_inner);
        if pump.is_none() {
            let cancel = CancellationToken::new();
            let events = self.store.subscribe();
            let worker = EventPump {
                store: Arc::clone(&self.store),
                pool: Arc::clone(&self.pool),
                poller: Arc::clone(&self.poller),
                tabs: Arc::clone(&self.tabs),
            };
            tokio::spawn(worker.run(events, cancel.clone()));
            *pump = Some(cancel);
        }
        info!("supervisor started");
    }

    pub fn is_running(&self) -> bool {
        self.health.is_running()
    }

    /// Stops background work and disconnects every live session.
    pub async fn shutdown(&self) {
        self.health.stop();
        let pump = self
            .pump
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(pump) = pump {
            pump.cancel();
        }
        self.poller.stop_polling(None);
        let disconnected = self.disconnect_all().await;
        info!(disconnected, "supervisor shut down");
    }

    // -- read views ---------------------------------------------------------

    pub fn get_state(&self, id: &str) -> Option<ConnectionState> {
        self.store.get(id)
    }

    pub fn list_states(&self) -> Vec<ConnectionState> {
        self.store.all()
    }

    pub fn list_connected(&self) -> Vec<ConnectionState> {
        self.store.with_status(ConnectionStatus::Connected)
    }

    pub fn get_snapshot(&self, id: &str) -> Option<PooledSnapshot> {
        self.pool.get(id)
    }

    /// Error of the last telemetry cycle that gave up, if no good snapshot
    /// arrived since.
    pub fn telemetry_error(&self, id: &str) -> Option<String> {
        self.pool.last_error(id)
    }

    pub fn tabs(&self) -> Vec<TabInfo> {
        self.tabs.list()
    }

    pub fn active_tab(&self) -> Option<TabInfo> {
        self.tabs.active()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.store.subscribe()
    }

    pub fn is_polling(&self, id: &str) -> bool {
        self.poller.is_polling(id)
    }

    pub fn poll_interval(&self) -> Duration {
        self.poller.interval()
    }

    // -- connection commands ------------------------------------------------

    /// Registers profiles without connecting them. Invalid profiles are
    /// skipped. Returns how many were loaded.
    pub fn load_profiles(&self, configs: impl IntoIterator<Item = ConnectionConfig>) -> usize {
        let mut loaded = 0;
        for config in configs {
            if let Err(e) = config.validate() {
                warn!(connection = %config.id, error = %e, "skipping invalid profile");
                continue;
            }
            let id = config.id.clone();
            match self.store.upsert(&id, StatePatch::new().config(config)) {
                Ok(_) => loaded += 1,
                Err(e) => warn!(connection = %id, error = %e, "failed to load profile"),
            }
        }
        info!(loaded, "profiles loaded");
        loaded
    }

    /// Opens a session for `config`, creating or updating its state, and
    /// binds it to a tab that becomes active.
    pub async fn connect(
        &self,
        config: ConnectionConfig,
    ) -> Result<ConnectionState, SupervisorError> {
        config.validate()?;
        let id = config.id.clone();
        let title = config.name.clone();
        let _guard = self.locks.lock(&id).await;

        let previous = self.store.get(&id).and_then(|s| s.session_id);
        let state = self.store.upsert(
            &id,
            StatePatch::new()
                .config(config)
                .retry_count(0)
                .session_id(None),
        )?;
        if let Some(stale) = previous
            && let Err(e) = self.transport.disconnect(&stale).await
        {
            debug!(connection = %id, error = %e, "stale session already gone");
        }

        self.store
            .set_status(&id, ConnectionStatus::Connecting, None);
        info!(connection = %id, address = %state.config.address(), "connecting");

        match self.transport.connect(&state.config).await {
            Ok(session) => {
                let connected = self
                    .store
                    .mark_connected(&id, session)
                    .ok_or_else(|| SupervisorError::NotFound(id.clone()))?;
                self.tabs.open(&id, &title);
                self.follow_active_tab();
                info!(connection = %id, "connected");
                Ok(connected)
            }
            Err(e) => {
                self.store
                    .set_status(&id, ConnectionStatus::Error, Some(e.to_string()));
                warn!(connection = %id, error = %e, "connect failed");
                Err(e.into())
            }
        }
    }

    /// Tears down the session for `id`. Polling stops and the cached
    /// snapshot is dropped before the transport is asked to disconnect.
    pub async fn disconnect(&self, id: &str) -> Result<(), SupervisorError> {
        let _guard = self.locks.lock(id).await;
        self.disconnect_locked(id).await
    }

    async fn disconnect_locked(&self, id: &str) -> Result<(), SupervisorError> {
        let state = self
            .store
            .get(id)
            .ok_or_else(|| SupervisorError::NotFound(id.to_owned()))?;

        // Marking before forgetting means a fetch still in flight sees the
        // state change when it goes to store, and drops its result.
        self.poller.stop_polling(Some(id));
        self.store.mark_disconnected(id);
        self.pool.forget(id);

        let result = match state.session() {
            Some(session) => self.transport.disconnect(session).await,
            None => Ok(()),
        };

        match result {
            Ok(()) | Err(TransportError::SessionNotFound(_)) => {
                info!(connection = %id, "disconnected");
                Ok(())
            }
            Err(e) => {
                warn!(connection = %id, error = %e, "transport disconnect failed");
                Err(e.into())
            }
        }
    }

    /// Disconnects every connection that is not already down. Returns how
    /// many disconnected cleanly.
    pub async fn disconnect_all(&self) -> usize {
        let ids: Vec<String> = self
            .store
            .all()
            .into_iter()
            .filter(|s| s.session_id.is_some() || s.status != ConnectionStatus::Disconnected)
            .map(|s| s.id)
            .collect();

        join_all(ids.iter().map(|id| self.disconnect(id)))
            .await
            .into_iter()
            .filter(Result::is_ok)
            .count()
    }

    /// User-initiated reconnect: resets the retry counter and makes one
    /// attempt.
    pub async fn reconnect(&self, id: &str) -> Result<ConnectionState, SupervisorError> {
        let state = self.coordinator.reconnect(id, Trigger::User).await?;
        self.follow_active_tab();
        Ok(state)
    }

    /// Disconnects `id`, deletes its state and closes its tabs.
    pub async fn remove_connection(&self, id: &str) -> Result<(), SupervisorError> {
        let result = {
            let _guard = self.locks.lock(id).await;
            match self.disconnect_locked(id).await {
                Err(e @ SupervisorError::NotFound(_)) => Err(e),
                outcome => {
                    if let Err(e) = outcome {
                        warn!(connection = %id, error = %e, "removing connection anyway");
                    }
                    self.store.remove(id);
                    self.pool.forget(id);
                    Ok(())
                }
            }
        };
        self.locks.forget(id);
        result?;
        self.tabs.remove_for_connection(id);
        self.follow_active_tab();
        info!(connection = %id, "connection removed");
        Ok(())
    }

    /// Runs `command` on the live session of `id`.
    pub async fn execute(&self, id: &str, command: &str) -> Result<String, SupervisorError> {
        let state = self
            .store
            .get(id)
            .ok_or_else(|| SupervisorError::NotFound(id.to_owned()))?;
        let session = state
            .session()
            .filter(|_| state.status == ConnectionStatus::Connected)
            .ok_or_else(|| SupervisorError::NotConnected(id.to_owned()))?;
        Ok(self.transport.execute(session, command).await?)
    }

    // -- telemetry commands -------------------------------------------------

    /// Starts polling `id` at the current interval. Returns `false` when
    /// auto-refresh is disabled.
    pub fn start_polling(&self, id: &str) -> Result<bool, SupervisorError> {
        if !self.store.contains(id) {
            return Err(SupervisorError::NotFound(id.to_owned()));
        }
        Ok(self.poller.start_polling(id, self.poller.interval()))
    }

    /// Stops polling `id`, or everything when `None`.
    pub fn stop_polling(&self, id: Option<&str>) -> usize {
        self.poller.stop_polling(id)
    }

    pub fn set_poll_interval(&self, interval: Duration) {
        self.poller.set_interval(interval);
    }

    /// Enabling resumes polling for the active tab's connection.
    pub fn set_auto_refresh(&self, enabled: bool) {
        self.poller.set_auto_refresh(enabled);
        if enabled {
            self.follow_active_tab();
        }
    }

    /// One telemetry fetch cycle for `id`, right now.
    pub async fn refresh(&self, id: &str) -> Result<FetchOutcome, SupervisorError> {
        if !self.store.contains(id) {
            return Err(SupervisorError::NotFound(id.to_owned()));
        }
        Ok(self.poller.refresh(id).await)
    }

    // -- tabs ---------------------------------------------------------------

    /// Activates `tab_id` and moves polling to its connection.
    pub fn select_tab(&self, tab_id: &str) -> Result<TabInfo, SupervisorError> {
        let tab = self.tabs.activate(tab_id)?;
        self.follow_active_tab();
        Ok(tab)
    }

    pub fn close_tab(&self, tab_id: &str) -> Result<TabInfo, SupervisorError> {
        let tab = self.tabs.close(tab_id)?;
        self.follow_active_tab();
        Ok(tab)
    }

    /// Polls only the active tab's connection, and only while it is
    /// connected.
    fn follow_active_tab(&self) {
        let target = self
            .tabs
            .active()
            .map(|tab| tab.connection_id)
            .filter(|id| {
                self.store
                    .get(id)
                    .is_some_and(|s| s.status == ConnectionStatus::Connected)
            });

        for other in self.poller.polled() {
            if target.as_deref() != Some(other.as_str()) {
                self.poller.stop_polling(Some(other.as_str()));
            }
        }
        if let Some(id) = target
            && !self.poller.is_polling(&id)
        {
            self.poller.start_polling(&id, self.poller.interval());
        }
    }
}

impl<T: Transport> Drop for Supervisor<T> {
    fn drop(&mut self) {
        self.health.stop();
        if let Some(pump) = self
            .pump
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            pump.cancel();
        }
    }
}

/// Keeps telemetry in step with connection state changes made in the
/// background (health checks, automatic reconnects).
struct EventPump<T> {
    store: Arc<StateStore>,
    pool: Arc<SnapshotPool>,
    poller: Arc<TelemetryPoller<T>>,
    tabs: Arc<TabRegistry>,
}

impl<T: Transport> EventPump<T> {
    async fn run(self, mut events: broadcast::Receiver<ConnectionEvent>, cancel: CancellationToken) {
        loop {
            let event = tokio::select! {
                _ = cancel.cancelled() => break,
                event = events.recv() => event,
            };
            match event {
                Ok(event) => self.handle(&event),
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "event pump lagged, resyncing");
                    self.resync();
                }
                Err(RecvError::Closed) => break,
            }
        }
        debug!("event pump stopped");
    }

    fn handle(&self, event: &ConnectionEvent) {
        match event {
            ConnectionEvent::StateChanged {
                connection_id,
                status,
                ..
            } => {
                if status.is_gone() {
                    self.detach(connection_id);
                } else if *status == ConnectionStatus::Connected {
                    self.resume(connection_id);
                }
            }
            ConnectionEvent::Removed { connection_id } => self.detach(connection_id),
            ConnectionEvent::Reconnecting { .. } | ConnectionEvent::RetryExhausted { .. } => {}
        }
    }

    /// Stops polling and drops the snapshot, unless the connection has come
    /// back since the event was sent.
    fn detach(&self, id: &str) {
        let gone = self.store.get(id).is_none_or(|s| s.status.is_gone());
        if !gone {
            return;
        }
        let stopped = self.poller.stop_polling(Some(id));
        let dropped = self.pool.remove(id);
        if stopped > 0 || dropped {
            debug!(connection = %id, "connection down, telemetry detached");
        }
    }

    /// Restarts polling after a background reconnect if the connection is
    /// the one on screen.
    fn resume(&self, id: &str) {
        let connected = self
            .store
            .get(id)
            .is_some_and(|s| s.status == ConnectionStatus::Connected);
        let on_screen = self.tabs.active().is_some_and(|t| t.connection_id == id);
        if connected
            && on_screen
            && !self.poller.is_polling(id)
            && self.poller.start_polling(id, self.poller.interval())
        {
            debug!(connection = %id, "connection back, telemetry resumed");
        }
    }

    fn resync(&self) {
        for state in self.store.all() {
            if state.status.is_gone() {
                self.detach(&state.id);
            } else if state.status == ConnectionStatus::Connected {
                self.resume(&state.id);
            }
        }
    }
}
