//! Per-connection telemetry poller.
//!
//! Every polled identity gets its own task ticking at the poll interval.
//! A tick probes liveness, fetches a snapshot, and on failure retries inline
//! with [`BackoffPolicy`] delays. Unlike reconnects, these retries are
//! bursty: they all happen within one cycle and the outer tick carries on at
//! its normal pace whatever the outcome.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use tether_connection::StateStore;
use tether_protocol::ConnectionStatus;
use tether_transport::{Transport, TransportError};

use crate::backoff::BackoffPolicy;
use crate::pool::SnapshotPool;
use crate::timers::{PollTimer, TimerRegistry};

/// Shortest accepted poll interval.
pub const MIN_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Poller tuning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollerConfig {
    pub interval: Duration,
    /// Extra attempts after a failed fetch, within the same cycle.
    pub max_inline_retries: u32,
    pub backoff: BackoffPolicy,
    pub auto_refresh: bool,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(5),
            max_inline_retries: 3,
            backoff: BackoffPolicy::default(),
            auto_refresh: true,
        }
    }
}

/// Result of one fetch cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchOutcome {
    /// A snapshot was stored.
    Stored,
    /// Every attempt failed; the cached snapshot was dropped.
    Failed(TransportError),
    /// The connection is gone; the cached snapshot was dropped.
    Dead,
    /// Polling was stopped mid-cycle; nothing was written.
    Cancelled,
    /// The connection was disconnected or moved to another session while
    /// the fetch was in flight; the result was thrown away.
    Discarded,
}

struct Settings {
    interval: Duration,
    auto_refresh: bool,
}

struct Inner<T> {
    transport: Arc<T>,
    store: Arc<StateStore>,
    pool: Arc<SnapshotPool>,
    timers: TimerRegistry,
    backoff: BackoffPolicy,
    max_inline_retries: u32,
    settings: Mutex<Settings>,
    generation: AtomicU64,
}

pub struct TelemetryPoller<T> {
    inner: Arc<Inner<T>>,
}

impl<T: Transport> TelemetryPoller<T> {
    pub fn new(
        transport: Arc<T>,
        store: Arc<StateStore>,
        pool: Arc<SnapshotPool>,
        config: PollerConfig,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                transport,
                store,
                pool,
                timers: TimerRegistry::new(),
                backoff: config.backoff,
                max_inline_retries: config.max_inline_retries,
                settings: Mutex::new(Settings {
                    interval: config.interval.max(MIN_POLL_INTERVAL),
                    auto_refresh: config.auto_refresh,
                }),
                generation: AtomicU64::new(0),
            }),
        }
    }

    fn settings(&self) -> std::sync::MutexGuard<'_, Settings> {
        self.inner
            .settings
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Current global poll interval.
    pub fn interval(&self) -> Duration {
        self.settings().interval
    }

    pub fn auto_refresh(&self) -> bool {
        self.settings().auto_refresh
    }

    /// Starts polling `id` every `interval`, replacing any existing timer
    /// for it. Returns `false` when auto-refresh is disabled.
    pub fn start_polling(&self, id: &str, interval: Duration) -> bool {
        // Held until the timer is registered so a concurrent
        // `set_auto_refresh(false)` either blocks us or drains our timer.
        let settings = self.settings();
        if !settings.auto_refresh {
            debug!(connection = %id, "auto-refresh disabled, not polling");
            return false;
        }
        let interval = interval.max(MIN_POLL_INTERVAL);
        let timer = spawn_timer(&self.inner, id, interval);
        let replaced = self.inner.timers.replace(id, timer);
        drop(settings);

        if let Some(old) = replaced {
            old.cancel();
            debug!(connection = %id, "replaced existing poll timer");
        }
        info!(connection = %id, interval_ms = interval.as_millis() as u64, "telemetry polling started");
        true
    }

    /// Stops polling `id`, or every identity when `None`. Returns how many
    /// timers were cancelled.
    pub fn stop_polling(&self, id: Option<&str>) -> usize {
        match id {
            Some(id) => match self.inner.timers.take(id) {
                Some(timer) => {
                    timer.cancel();
                    info!(connection = %id, "telemetry polling stopped");
                    1
                }
                None => 0,
            },
            None => {
                let drained = self.inner.timers.drain();
                let count = drained.len();
                for (id, timer) in drained {
                    timer.cancel();
                    debug!(connection = %id, "telemetry polling stopped");
                }
                if count > 0 {
                    info!(count, "all telemetry polling stopped");
                }
                count
            }
        }
    }

    /// Changes the global interval and restarts every active timer at it.
    pub fn set_interval(&self, interval: Duration) {
        let interval = interval.max(MIN_POLL_INTERVAL);
        self.settings().interval = interval;
        let restarted = self
            .inner
            .timers
            .restart_all(|id| spawn_timer(&self.inner, id, interval));
        info!(
            interval_ms = interval.as_millis() as u64,
            restarted, "telemetry poll interval updated"
        );
    }

    /// Enables or disables automatic polling. Disabling stops every timer;
    /// enabling only allows future [`start_polling`](Self::start_polling)
    /// calls.
    pub fn set_auto_refresh(&self, enabled: bool) {
        self.settings().auto_refresh = enabled;
        if !enabled {
            self.stop_polling(None);
        }
        info!(enabled, "telemetry auto-refresh changed");
    }

    pub fn is_polling(&self, id: &str) -> bool {
        self.inner.timers.contains(id)
    }

    /// Identities currently polled, sorted.
    pub fn polled(&self) -> Vec<String> {
        self.inner.timers.ids()
    }

    pub fn timer_interval(&self, id: &str) -> Option<Duration> {
        self.inner.timers.interval_of(id)
    }

    /// Runs one fetch cycle for `id` right now, outside any timer.
    pub async fn refresh(&self, id: &str) -> FetchOutcome {
        self.inner.fetch_cycle(id, &CancellationToken::new()).await
    }
}

impl<T> Drop for TelemetryPoller<T> {
    fn drop(&mut self) {
        for (_, timer) in self.inner.timers.drain() {
            timer.cancel();
        }
    }
}

fn spawn_timer<T: Transport>(inner: &Arc<Inner<T>>, id: &str, interval: Duration) -> PollTimer {
    let generation = inner.generation.fetch_add(1, Ordering::Relaxed) + 1;
    let cancel = CancellationToken::new();
    let handle = tokio::spawn(poll_loop(
        Arc::clone(inner),
        id.to_owned(),
        interval,
        generation,
        cancel.clone(),
    ));
    PollTimer {
        generation,
        interval,
        cancel,
        handle,
    }
}

async fn poll_loop<T: Transport>(
    inner: Arc<Inner<T>>,
    id: String,
    interval: Duration,
    generation: u64,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // Skip the first immediate tick.
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        match inner.fetch_cycle(&id, &cancel).await {
            FetchOutcome::Dead => {
                if let Some(timer) = inner.timers.take_if_current(&id, generation) {
                    timer.cancel();
                }
                info!(connection = %id, "connection gone, telemetry polling stopped");
                break;
            }
            FetchOutcome::Cancelled => break,
            FetchOutcome::Stored | FetchOutcome::Failed(_) | FetchOutcome::Discarded => {}
        }
    }
    debug!(connection = %id, generation, "poll task exited");
}

impl<T: Transport> Inner<T> {
    async fn fetch_cycle(&self, id: &str, cancel: &CancellationToken) -> FetchOutcome {
        let Some(session) = self.store.get(id).and_then(|s| s.session_id) else {
            self.pool.remove(id);
            return FetchOutcome::Dead;
        };

        let alive = self.transport.is_alive(&session).await;
        if cancel.is_cancelled() {
            return FetchOutcome::Cancelled;
        }
        if !alive {
            self.pool.remove(id);
            return FetchOutcome::Dead;
        }

        let mut last_error = match self.fetch_once(id, &session, cancel).await {
            Ok(outcome) => return outcome,
            Err(e) => e,
        };
        warn!(connection = %id, error = %last_error, "telemetry fetch failed, retrying");

        for attempt in 0..self.max_inline_retries {
            let delay = self.backoff.delay_for_attempt(attempt);
            debug!(
                connection = %id,
                attempt = attempt + 1,
                max = self.max_inline_retries,
                delay_ms = delay.as_millis() as u64,
                "waiting before telemetry retry"
            );
            tokio::select! {
                _ = cancel.cancelled() => return FetchOutcome::Cancelled,
                _ = tokio::time::sleep(delay) => {}
            }

            match self.fetch_once(id, &session, cancel).await {
                Ok(outcome) => return outcome,
                Err(e) => {
                    debug!(connection = %id, attempt = attempt + 1, error = %e, "telemetry retry failed");
                    last_error = e;
                }
            }
        }

        warn!(
            connection = %id,
            retries = self.max_inline_retries,
            error = %last_error,
            "telemetry retries exhausted, dropping cached snapshot"
        );
        self.pool.remove(id);
        self.pool.record_error(id, last_error.to_string());
        FetchOutcome::Failed(last_error)
    }

    /// One `get_telemetry` call. `Ok` carries a terminal outcome; `Err` means
    /// the caller may retry.
    async fn fetch_once(
        &self,
        id: &str,
        session: &str,
        cancel: &CancellationToken,
    ) -> Result<FetchOutcome, TransportError> {
        let result = self.transport.get_telemetry(session).await;
        if cancel.is_cancelled() {
            return Ok(FetchOutcome::Cancelled);
        }
        match result {
            Ok(snapshot) => {
                let stored = self.pool.store_if(id, snapshot, || {
                    !cancel.is_cancelled()
                        && self.store.get(id).is_some_and(|s| {
                            s.status == ConnectionStatus::Connected && s.session() == Some(session)
                        })
                });
                if stored {
                    Ok(FetchOutcome::Stored)
                } else if cancel.is_cancelled() {
                    Ok(FetchOutcome::Cancelled)
                } else {
                    debug!(connection = %id, "connection changed during fetch, snapshot discarded");
                    Ok(FetchOutcome::Discarded)
                }
            }
            Err(TransportError::SessionNotFound(_)) => {
                self.pool.remove(id);
                Ok(FetchOutcome::Dead)
            }
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use tether_connection::StatePatch;
    use tether_protocol::ConnectionConfig;
    use tether_transport::mock::{ScriptedTransport, sample_snapshot};

    use super::*;

    struct Fixture {
        store: Arc<StateStore>,
        transport: Arc<ScriptedTransport>,
        pool: Arc<SnapshotPool>,
        poller: TelemetryPoller<ScriptedTransport>,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(StateStore::new());
        let transport = Arc::new(ScriptedTransport::new());
        let pool = Arc::new(SnapshotPool::new());
        let poller = TelemetryPoller::new(
            Arc::clone(&transport),
            Arc::clone(&store),
            Arc::clone(&pool),
            PollerConfig::default(),
        );
        Fixture {
            store,
            transport,
            pool,
            poller,
        }
    }

    fn connect(f: &Fixture, id: &str) {
        f.store
            .upsert(
                id,
                StatePatch::new().config(ConnectionConfig::new(id, "web", "10.0.0.1", "root")),
            )
            .unwrap();
        let session = ScriptedTransport::session_for(id);
        f.transport.set_alive(&session, true);
        f.store.mark_connected(id, session);
    }

    const FIVE: Duration = Duration::from_secs(5);

    #[tokio::test(start_paused = true)]
    async fn fetch_success_stores_snapshot() {
        let f = fixture();
        connect(&f, "c1");
        f.transport.push_telemetry(Ok(sample_snapshot(55.0)));

        assert_eq!(f.poller.refresh("c1").await, FetchOutcome::Stored);
        assert_eq!(f.pool.get("c1").unwrap().snapshot.cpu.usage, 55.0);
    }

    #[tokio::test(start_paused = true)]
    async fn succeeds_on_third_inline_attempt() {
        let f = fixture();
        connect(&f, "c1");
        f.transport.push_telemetry(Err("timeout"));
        f.transport.push_telemetry(Err("timeout"));
        f.transport.push_telemetry(Ok(sample_snapshot(77.0)));

        let started = tokio::time::Instant::now();
        assert_eq!(f.poller.refresh("c1").await, FetchOutcome::Stored);

        assert_eq!(f.pool.get("c1").unwrap().snapshot.cpu.usage, 77.0);
        assert!(f.pool.last_error("c1").is_none());
        assert_eq!(f.transport.calls().get_telemetry, 3);
        // Slept 1s then 2s between the three attempts.
        assert_eq!(started.elapsed(), Duration::from_secs(3));
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_retries_drop_snapshot() {
        let f = fixture();
        connect(&f, "c1");
        f.pool.store("c1", sample_snapshot(1.0));
        f.transport.fail_telemetry(true);

        let outcome = f.poller.refresh("c1").await;
        assert!(matches!(outcome, FetchOutcome::Failed(TransportError::Telemetry(_))));
        assert!(f.pool.get("c1").is_none());
        assert!(f.pool.last_error("c1").is_some());
        // One initial attempt plus three inline retries.
        assert_eq!(f.transport.calls().get_telemetry, 4);
    }

    #[tokio::test(start_paused = true)]
    async fn dead_connection_is_not_fetched() {
        let f = fixture();
        connect(&f, "c1");
        f.pool.store("c1", sample_snapshot(1.0));
        f.transport.set_alive("session-c1", false);

        assert_eq!(f.poller.refresh("c1").await, FetchOutcome::Dead);
        assert!(f.pool.get("c1").is_none());
        assert_eq!(f.transport.calls().get_telemetry, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn unknown_identity_is_dead() {
        let f = fixture();
        assert_eq!(f.poller.refresh("ghost").await, FetchOutcome::Dead);
    }

    #[tokio::test(start_paused = true)]
    async fn double_start_keeps_one_timer() {
        let f = fixture();
        connect(&f, "c1");

        assert!(f.poller.start_polling("c1", FIVE));
        assert!(f.poller.start_polling("c1", FIVE));
        assert_eq!(f.poller.polled(), ["c1"]);

        tokio::time::sleep(Duration::from_secs(16)).await;
        // Ticks at 5s, 10s, 15s from a single cadence.
        assert_eq!(f.transport.calls().get_telemetry, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn outer_timer_survives_failed_cycles() {
        let f = fixture();
        connect(&f, "c1");
        f.transport.fail_telemetry(true);
        f.poller.start_polling("c1", Duration::from_secs(20));

        // First cycle: 20s tick, retries end at 27s. Second tick at 40s.
        tokio::time::sleep(Duration::from_secs(41)).await;
        assert!(f.poller.is_polling("c1"));
        assert_eq!(f.transport.calls().get_telemetry, 5);
        assert!(f.pool.get("c1").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn dead_connection_stops_own_timer() {
        let f = fixture();
        connect(&f, "c1");
        f.poller.start_polling("c1", FIVE);
        f.transport.set_alive("session-c1", false);

        tokio::time::sleep(Duration::from_secs(6)).await;
        assert!(!f.poller.is_polling("c1"));

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(f.transport.calls().is_alive, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_cancels_pending_retries() {
        let f = fixture();
        connect(&f, "c1");
        f.transport.fail_telemetry(true);
        f.poller.start_polling("c1", FIVE);

        // First attempt fails at 5s; the 1s retry sleep is pending.
        tokio::time::sleep(Duration::from_millis(5500)).await;
        assert_eq!(f.poller.stop_polling(Some("c1")), 1);

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(f.transport.calls().get_telemetry, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn in_flight_result_discarded_after_stop() {
        let f = fixture();
        connect(&f, "c1");
        f.transport.set_telemetry_delay(Some(Duration::from_secs(2)));
        f.poller.start_polling("c1", FIVE);

        // Fetch starts at 5s and would land at 7s.
        tokio::time::sleep(Duration::from_secs(6)).await;
        f.poller.stop_polling(Some("c1"));

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert!(f.pool.get("c1").is_none());
        assert_eq!(f.transport.calls().get_telemetry, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn disconnect_during_fetch_discards_result() {
        let f = fixture();
        connect(&f, "c1");
        f.transport.set_telemetry_delay(Some(Duration::from_secs(2)));
        f.transport.push_telemetry(Ok(sample_snapshot(9.0)));

        let (outcome, _) = tokio::join!(f.poller.refresh("c1"), async {
            tokio::time::sleep(Duration::from_millis(500)).await;
            f.store.mark_disconnected("c1");
        });

        assert_eq!(outcome, FetchOutcome::Discarded);
        assert!(f.pool.get("c1").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn session_swap_during_fetch_discards_result() {
        let f = fixture();
        connect(&f, "c1");
        f.transport.set_telemetry_delay(Some(Duration::from_secs(2)));
        f.transport.push_telemetry(Ok(sample_snapshot(9.0)));

        let (outcome, _) = tokio::join!(f.poller.refresh("c1"), async {
            tokio::time::sleep(Duration::from_millis(500)).await;
            f.store.mark_connected("c1", "session-c1-b".to_owned());
        });

        assert_eq!(outcome, FetchOutcome::Discarded);
        assert!(f.pool.get("c1").is_none());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn disabling_auto_refresh_beats_concurrent_start() {
        let f = fixture();
        connect(&f, "c1");
        let handle = tokio::runtime::Handle::current();

        for _ in 0..200 {
            f.poller.set_auto_refresh(true);
            let barrier = std::sync::Barrier::new(2);
            std::thread::scope(|scope| {
                scope.spawn(|| {
                    let _rt = handle.enter();
                    barrier.wait();
                    f.poller.start_polling("c1", FIVE);
                });
                scope.spawn(|| {
                    barrier.wait();
                    f.poller.set_auto_refresh(false);
                });
            });
            assert!(f.poller.polled().is_empty());
        }
    }

    #[tokio::test(start_paused = true)]
    async fn set_interval_restarts_every_timer() {
        let f = fixture();
        connect(&f, "c1");
        connect(&f, "c2");
        f.poller.start_polling("c1", FIVE);
        f.poller.start_polling("c2", FIVE);

        f.poller.set_interval(Duration::from_secs(10));
        assert_eq!(f.poller.interval(), Duration::from_secs(10));
        assert_eq!(f.poller.polled(), ["c1", "c2"]);
        assert_eq!(f.poller.timer_interval("c1"), Some(Duration::from_secs(10)));

        tokio::time::sleep(Duration::from_secs(25)).await;
        // Two ticks each at the new cadence, none from the old one.
        assert_eq!(f.transport.calls().get_telemetry, 4);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_all_and_noop_stop() {
        let f = fixture();
        connect(&f, "c1");
        connect(&f, "c2");
        f.poller.start_polling("c1", FIVE);
        f.poller.start_polling("c2", FIVE);

        assert_eq!(f.poller.stop_polling(Some("missing")), 0);
        assert_eq!(f.poller.stop_polling(None), 2);
        assert!(f.poller.polled().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn auto_refresh_gates_polling() {
        let f = fixture();
        connect(&f, "c1");
        f.poller.start_polling("c1", FIVE);

        f.poller.set_auto_refresh(false);
        assert!(!f.poller.is_polling("c1"));
        assert!(!f.poller.start_polling("c1", FIVE));

        f.poller.set_auto_refresh(true);
        assert!(f.poller.start_polling("c1", FIVE));
    }

    #[tokio::test(start_paused = true)]
    async fn interval_is_clamped() {
        let f = fixture();
        connect(&f, "c1");
        f.poller.start_polling("c1", Duration::from_millis(10));
        assert_eq!(f.poller.timer_interval("c1"), Some(MIN_POLL_INTERVAL));
    }
}
