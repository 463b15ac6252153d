//! Scripted in-memory transport for tests.
//!
//! Results are popped from per-call queues; when a queue is empty the
//! configured default applies. Every call is counted so tests can assert
//! exactly how often the supervisor reached the backend.

use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use tether_protocol::telemetry::{CpuInfo, MemoryInfo, NetworkInfo};
use tether_protocol::{ConnectionConfig, TelemetrySnapshot};

use crate::{SessionId, Transport, TransportError};

#[derive(Default)]
struct Script {
    connects: VecDeque<Result<(), String>>,
    connect_default_fails: bool,
    telemetry: VecDeque<Result<TelemetrySnapshot, String>>,
    telemetry_default_fails: bool,
    telemetry_delay: Option<Duration>,
    probe_delay: Option<Duration>,
    probes_in_flight: u32,
    max_probes_in_flight: u32,
    alive: HashMap<SessionId, bool>,
    calls: Calls,
}

/// Per-method call counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Calls {
    pub connect: u32,
    pub disconnect: u32,
    pub is_alive: u32,
    pub execute: u32,
    pub get_telemetry: u32,
}

/// Transport double driven by queued results.
///
/// A successful `connect` returns `"session-<config id>"` and marks that
/// session alive.
#[derive(Default)]
pub struct ScriptedTransport {
    script: Mutex<Script>,
}

impl ScriptedTransport {
    pub fn new() -> Self {
        Self::default()
    }

    fn with<R>(&self, f: impl FnOnce(&mut Script) -> R) -> R {
        let mut guard = self.script.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut guard)
    }

    /// Session id a successful connect of `config_id` produces.
    pub fn session_for(config_id: &str) -> SessionId {
        format!("session-{config_id}")
    }

    /// Queues the outcome of the next `connect` call.
    pub fn push_connect(&self, result: Result<(), &str>) {
        self.with(|s| s.connects.push_back(result.map_err(str::to_owned)));
    }

    /// Makes every unscripted `connect` fail.
    pub fn fail_connects(&self, fail: bool) {
        self.with(|s| s.connect_default_fails = fail);
    }

    /// Queues the outcome of the next `get_telemetry` call.
    pub fn push_telemetry(&self, result: Result<TelemetrySnapshot, &str>) {
        self.with(|s| s.telemetry.push_back(result.map_err(str::to_owned)));
    }

    /// Makes every unscripted `get_telemetry` fail.
    pub fn fail_telemetry(&self, fail: bool) {
        self.with(|s| s.telemetry_default_fails = fail);
    }

    /// Delays every `get_telemetry` call.
    pub fn set_telemetry_delay(&self, delay: Option<Duration>) {
        self.with(|s| s.telemetry_delay = delay);
    }

    /// Delays every `is_alive` call.
    pub fn set_probe_delay(&self, delay: Option<Duration>) {
        self.with(|s| s.probe_delay = delay);
    }

    /// Highest number of `is_alive` calls seen running at once.
    pub fn max_concurrent_probes(&self) -> u32 {
        self.with(|s| s.max_probes_in_flight)
    }

    /// Forces the liveness of a session.
    pub fn set_alive(&self, session: &str, alive: bool) {
        self.with(|s| {
            s.alive.insert(session.to_owned(), alive);
        });
    }

    pub fn calls(&self) -> Calls {
        self.with(|s| s.calls)
    }
}

/// A plausible snapshot for tests.
pub fn sample_snapshot(usage: f64) -> TelemetrySnapshot {
    TelemetrySnapshot {
        cpu: CpuInfo {
            model: "Test CPU".into(),
            cores: 4,
            usage,
            frequency: Some(2400.0),
            temperature: None,
        },
        memory: MemoryInfo {
            total: 8192,
            used: 2048,
            free: 6144,
            usage: 25.0,
            swap: None,
        },
        storage: Vec::new(),
        network: NetworkInfo::default(),
        timestamp: chrono::Utc::now(),
    }
}

impl Transport for ScriptedTransport {
    async fn connect(&self, config: &ConnectionConfig) -> Result<SessionId, TransportError> {
        let session = Self::session_for(&config.id);
        self.with(|s| {
            s.calls.connect += 1;
            let outcome = s.connects.pop_front().unwrap_or(if s.connect_default_fails {
                Err("connection refused".to_owned())
            } else {
                Ok(())
            });
            match outcome {
                Ok(()) => {
                    s.alive.insert(session.clone(), true);
                    Ok(session)
                }
                Err(e) => Err(TransportError::Connect(e)),
            }
        })
    }

    async fn disconnect(&self, session: &str) -> Result<(), TransportError> {
        self.with(|s| {
            s.calls.disconnect += 1;
            match s.alive.remove(session) {
                Some(_) => Ok(()),
                None => Err(TransportError::SessionNotFound(session.to_owned())),
            }
        })
    }

    async fn is_alive(&self, session: &str) -> bool {
        let delay = self.with(|s| {
            s.calls.is_alive += 1;
            s.probes_in_flight += 1;
            s.max_probes_in_flight = s.max_probes_in_flight.max(s.probes_in_flight);
            s.probe_delay
        });
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.with(|s| {
            s.probes_in_flight -= 1;
            s.alive.get(session).copied().unwrap_or(false)
        })
    }

    async fn execute(&self, session: &str, command: &str) -> Result<String, TransportError> {
        self.with(|s| {
            s.calls.execute += 1;
            if s.alive.get(session).copied().unwrap_or(false) {
                Ok(format!("{command}\n"))
            } else {
                Err(TransportError::SessionNotFound(session.to_owned()))
            }
        })
    }

    async fn get_telemetry(&self, _session: &str) -> Result<TelemetrySnapshot, TransportError> {
        let (delay, outcome) = self.with(|s| {
            s.calls.get_telemetry += 1;
            let outcome = s.telemetry.pop_front().unwrap_or_else(|| {
                if s.telemetry_default_fails {
                    Err("collector timed out".to_owned())
                } else {
                    Ok(sample_snapshot(10.0))
                }
            });
            (s.telemetry_delay, outcome)
        });
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        outcome.map_err(TransportError::Telemetry)
    }
}
