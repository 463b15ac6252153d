//! One-timer-per-identity registry.
//!
//! The registry owns every running poll task. Replacing or removing an entry
//! hands the old [`PollTimer`] back to the caller, who cancels it, so a
//! recurring task is never dropped on the floor while still running.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// A running poll task.
pub struct PollTimer {
    pub(crate) generation: u64,
    pub(crate) interval: Duration,
    pub(crate) cancel: CancellationToken,
    pub(crate) handle: JoinHandle<()>,
}

impl PollTimer {
    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Stops the task's future ticks and retry sleeps. A transport call
    /// already in flight is allowed to finish; its result is discarded.
    pub fn cancel(self) {
        self.cancel.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}

#[derive(Default)]
pub struct TimerRegistry {
    timers: Mutex<HashMap<String, PollTimer>>,
}

impl TimerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, PollTimer>> {
        self.timers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Installs `timer` for `id`, returning the one it displaced.
    pub fn replace(&self, id: &str, timer: PollTimer) -> Option<PollTimer> {
        self.lock().insert(id.to_owned(), timer)
    }

    pub fn take(&self, id: &str) -> Option<PollTimer> {
        self.lock().remove(id)
    }

    /// Removes the entry for `id` only if it is still the given generation,
    /// so a task retiring itself never evicts its replacement.
    pub fn take_if_current(&self, id: &str, generation: u64) -> Option<PollTimer> {
        let mut timers = self.lock();
        if timers.get(id).is_some_and(|t| t.generation == generation) {
            timers.remove(id)
        } else {
            None
        }
    }

    pub fn drain(&self) -> Vec<(String, PollTimer)> {
        self.lock().drain().collect()
    }

    /// Replaces every entry with `restart(id)` under a single lock, cancelling
    /// the old timers. No identity is dropped and no caller sees a partial
    /// set.
    pub fn restart_all(&self, mut restart: impl FnMut(&str) -> PollTimer) -> usize {
        let mut timers = self.lock();
        for (id, timer) in timers.iter_mut() {
            let old = std::mem::replace(timer, restart(id));
            old.cancel();
        }
        timers.len()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.lock().contains_key(id)
    }

    pub fn interval_of(&self, id: &str) -> Option<Duration> {
        self.lock().get(id).map(PollTimer::interval)
    }

    /// Identities with an active timer, sorted.
    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.lock().keys().cloned().collect();
        ids.sort_unstable();
        ids
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn timer(generation: u64, interval: Duration) -> (PollTimer, CancellationToken) {
        let cancel = CancellationToken::new();
        let c = cancel.clone();
        let handle = tokio::spawn(async move { c.cancelled().await });
        (
            PollTimer {
                generation,
                interval,
                cancel: cancel.clone(),
                handle,
            },
            cancel,
        )
    }

    #[tokio::test]
    async fn replace_returns_displaced_timer() {
        let reg = TimerRegistry::new();
        let (t1, c1) = timer(1, Duration::from_secs(5));
        let (t2, c2) = timer(2, Duration::from_secs(5));

        assert!(reg.replace("c1", t1).is_none());
        let old = reg.replace("c1", t2).expect("displaced");
        old.cancel();

        assert!(c1.is_cancelled());
        assert!(!c2.is_cancelled());
        assert_eq!(reg.len(), 1);
    }

    #[tokio::test]
    async fn take_if_current_ignores_stale_generation() {
        let reg = TimerRegistry::new();
        let (t, _) = timer(7, Duration::from_secs(5));
        reg.replace("c1", t);

        assert!(reg.take_if_current("c1", 6).is_none());
        assert!(reg.contains("c1"));
        assert!(reg.take_if_current("c1", 7).is_some());
        assert!(reg.is_empty());
    }

    #[tokio::test]
    async fn restart_all_keeps_every_identity() {
        let reg = TimerRegistry::new();
        let (a, ca) = timer(1, Duration::from_secs(5));
        let (b, cb) = timer(2, Duration::from_secs(5));
        reg.replace("a", a);
        reg.replace("b", b);

        let mut next = 10;
        let restarted = reg.restart_all(|_| {
            next += 1;
            timer(next, Duration::from_secs(1)).0
        });

        assert_eq!(restarted, 2);
        assert!(ca.is_cancelled() && cb.is_cancelled());
        assert_eq!(reg.ids(), ["a", "b"]);
        assert_eq!(reg.interval_of("a"), Some(Duration::from_secs(1)));
        assert_eq!(reg.interval_of("b"), Some(Duration::from_secs(1)));
    }

    #[tokio::test]
    async fn drain_empties() {
        let reg = TimerRegistry::new();
        let (a, _) = timer(1, Duration::from_secs(5));
        reg.replace("a", a);
        let drained = reg.drain();
        assert_eq!(drained.len(), 1);
        assert!(reg.is_empty());
    }
}
