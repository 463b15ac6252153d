//! Per-identity async locks.
//!
//! Lifecycle operations (connect, disconnect, reconnect, health probes) hold
//! the lock for their identity across transport calls, so two of them never
//! interleave writes for the same connection. Different identities never
//! contend.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::OwnedMutexGuard;

#[derive(Default)]
pub struct KeyedLocks {
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl KeyedLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Waits for exclusive access to `key`.
    pub async fn lock(&self, key: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
            Arc::clone(locks.entry(key.to_owned()).or_default())
        };
        lock.lock_owned().await
    }

    /// Drops the lock for `key` when nobody holds or waits on it.
    pub fn forget(&self, key: &str) {
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        if locks.get(key).is_some_and(|l| Arc::strong_count(l) == 1) {
            locks.remove(key);
        }
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.locks.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn same_key_is_exclusive() {
        let locks = Arc::new(KeyedLocks::new());
        let guard = locks.lock("c1").await;

        let l = Arc::clone(&locks);
        let waiter = tokio::spawn(async move {
            let _g = l.lock("c1").await;
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        drop(guard);
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter should acquire")
            .expect("no panic");
    }

    #[tokio::test]
    async fn distinct_keys_do_not_contend() {
        let locks = KeyedLocks::new();
        let _a = locks.lock("c1").await;
        tokio::time::timeout(Duration::from_millis(100), locks.lock("c2"))
            .await
            .expect("other key must be free");
    }

    #[tokio::test]
    async fn forget_skips_held_locks() {
        let locks = KeyedLocks::new();
        let guard = locks.lock("c1").await;
        locks.forget("c1");
        assert_eq!(locks.len(), 1);

        drop(guard);
        locks.forget("c1");
        assert_eq!(locks.len(), 0);
    }
}
