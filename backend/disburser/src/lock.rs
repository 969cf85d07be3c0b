use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex, PoisonError};

use tokio::sync::{Mutex, OwnedMutexGuard};

type LockTable = HashMap<String, Arc<Mutex<()>>>;

/// In-process locks keyed by string, one mutex per key.
///
/// Serializes work that spans several store calls and network round trips
/// (finalizing a pool, driving one disbursement). Unrelated keys never wait
/// on each other. Cloning shares the underlying table.
///
/// An entry lives only while someone holds or waits for it, so the table
/// stays as small as the number of keys in use.
#[derive(Clone, Default)]
pub struct KeyedLocks {
    locks: Arc<StdMutex<LockTable>>,
}

/// Exclusive hold on one key of a [`KeyedLocks`].
pub struct KeyGuard {
    guard: Option<OwnedMutexGuard<()>>,
    key: String,
    locks: Arc<StdMutex<LockTable>>,
}

impl KeyedLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive ownership of `key`. Released when the guard drops.
    pub async fn acquire(&self, key: &str) -> KeyGuard {
        let lock = self.lock_for(key);
        KeyGuard {
            guard: Some(lock.lock_owned().await),
            key: key.to_string(),
            locks: self.locks.clone(),
        }
    }

    fn lock_for(&self, key: &str) -> Arc<Mutex<()>> {
        // The table mutex is never held across an await.
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        locks
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.locks.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}

impl Drop for KeyGuard {
    fn drop(&mut self) {
        drop(self.guard.take());

        // Clones are handed out under the table mutex, so a count of one
        // means nobody else holds or waits for this key.
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        if locks
            .get(&self.key)
            .is_some_and(|lock| Arc::strong_count(lock) == 1)
        {
            locks.remove(&self.key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn same_key_is_exclusive() {
        let locks = KeyedLocks::new();
        let guard = locks.acquire("P1").await;

        let contender = locks.clone();
        let waiting = tokio::spawn(async move {
            let _g = contender.acquire("P1").await;
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!waiting.is_finished());

        drop(guard);
        tokio::time::timeout(Duration::from_secs(1), waiting)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn different_keys_do_not_contend() {
        let locks = KeyedLocks::new();
        let _p1 = locks.acquire("P1").await;
        tokio::time::timeout(Duration::from_millis(100), locks.acquire("P2"))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn released_keys_leave_no_entries() {
        let locks = KeyedLocks::new();
        for n in 0..1_000 {
            let _guard = locks.acquire(&format!("P1/TX{n}")).await;
        }
        assert_eq!(locks.len(), 0);
    }

    #[tokio::test]
    async fn entry_survives_while_a_waiter_is_queued() {
        let locks = KeyedLocks::new();
        let guard = locks.acquire("P1").await;

        let contender = locks.clone();
        let waiting = tokio::spawn(async move {
            let _g = contender.acquire("P1").await;
            tokio::time::sleep(Duration::from_millis(20)).await;
        });
        tokio::time::sleep(Duration::from_millis(20)).await;

        drop(guard);
        assert_eq!(locks.len(), 1);

        waiting.await.unwrap();
        assert_eq!(locks.len(), 0);
    }
}
