use std::{
    collections::HashMap,
    hash::Hash,
    sync::{Arc, Mutex},
};

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// A table of async locks keyed by value.
///
/// Used to serialize work on the same machine handle, machine name or download basename while
/// letting work on different keys run in parallel. Entries nobody holds or waits on are pruned on
/// the next acquisition.
#[derive(Debug)]
pub struct KeyedLocks<K> {
    table: Mutex<HashMap<K, Arc<AsyncMutex<()>>>>,
}

/// Holds the lock of one key until dropped.
#[derive(Debug)]
pub struct KeyedGuard {
    _guard: OwnedMutexGuard<()>,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl<K> KeyedLocks<K>
where
    K: Eq + Hash + Clone,
{
    /// Creates an empty lock table.
    pub fn new() -> Self {
        Self {
            table: Mutex::new(HashMap::new()),
        }
    }

    /// Waits for the lock of `key`.
    pub async fn lock(&self, key: &K) -> KeyedGuard {
        let lock = {
            let mut table = self.table.lock().unwrap_or_else(|e| e.into_inner());
            table.retain(|_, lock| Arc::strong_count(lock) > 1);
            table.entry(key.clone()).or_default().clone()
        };

        KeyedGuard {
            _guard: lock.lock_owned().await,
        }
    }

    /// The number of keys currently held or waited on.
    pub fn len(&self) -> usize {
        let table = self.table.lock().unwrap_or_else(|e| e.into_inner());
        table
            .values()
            .filter(|lock| Arc::strong_count(lock) > 1)
            .count()
    }

    /// Whether no key is currently held or waited on.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

impl<K> Default for KeyedLocks<K>
where
    K: Eq + Hash + Clone,
{
    fn default() -> Self {
        Self::new()
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn test_keyed_locks_serialize_same_key() {
        let locks = Arc::new(KeyedLocks::<String>::new());
        let guard = locks.lock(&"vm-1".to_string()).await;

        let contender = {
            let locks = locks.clone();
            tokio::spawn(async move {
                let _guard = locks.lock(&"vm-1".to_string()).await;
            })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!contender.is_finished());

        drop(guard);
        tokio::time::timeout(Duration::from_secs(1), contender)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_keyed_locks_do_not_block_other_keys() {
        let locks = KeyedLocks::<String>::new();
        let _first = locks.lock(&"vm-1".to_string()).await;

        tokio::time::timeout(Duration::from_secs(1), locks.lock(&"vm-2".to_string()))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_keyed_locks_prune_released_keys() {
        let locks = KeyedLocks::<String>::new();
        {
            let _guard = locks.lock(&"vm-1".to_string()).await;
            assert_eq!(locks.len(), 1);
        }

        assert!(locks.is_empty());
    }
}
