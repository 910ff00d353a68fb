use crate::core::{ConnectionId, DbError, Result};
use log::debug;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    Shared,
    Exclusive,
}

impl fmt::Display for LockMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LockMode::Shared => f.write_str("shared"),
            LockMode::Exclusive => f.write_str("exclusive"),
        }
    }
}

/// Identity of a lockable row
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RowKey {
    pub table: String,
    pub id: i64,
}

impl RowKey {
    pub fn new(table: &str, id: i64) -> Self {
        Self {
            table: table.to_string(),
            id,
        }
    }
}

impl fmt::Display for RowKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.table, self.id)
    }
}

#[derive(Debug, Default)]
struct LockEntry {
    exclusive: Option<ConnectionId>,
    shared: HashSet<ConnectionId>,
}

impl LockEntry {
    fn is_free(&self) -> bool {
        self.exclusive.is_none() && self.shared.is_empty()
    }
}

/// Row lock table shared by all connections of one store.
///
/// Locks are re-entrant per connection. A shared holder can upgrade to
/// exclusive when it is the only holder. Locks are only ever released all
/// at once, at the end of a transaction.
#[derive(Debug, Default)]
pub struct LockManager {
    entries: Mutex<HashMap<RowKey, LockEntry>>,
    released: Notify,
}

impl LockManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait up to `timeout` for `mode` on `key`
    pub async fn acquire(
        &self,
        owner: ConnectionId,
        key: &RowKey,
        mode: LockMode,
        timeout: Duration,
    ) -> Result<()> {
        let deadline = Instant::now() + timeout;
        loop {
            let notified = self.released.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.try_acquire(owner, key, mode)? {
                return Ok(());
            }

            debug!("{} waits for {} lock on {}", owner, mode, key);
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Err(DbError::LockTimeout(format!(
                    "{} gave up waiting for {} lock on {} after {:?}",
                    owner, mode, key, timeout
                )));
            }
        }
    }

    /// Grant `mode` on `key` if compatible with the current holders
    pub fn try_acquire(&self, owner: ConnectionId, key: &RowKey, mode: LockMode) -> Result<bool> {
        let mut entries = self.entries.lock()?;
        let entry = entries.entry(key.clone()).or_default();

        let granted = match mode {
            LockMode::Shared => {
                if entry.exclusive.is_none_or(|holder| holder == owner) {
                    entry.shared.insert(owner);
                    true
                } else {
                    false
                }
            }
            LockMode::Exclusive => match entry.exclusive {
                Some(holder) => holder == owner,
                None => {
                    if entry.shared.iter().all(|holder| *holder == owner) {
                        entry.exclusive = Some(owner);
                        true
                    } else {
                        false
                    }
                }
            },
        };

        if !granted && entry.is_free() {
            entries.remove(key);
        }
        Ok(granted)
    }

    /// Drop every lock held by `owner` and wake all waiters
    pub fn release_all(&self, owner: ConnectionId) {
        let Ok(mut entries) = self.entries.lock() else {
            return;
        };
        let before = entries.len();
        entries.retain(|_, entry| {
            if entry.exclusive == Some(owner) {
                entry.exclusive = None;
            }
            entry.shared.remove(&owner);
            !entry.is_free()
        });
        drop(entries);

        if before > 0 {
            self.released.notify_waiters();
        }
    }

    /// True when `owner` holds at least `mode` on `key`
    pub fn holds(&self, owner: ConnectionId, key: &RowKey, mode: LockMode) -> bool {
        let Ok(entries) = self.entries.lock() else {
            return false;
        };
        entries.get(key).is_some_and(|entry| match mode {
            LockMode::Exclusive => entry.exclusive == Some(owner),
            LockMode::Shared => entry.exclusive == Some(owner) || entry.shared.contains(&owner),
        })
    }

    /// Number of rows with at least one holder
    pub fn locked_rows(&self) -> usize {
        self.entries.lock().map(|e| e.len()).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    const A: ConnectionId = ConnectionId(1);
    const B: ConnectionId = ConnectionId(2);

    fn key() -> RowKey {
        RowKey::new("users", 1)
    }

    #[test]
    fn test_shared_locks_are_compatible() {
        let locks = LockManager::new();
        assert!(locks.try_acquire(A, &key(), LockMode::Shared).unwrap());
        assert!(locks.try_acquire(B, &key(), LockMode::Shared).unwrap());
        assert!(!locks.try_acquire(A, &key(), LockMode::Exclusive).unwrap());
    }

    #[test]
    fn test_exclusive_is_reentrant_and_upgradable() {
        let locks = LockManager::new();
        assert!(locks.try_acquire(A, &key(), LockMode::Shared).unwrap());
        assert!(locks.try_acquire(A, &key(), LockMode::Exclusive).unwrap());
        assert!(locks.try_acquire(A, &key(), LockMode::Exclusive).unwrap());
        assert!(locks.try_acquire(A, &key(), LockMode::Shared).unwrap());
        assert!(!locks.try_acquire(B, &key(), LockMode::Shared).unwrap());
        assert!(locks.holds(A, &key(), LockMode::Exclusive));
    }

    #[test]
    fn test_release_all_frees_rows() {
        let locks = LockManager::new();
        locks.try_acquire(A, &key(), LockMode::Exclusive).unwrap();
        locks.try_acquire(A, &RowKey::new("accounts", 3), LockMode::Shared).unwrap();
        assert_eq!(locks.locked_rows(), 2);

        locks.release_all(A);
        assert_eq!(locks.locked_rows(), 0);
        assert!(locks.try_acquire(B, &key(), LockMode::Exclusive).unwrap());
    }

    #[tokio::test]
    async fn test_waiter_is_woken_on_release() {
        let locks = Arc::new(LockManager::new());
        locks.try_acquire(A, &key(), LockMode::Exclusive).unwrap();

        let waiter = {
            let locks = locks.clone();
            tokio::spawn(async move {
                locks
                    .acquire(B, &key(), LockMode::Shared, Duration::from_secs(5))
                    .await
            })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());
        locks.release_all(A);

        waiter.await.unwrap().unwrap();
        assert!(locks.holds(B, &key(), LockMode::Shared));
    }

    #[tokio::test]
    async fn test_wait_is_bounded() {
        let locks = LockManager::new();
        locks.try_acquire(A, &key(), LockMode::Shared).unwrap();

        let err = locks
            .acquire(B, &key(), LockMode::Exclusive, Duration::from_millis(20))
            .await
            .unwrap_err();
        assert!(matches!(err, DbError::LockTimeout(_)));
    }
}
