//! Named mutual-exclusion domains.

use tokio::sync::{Mutex, MutexGuard};

/// The two independent lock domains of the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LockType {
    /// One protocol iteration at a time.
    Sync,
    /// One upload loop at a time.
    Crud,
}

/// Per-instance locks shared by the state machines of one connection manager.
///
/// The two domains never block each other: an upload can run while a
/// protocol iteration restarts and vice versa.
#[derive(Debug, Default)]
pub struct SyncLocks {
    sync: Mutex<()>,
    crud: Mutex<()>,
}

impl SyncLocks {
    /// Creates a fresh pair of locks.
    pub fn new() -> Self {
        Self::default()
    }

    fn mutex(&self, lock: LockType) -> &Mutex<()> {
        match lock {
            LockType::Sync => &self.sync,
            LockType::Crud => &self.crud,
        }
    }

    /// Waits for the lock.
    pub async fn acquire(&self, lock: LockType) -> MutexGuard<'_, ()> {
        self.mutex(lock).lock().await
    }

    /// Takes the lock if it is free.
    pub fn try_acquire(&self, lock: LockType) -> Option<MutexGuard<'_, ()>> {
        self.mutex(lock).try_lock().ok()
    }

    /// Returns true while someone holds the lock.
    pub fn is_locked(&self, lock: LockType) -> bool {
        self.mutex(lock).try_lock().is_err()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn domains_are_independent() {
        let locks = SyncLocks::new();
        let _sync = locks.acquire(LockType::Sync).await;

        assert!(locks.is_locked(LockType::Sync));
        assert!(!locks.is_locked(LockType::Crud));
        assert!(locks.try_acquire(LockType::Crud).is_some());
        assert!(locks.try_acquire(LockType::Sync).is_none());
    }

    #[tokio::test]
    async fn acquire_waits_for_release() {
        let locks = Arc::new(SyncLocks::new());
        let guard = locks.acquire(LockType::Crud).await;

        let waiter = {
            let locks = Arc::clone(&locks);
            tokio::spawn(async move {
                let _guard = locks.acquire(LockType::Crud).await;
            })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());
        drop(guard);
        waiter.await.unwrap();
        assert!(!locks.is_locked(LockType::Crud));
    }
}
