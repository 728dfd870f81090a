//! Per-session locks
//!
//! Every operation that reads and then writes a session's state (chunk
//! acceptance, finalize, cancel, reaping) holds that session's lock for its
//! whole duration. Sessions never share a lock, so unrelated uploads proceed
//! concurrently.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

/// Lock table keyed by session id
#[derive(Clone, Default)]
pub struct SessionLocks {
    table: Arc<Mutex<HashMap<String, Weak<AsyncMutex<()>>>>>,
}

/// Exclusive hold on one session, released on drop
pub struct SessionGuard {
    id: String,
    table: Arc<Mutex<HashMap<String, Weak<AsyncMutex<()>>>>>,
    guard: Option<OwnedMutexGuard<()>>,
}

impl SessionLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive access to session `id`
    pub async fn lock(&self, id: &str) -> SessionGuard {
        let mutex = {
            let mut table = self.table.lock();
            match table.get(id).and_then(Weak::upgrade) {
                Some(mutex) => mutex,
                None => {
                    // Waiters that gave up before acquiring leave dead entries
                    table.retain(|_, entry| entry.strong_count() > 0);
                    let mutex = Arc::new(AsyncMutex::new(()));
                    table.insert(id.to_string(), Arc::downgrade(&mutex));
                    mutex
                }
            }
        };

        SessionGuard {
            id: id.to_string(),
            table: self.table.clone(),
            guard: Some(mutex.lock_owned().await),
        }
    }

    /// Number of sessions with a live lock entry
    pub fn active(&self) -> usize {
        self.table.lock().len()
    }
}

impl SessionGuard {
    pub fn session_id(&self) -> &str {
        &self.id
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        let mut table = self.table.lock();
        if let Some(guard) = self.guard.take() {
            let mutex = OwnedMutexGuard::mutex(&guard).clone();
            drop(guard);
            // Waiters hold their own reference; the table lock keeps new
            // ones from appearing while we look.
            if Arc::strong_count(&mutex) == 1 {
                table.remove(&self.id);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn test_same_session_is_exclusive() {
        let locks = SessionLocks::new();
        let inside = Arc::new(AtomicUsize::new(0));
        let max_inside = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let locks = locks.clone();
            let inside = inside.clone();
            let max_inside = max_inside.clone();
            handles.push(tokio::spawn(async move {
                let _guard = locks.lock("same").await;
                let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
                max_inside.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(5)).await;
                inside.fetch_sub(1, Ordering::SeqCst);
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(max_inside.load(Ordering::SeqCst), 1);
        assert_eq!(locks.active(), 0);
    }

    #[tokio::test]
    async fn test_different_sessions_do_not_contend() {
        let locks = SessionLocks::new();
        let _a = locks.lock("a").await;

        let b = tokio::time::timeout(Duration::from_millis(100), locks.lock("b")).await;
        assert!(b.is_ok());
        assert_eq!(locks.active(), 2);
    }

    #[tokio::test]
    async fn test_abandoned_waiter_entry_is_cleared() {
        let locks = SessionLocks::new();
        let holder = locks.lock("busy").await;

        let mut waiter = Box::pin(locks.lock("busy"));
        assert!(futures::poll!(waiter.as_mut()).is_pending());

        // Holder leaves while the waiter still references the mutex, then
        // the waiter is dropped without ever acquiring it
        drop(holder);
        drop(waiter);
        assert_eq!(locks.active(), 1);

        let other = locks.lock("other").await;
        assert_eq!(locks.active(), 1);
        drop(other);
        assert_eq!(locks.active(), 0);
    }

    #[tokio::test]
    async fn test_entry_removed_after_release() {
        let locks = SessionLocks::new();
        {
            let guard = locks.lock("gone").await;
            assert_eq!(guard.session_id(), "gone");
            assert_eq!(locks.active(), 1);
        }
        assert_eq!(locks.active(), 0);
    }
}
