use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

/// Per-session async mutexes.
///
/// Entries are weak so an idle session's lock is freed once no caller holds it;
/// dead entries are pruned when the map grows.
#[derive(Default)]
pub struct SessionLocks {
    locks: Mutex<HashMap<String, Weak<AsyncMutex<()>>>>,
}

const PRUNE_THRESHOLD: usize = 128;

impl SessionLocks {
    pub fn new() -> Self {
        Self::default()
    }

    fn handle(&self, session_id: &str) -> Arc<AsyncMutex<()>> {
        let mut locks = self.locks.lock();

        if locks.len() > PRUNE_THRESHOLD {
            locks.retain(|_, weak| weak.strong_count() > 0);
        }

        if let Some(existing) = locks.get(session_id).and_then(Weak::upgrade) {
            return existing;
        }

        let lock = Arc::new(AsyncMutex::new(()));
        locks.insert(session_id.to_string(), Arc::downgrade(&lock));
        lock
    }

    /// Wait for exclusive access to `session_id`.
    pub async fn acquire(&self, session_id: &str) -> OwnedMutexGuard<()> {
        self.handle(session_id).lock_owned().await
    }

    /// Number of live lock entries.
    pub fn len(&self) -> usize {
        self.locks
            .lock()
            .values()
            .filter(|weak| weak.strong_count() > 0)
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
