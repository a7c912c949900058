use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use tracing::debug;

use crate::schedule::TaskHandle;

/// Fixed duplicate-suppression window. Not configurable.
pub const DEDUP_WINDOW: Duration = Duration::from_millis(2000);

#[derive(Debug)]
struct Registered {
    at: Instant,
    // removal is scheduled per entry; dropping the entry cancels it
    _expiry: TaskHandle,
}

/// Registry of recently-seen dedup keys. An entry expires two seconds after
/// registration through a cancellable scheduled task, so clearing the
/// registry tears every pending expiry down with it.
#[derive(Clone, Default)]
pub struct DedupRegistry {
    seen: Arc<Mutex<HashMap<String, Registered>>>,
}

impl DedupRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a key, scheduling its removal after the window. Returns
    /// false when the key is already registered within the window; the
    /// caller treats that as a duplicate and drops the event.
    pub fn register(&self, key: &str) -> bool {
        let mut seen = lock_or_recover(&self.seen);
        if let Some(existing) = seen.get(key) {
            if existing.at.elapsed() < DEDUP_WINDOW {
                debug!(key, "duplicate event suppressed");
                return false;
            }
        }

        let expiry = {
            let seen = Arc::clone(&self.seen);
            let key = key.to_string();
            TaskHandle::delay(DEDUP_WINDOW, move || {
                lock_or_recover(&seen).remove(&key);
            })
        };
        seen.insert(
            key.to_string(),
            Registered {
                at: Instant::now(),
                _expiry: expiry,
            },
        );
        true
    }

    pub fn contains(&self, key: &str) -> bool {
        lock_or_recover(&self.seen).contains_key(key)
    }

    pub fn len(&self) -> usize {
        lock_or_recover(&self.seen).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every entry and cancel its pending expiry.
    pub fn clear(&self) {
        lock_or_recover(&self.seen).clear();
    }
}

fn lock_or_recover<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
