use std::sync::Mutex;

use chrono::{DateTime, Utc};
use tracing::debug;
use uuid::Uuid;

/// Per-page session identity. Two states, {inactive, active}, cycling
/// freely across start/end calls; never persisted across reloads.
///
/// `is_active` is the single gate event construction consults before
/// building anything.
#[derive(Debug, Default)]
pub struct Session {
    inner: Mutex<Option<ActiveSession>>,
}

#[derive(Debug, Clone)]
struct ActiveSession {
    id: String,
    started_at: DateTime<Utc>,
}

impl Session {
    pub fn new() -> Self {
        Self::default()
    }

    /// Generate a fresh identifier and transition to active. Starting over
    /// an already-active session replaces it.
    pub fn start(&self) -> String {
        let id = Uuid::new_v4().to_string();
        let mut inner = lock_or_recover(&self.inner);
        if let Some(previous) = inner.as_ref() {
            debug!(previous = %previous.id, "replacing active session");
        }
        *inner = Some(ActiveSession {
            id: id.clone(),
            started_at: Utc::now(),
        });
        id
    }

    /// Transition to inactive, clearing the identifier. Returns the ended
    /// session id, if any.
    pub fn end(&self) -> Option<String> {
        lock_or_recover(&self.inner).take().map(|s| s.id)
    }

    pub fn is_active(&self) -> bool {
        lock_or_recover(&self.inner).is_some()
    }

    pub fn id(&self) -> Option<String> {
        lock_or_recover(&self.inner).as_ref().map(|s| s.id.clone())
    }

    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        lock_or_recover(&self.inner).as_ref().map(|s| s.started_at)
    }
}

fn lock_or_recover<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
