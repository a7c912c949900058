//! Scheduled-task primitives: a delayed action with a cancellation handle,
//! and a repeating ticker with stop/start semantics. Components own their
//! handles, so teardown cancels pending work deterministically instead of
//! leaking timers.

use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::sleep;

/// Handle to a spawned task. Cancelling (or dropping) the handle aborts the
/// task at its next suspension point.
#[derive(Debug)]
pub struct TaskHandle {
    inner: JoinHandle<()>,
}

impl TaskHandle {
    /// Run `action` once after `delay`, unless cancelled first.
    pub fn delay<F>(delay: Duration, action: F) -> TaskHandle
    where
        F: FnOnce() + Send + 'static,
    {
        TaskHandle::spawn(async move {
            sleep(delay).await;
            action();
        })
    }

    /// Wrap an arbitrary future in a cancellable handle.
    pub fn spawn<F>(future: F) -> TaskHandle
    where
        F: Future<Output = ()> + Send + 'static,
    {
        TaskHandle {
            inner: tokio::spawn(future),
        }
    }

    pub fn cancel(&self) {
        self.inner.abort();
    }

    pub fn is_finished(&self) -> bool {
        self.inner.is_finished()
    }
}

impl Drop for TaskHandle {
    fn drop(&mut self) {
        self.inner.abort();
    }
}

/// Repeating timer. `stop` aborts the underlying task; `start` spawns a new
/// one. There is no pause: the stop/start cycle is the pause semantic.
pub struct Ticker {
    period: Duration,
    tick: Arc<dyn Fn() + Send + Sync>,
    task: Mutex<Option<TaskHandle>>,
}

impl Ticker {
    /// Create a stopped ticker that will invoke `tick` every `period` once
    /// started. The callback must not block; long work belongs in a task it
    /// spawns itself.
    pub fn new<F>(period: Duration, tick: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        Self {
            period,
            tick: Arc::new(tick),
            task: Mutex::new(None),
        }
    }

    /// Start ticking. Restarting an already-running ticker resets its phase.
    pub fn start(&self) {
        let tick = Arc::clone(&self.tick);
        let period = self.period;
        let handle = TaskHandle::spawn(async move {
            loop {
                sleep(period).await;
                tick();
            }
        });
        *lock_or_recover(&self.task) = Some(handle);
    }

    pub fn stop(&self) {
        lock_or_recover(&self.task).take();
    }

    pub fn is_running(&self) -> bool {
        lock_or_recover(&self.task)
            .as_ref()
            .map(|t| !t.is_finished())
            .unwrap_or(false)
    }
}

fn lock_or_recover<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test(start_paused = true)]
    async fn delayed_action_fires_after_deadline() {
        let fired = Arc::new(AtomicU32::new(0));
        let count = fired.clone();
        let _handle = TaskHandle::delay(Duration::from_millis(100), move || {
            count.fetch_add(1, Ordering::SeqCst);
        });

        sleep(Duration::from_millis(99)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);

        sleep(Duration::from_millis(2)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_action_never_fires() {
        let fired = Arc::new(AtomicU32::new(0));
        let count = fired.clone();
        let handle = TaskHandle::delay(Duration::from_millis(50), move || {
            count.fetch_add(1, Ordering::SeqCst);
        });

        handle.cancel();
        sleep(Duration::from_millis(200)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn dropping_the_handle_cancels() {
        let fired = Arc::new(AtomicU32::new(0));
        let count = fired.clone();
        drop(TaskHandle::delay(Duration::from_millis(50), move || {
            count.fetch_add(1, Ordering::SeqCst);
        }));

        sleep(Duration::from_millis(200)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn ticker_stop_and_start_cycle() {
        let ticks = Arc::new(AtomicU32::new(0));
        let count = ticks.clone();
        let ticker = Ticker::new(Duration::from_millis(10), move || {
            count.fetch_add(1, Ordering::SeqCst);
        });

        assert!(!ticker.is_running());
        ticker.start();
        sleep(Duration::from_millis(35)).await;
        let after_run = ticks.load(Ordering::SeqCst);
        assert!(after_run >= 3, "expected at least 3 ticks, got {}", after_run);

        ticker.stop();
        assert!(!ticker.is_running());
        sleep(Duration::from_millis(50)).await;
        assert_eq!(ticks.load(Ordering::SeqCst), after_run);

        ticker.start();
        sleep(Duration::from_millis(15)).await;
        assert!(ticks.load(Ordering::SeqCst) > after_run);
    }
}
