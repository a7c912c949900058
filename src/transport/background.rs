//! Tracker-side handle for the background delivery worker. Owns the
//! command channel, a reply pump that resolves request/reply pairs, and
//! the worker's join handle for a clean shutdown.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::config::Config;
use crate::event::Event;
use crate::schedule::TaskHandle;
use crate::transport::worker::{run_worker, WorkerCommand, WorkerConfig, WorkerReply};

type SizeWaiters = Arc<Mutex<VecDeque<oneshot::Sender<usize>>>>;
type FlushWaiters = Arc<Mutex<VecDeque<oneshot::Sender<Result<usize, String>>>>>;

pub struct BackgroundTransport {
    commands: Mutex<Option<mpsc::UnboundedSender<WorkerCommand>>>,
    // Plain JoinHandle: aborting the worker would lose its batch, so
    // shutdown drops the command sender and waits for it instead.
    worker: Mutex<Option<JoinHandle<()>>>,
    last_queue_size: Arc<AtomicUsize>,
    size_waiters: SizeWaiters,
    flush_waiters: FlushWaiters,
    _pump: TaskHandle,
}

impl BackgroundTransport {
    /// Spawn the worker and its reply pump, then hand the worker its
    /// configuration. Events may be tracked immediately; the worker
    /// buffers anything that arrives before it finishes initializing.
    pub fn spawn(config: &Config) -> Self {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (reply_tx, reply_rx) = mpsc::unbounded_channel();
        let worker = tokio::spawn(run_worker(command_rx, reply_tx));

        let last_queue_size = Arc::new(AtomicUsize::new(0));
        let size_waiters: SizeWaiters = Arc::new(Mutex::new(VecDeque::new()));
        let flush_waiters: FlushWaiters = Arc::new(Mutex::new(VecDeque::new()));
        let pump = TaskHandle::spawn(pump_replies(
            reply_rx,
            Arc::clone(&last_queue_size),
            Arc::clone(&size_waiters),
            Arc::clone(&flush_waiters),
        ));

        command_tx
            .send(WorkerCommand::Init(WorkerConfig {
                endpoint: config.endpoint.clone(),
                token: config.token.clone(),
                batch_size: config.batch_size,
                batch_interval: config.batch_interval,
            }))
            .ok();

        Self {
            commands: Mutex::new(Some(command_tx)),
            worker: Mutex::new(Some(worker)),
            last_queue_size,
            size_waiters,
            flush_waiters,
            _pump: pump,
        }
    }

    /// Hand one event to the worker. Dropped with a warning when the
    /// worker is already gone.
    pub fn track(&self, event: Event) {
        if !self.send(WorkerCommand::TrackEvent(event)) {
            warn!("delivery worker unavailable, event dropped");
        }
    }

    pub fn set_online(&self, online: bool) {
        let command = if online {
            WorkerCommand::Online
        } else {
            WorkerCommand::Offline
        };
        self.send(command);
    }

    /// Ask the worker to flush and wait for its verdict.
    pub async fn flush(&self) -> Result<usize, String> {
        let (tx, rx) = oneshot::channel();
        {
            // Replies pair with waiters by position, so the waiter queue
            // and the command channel must agree on order: the guard spans
            // the send.
            let mut waiters = lock(&self.flush_waiters);
            waiters.push_back(tx);
            if !self.send(WorkerCommand::FlushQueue) {
                waiters.pop_back();
                return Err("delivery worker unavailable".to_string());
            }
        }
        match rx.await {
            Ok(outcome) => outcome,
            Err(_) => Err("delivery worker stopped".to_string()),
        }
    }

    /// Current number of buffered events, fetched from the worker. Falls
    /// back to the last reported size when the worker is gone.
    pub async fn queue_size(&self) -> usize {
        let (tx, rx) = oneshot::channel();
        {
            let mut waiters = lock(&self.size_waiters);
            waiters.push_back(tx);
            if !self.send(WorkerCommand::GetQueueSize) {
                waiters.pop_back();
                return self.last_queue_size.load(Ordering::SeqCst);
            }
        }
        rx.await
            .unwrap_or_else(|_| self.last_queue_size.load(Ordering::SeqCst))
    }

    /// Close the command channel and wait for the worker to flush its
    /// batch and exit.
    pub async fn terminate(&self) {
        let sender = lock(&self.commands).take();
        drop(sender);
        let handle = lock(&self.worker).take();
        if let Some(handle) = handle {
            handle.await.ok();
        }
    }

    fn send(&self, command: WorkerCommand) -> bool {
        match lock(&self.commands).as_ref() {
            Some(tx) => tx.send(command).is_ok(),
            None => false,
        }
    }
}

async fn pump_replies(
    mut replies: mpsc::UnboundedReceiver<WorkerReply>,
    last_queue_size: Arc<AtomicUsize>,
    size_waiters: SizeWaiters,
    flush_waiters: FlushWaiters,
) {
    while let Some(reply) = replies.recv().await {
        match reply {
            WorkerReply::InitSuccess => debug!("delivery worker initialized"),
            WorkerReply::QueueSize(size) => {
                last_queue_size.store(size, Ordering::SeqCst);
                if let Some(waiter) = lock(&size_waiters).pop_front() {
                    waiter.send(size).ok();
                }
            }
            WorkerReply::FlushSuccess { delivered } => {
                debug!(delivered, "background flush complete");
                if let Some(waiter) = lock(&flush_waiters).pop_front() {
                    waiter.send(Ok(delivered)).ok();
                }
            }
            WorkerReply::FlushError { retained, message } => {
                warn!(retained, error = %message, "background flush failed");
                if let Some(waiter) = lock(&flush_waiters).pop_front() {
                    waiter.send(Err(message)).ok();
                }
            }
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{EventKind, Payload};

    fn config() -> Config {
        // Unroutable; these tests never reach the network.
        Config::builder("tok", "http://127.0.0.1:9/collect")
            .build()
            .unwrap()
    }

    fn event() -> Event {
        Event::new(EventKind::PageView, "sess-1", "tok", Payload::new())
    }

    #[tokio::test]
    async fn queue_size_reflects_tracked_events() {
        let transport = BackgroundTransport::spawn(&config());
        transport.track(event());
        transport.track(event());
        assert_eq!(transport.queue_size().await, 2);
    }

    #[tokio::test]
    async fn offline_flush_reports_error_and_keeps_events() {
        let transport = BackgroundTransport::spawn(&config());
        transport.set_online(false);
        transport.track(event());
        let outcome = transport.flush().await;
        assert_eq!(outcome, Err("offline".to_string()));
        assert_eq!(transport.queue_size().await, 1);
    }

    #[tokio::test]
    async fn flush_with_empty_queue_succeeds() {
        let transport = BackgroundTransport::spawn(&config());
        assert_eq!(transport.flush().await, Ok(0));
    }

    #[tokio::test]
    async fn terminate_stops_the_worker() {
        let transport = BackgroundTransport::spawn(&config());
        transport.terminate().await;
        // Post-terminate calls degrade instead of hanging.
        transport.track(event());
        assert!(transport.flush().await.is_err());
        // The failed flush must take its own waiter back out.
        assert!(lock(&transport.flush_waiters).is_empty());
    }

    #[tokio::test]
    async fn flush_verdicts_resolve_in_request_order() {
        let (reply_tx, reply_rx) = mpsc::unbounded_channel();
        let last_queue_size = Arc::new(AtomicUsize::new(0));
        let size_waiters: SizeWaiters = Arc::new(Mutex::new(VecDeque::new()));
        let flush_waiters: FlushWaiters = Arc::new(Mutex::new(VecDeque::new()));
        let _pump = TaskHandle::spawn(pump_replies(
            reply_rx,
            Arc::clone(&last_queue_size),
            Arc::clone(&size_waiters),
            Arc::clone(&flush_waiters),
        ));

        let (first_tx, first_rx) = oneshot::channel();
        let (second_tx, second_rx) = oneshot::channel();
        {
            let mut waiters = lock(&flush_waiters);
            waiters.push_back(first_tx);
            waiters.push_back(second_tx);
        }
        reply_tx
            .send(WorkerReply::FlushError {
                retained: 1,
                message: "offline".to_string(),
            })
            .unwrap();
        reply_tx
            .send(WorkerReply::FlushSuccess { delivered: 1 })
            .unwrap();

        assert_eq!(first_rx.await.unwrap(), Err("offline".to_string()));
        assert_eq!(second_rx.await.unwrap(), Ok(1));
    }

    #[tokio::test]
    async fn concurrent_flushes_each_get_a_verdict() {
        let transport = Arc::new(BackgroundTransport::spawn(&config()));
        transport.set_online(false);
        transport.track(event());

        let first = tokio::spawn({
            let transport = Arc::clone(&transport);
            async move { transport.flush().await }
        });
        let second = tokio::spawn({
            let transport = Arc::clone(&transport);
            async move { transport.flush().await }
        });
        assert_eq!(first.await.unwrap(), Err("offline".to_string()));
        assert_eq!(second.await.unwrap(), Err("offline".to_string()));
        assert_eq!(transport.queue_size().await, 1);
    }
}
