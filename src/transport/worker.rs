//! Background delivery worker. Runs as a dedicated task owning the batch
//! queue and collector client; the tracker talks to it exclusively through
//! typed messages, so the worker state is never shared and never locked.

use std::collections::VecDeque;
use std::future;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use tokio::sync::mpsc;
use tokio::time::{self, Interval, MissedTickBehavior};
use tracing::{debug, error, warn};

use crate::event::Event;
use crate::transport::client::CollectorClient;

/// Everything the worker needs to start delivering, carried by
/// [`WorkerCommand::Init`].
#[derive(Clone, Debug)]
pub struct WorkerConfig {
    pub endpoint: String,
    pub token: String,
    pub batch_size: usize,
    pub batch_interval: Duration,
}

/// Tracker-to-worker messages.
#[derive(Debug)]
pub enum WorkerCommand {
    Init(WorkerConfig),
    TrackEvent(Event),
    FlushQueue,
    Online,
    Offline,
    GetQueueSize,
}

/// Worker-to-tracker messages. Flush outcomes are reported only for
/// explicit [`WorkerCommand::FlushQueue`] commands, in command order;
/// internally triggered flushes just log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerReply {
    InitSuccess,
    FlushSuccess { delivered: usize },
    FlushError { retained: usize, message: String },
    QueueSize(usize),
}

/// One buffered event. The queue time is stamped on arrival and survives
/// a failed flush; restored entries are the originals, not re-creations.
#[derive(Debug)]
struct BatchEntry {
    event: Event,
    queued_at: DateTime<Utc>,
}

impl BatchEntry {
    fn new(event: Event) -> Self {
        Self {
            event,
            queued_at: Utc::now(),
        }
    }
}

/// Why a flush ran, for the log line.
#[derive(Clone, Copy, Debug)]
enum FlushTrigger {
    Timer,
    BatchFull,
    Command,
    Online,
    Shutdown,
}

impl FlushTrigger {
    fn as_str(&self) -> &'static str {
        match self {
            FlushTrigger::Timer => "timer",
            FlushTrigger::BatchFull => "batch_full",
            FlushTrigger::Command => "command",
            FlushTrigger::Online => "online",
            FlushTrigger::Shutdown => "shutdown",
        }
    }
}

/// Worker task body. Exits when the command channel closes, flushing
/// whatever it still holds on the way out.
pub async fn run_worker(
    mut commands: mpsc::UnboundedReceiver<WorkerCommand>,
    replies: mpsc::UnboundedSender<WorkerReply>,
) {
    let mut worker = Worker::new(replies);
    loop {
        tokio::select! {
            command = commands.recv() => {
                match command {
                    Some(command) => worker.handle(command).await,
                    None => break,
                }
            }
            _ = next_tick(worker.timer.as_mut()) => {
                worker.flush(FlushTrigger::Timer).await;
            }
        }
    }
    worker.flush(FlushTrigger::Shutdown).await;
    if let Some(oldest) = worker.batch.front() {
        warn!(
            pending = worker.batch.len(),
            oldest_queued_at = %oldest.queued_at,
            "delivery worker stopped with undelivered events"
        );
    }
    debug!("delivery worker stopped");
}

async fn next_tick(timer: Option<&mut Interval>) {
    match timer {
        Some(timer) => {
            timer.tick().await;
        }
        None => future::pending().await,
    }
}

struct Worker {
    replies: mpsc::UnboundedSender<WorkerReply>,
    client: Option<CollectorClient>,
    timer: Option<Interval>,
    batch: VecDeque<BatchEntry>,
    batch_size: usize,
    online: bool,
}

impl Worker {
    fn new(replies: mpsc::UnboundedSender<WorkerReply>) -> Self {
        Self {
            replies,
            client: None,
            timer: None,
            batch: VecDeque::new(),
            batch_size: 1,
            online: true,
        }
    }

    async fn handle(&mut self, command: WorkerCommand) {
        match command {
            WorkerCommand::Init(config) => self.init(config),
            WorkerCommand::TrackEvent(event) => {
                self.batch.push_back(BatchEntry::new(event));
                if self.client.is_some() && self.batch.len() >= self.batch_size {
                    self.flush(FlushTrigger::BatchFull).await;
                }
            }
            WorkerCommand::FlushQueue => self.flush(FlushTrigger::Command).await,
            WorkerCommand::Online => {
                self.online = true;
                self.flush(FlushTrigger::Online).await;
            }
            WorkerCommand::Offline => {
                self.online = false;
            }
            WorkerCommand::GetQueueSize => {
                self.reply(WorkerReply::QueueSize(self.batch.len()));
            }
        }
    }

    fn init(&mut self, config: WorkerConfig) {
        match CollectorClient::new(&config.endpoint, &config.token) {
            Ok(client) => {
                self.client = Some(client);
                self.batch_size = config.batch_size.max(1);
                let mut timer = time::interval_at(
                    time::Instant::now() + config.batch_interval,
                    config.batch_interval,
                );
                timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
                self.timer = Some(timer);
                debug!(
                    endpoint = %config.endpoint,
                    batch_size = self.batch_size,
                    "delivery worker ready"
                );
                self.reply(WorkerReply::InitSuccess);
            }
            Err(e) => {
                // Events keep buffering; nothing will drain them.
                error!(error = %e, "delivery worker could not build collector client");
            }
        }
    }

    /// Deliver the whole batch concurrently, one request per event. The
    /// flush is all-or-nothing: any failure restores the entire original
    /// batch in order, including entries that did go through, and leaves
    /// the retry to the next trigger. The collector dedupes on event_id.
    async fn flush(&mut self, trigger: FlushTrigger) {
        let explicit = matches!(trigger, FlushTrigger::Command);
        if self.batch.is_empty() {
            if explicit {
                self.reply(WorkerReply::FlushSuccess { delivered: 0 });
            }
            return;
        }
        let Some(client) = self.client.clone() else {
            if explicit {
                self.reply(WorkerReply::FlushError {
                    retained: self.batch.len(),
                    message: "worker not initialized".to_string(),
                });
            }
            return;
        };
        if !self.online {
            debug!(
                pending = self.batch.len(),
                trigger = trigger.as_str(),
                "offline, batch retained"
            );
            if explicit {
                self.reply(WorkerReply::FlushError {
                    retained: self.batch.len(),
                    message: "offline".to_string(),
                });
            }
            return;
        }

        let entries: Vec<BatchEntry> = self.batch.drain(..).collect();
        let total = entries.len();
        debug!(total, trigger = trigger.as_str(), "flushing event batch");
        let results = join_all(entries.iter().map(|entry| {
            let client = client.clone();
            async move { client.send(&entry.event).await }
        }))
        .await;

        let mut first_error = None;
        for result in &results {
            if let Err(e) = result {
                if first_error.is_none() {
                    first_error = Some(e.to_string());
                }
            }
        }

        match first_error {
            None => {
                if explicit {
                    self.reply(WorkerReply::FlushSuccess { delivered: total });
                } else {
                    debug!(
                        delivered = total,
                        trigger = trigger.as_str(),
                        "batch flush complete"
                    );
                }
            }
            Some(message) => {
                warn!(
                    total,
                    trigger = trigger.as_str(),
                    error = %message,
                    "batch flush failed, restoring batch"
                );
                for entry in entries.into_iter().rev() {
                    self.batch.push_front(entry);
                }
                if explicit {
                    self.reply(WorkerReply::FlushError {
                        retained: total,
                        message,
                    });
                }
            }
        }
    }

    fn reply(&self, reply: WorkerReply) {
        // The tracker side may already be gone during teardown.
        self.replies.send(reply).ok();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn harness() -> (
        mpsc::UnboundedSender<WorkerCommand>,
        mpsc::UnboundedReceiver<WorkerReply>,
    ) {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (reply_tx, reply_rx) = mpsc::unbounded_channel();
        tokio::spawn(run_worker(command_rx, reply_tx));
        (command_tx, reply_rx)
    }

    fn config() -> WorkerConfig {
        WorkerConfig {
            // Nothing listens here; any send fails fast without leaving
            // the host.
            endpoint: "http://127.0.0.1:9/collect".to_string(),
            token: "tok".to_string(),
            batch_size: 10,
            batch_interval: Duration::from_secs(60),
        }
    }

    fn event() -> Event {
        use crate::event::{EventKind, Payload};
        Event::new(EventKind::PageView, "sess-1", "tok", Payload::new())
    }

    #[tokio::test]
    async fn init_replies_with_success() {
        let (commands, mut replies) = harness();
        commands.send(WorkerCommand::Init(config())).unwrap();
        assert_eq!(replies.recv().await, Some(WorkerReply::InitSuccess));
    }

    #[tokio::test]
    async fn events_buffer_before_init() {
        let (commands, mut replies) = harness();
        commands.send(WorkerCommand::TrackEvent(event())).unwrap();
        commands.send(WorkerCommand::TrackEvent(event())).unwrap();
        commands.send(WorkerCommand::GetQueueSize).unwrap();
        assert_eq!(replies.recv().await, Some(WorkerReply::QueueSize(2)));
    }

    #[tokio::test]
    async fn explicit_flush_before_init_reports_error() {
        let (commands, mut replies) = harness();
        commands.send(WorkerCommand::TrackEvent(event())).unwrap();
        commands.send(WorkerCommand::FlushQueue).unwrap();
        match replies.recv().await {
            Some(WorkerReply::FlushError { retained, message }) => {
                assert_eq!(retained, 1);
                assert!(message.contains("not initialized"));
            }
            other => panic!("unexpected reply: {:?}", other),
        }
    }

    #[tokio::test]
    async fn offline_flush_retains_batch() {
        let (commands, mut replies) = harness();
        commands.send(WorkerCommand::Init(config())).unwrap();
        assert_eq!(replies.recv().await, Some(WorkerReply::InitSuccess));
        commands.send(WorkerCommand::Offline).unwrap();
        commands.send(WorkerCommand::TrackEvent(event())).unwrap();
        commands.send(WorkerCommand::FlushQueue).unwrap();
        match replies.recv().await {
            Some(WorkerReply::FlushError { retained, message }) => {
                assert_eq!(retained, 1);
                assert_eq!(message, "offline");
            }
            other => panic!("unexpected reply: {:?}", other),
        }
        commands.send(WorkerCommand::GetQueueSize).unwrap();
        assert_eq!(replies.recv().await, Some(WorkerReply::QueueSize(1)));
    }

    #[tokio::test]
    async fn empty_explicit_flush_reports_zero_delivered() {
        let (commands, mut replies) = harness();
        commands.send(WorkerCommand::Init(config())).unwrap();
        assert_eq!(replies.recv().await, Some(WorkerReply::InitSuccess));
        commands.send(WorkerCommand::FlushQueue).unwrap();
        assert_eq!(
            replies.recv().await,
            Some(WorkerReply::FlushSuccess { delivered: 0 })
        );
    }

    #[tokio::test]
    async fn failed_flush_restores_entries_with_their_queue_times() {
        let (reply_tx, _replies) = mpsc::unbounded_channel();
        let mut worker = Worker::new(reply_tx);
        worker.handle(WorkerCommand::Init(config())).await;
        worker.handle(WorkerCommand::TrackEvent(event())).await;
        worker.handle(WorkerCommand::TrackEvent(event())).await;
        let stamped: Vec<DateTime<Utc>> = worker.batch.iter().map(|e| e.queued_at).collect();
        assert_eq!(stamped.len(), 2);

        // Every send fails against the dead endpoint, so the whole batch
        // comes back with its original stamps.
        worker.flush(FlushTrigger::Command).await;
        let restored: Vec<DateTime<Utc>> = worker.batch.iter().map(|e| e.queued_at).collect();
        assert_eq!(restored, stamped);
    }
}
