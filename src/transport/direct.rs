//! Direct delivery: events go straight from the caller's task to the
//! collector, with an in-process FIFO queue holding whatever could not be
//! delivered. This is the path taken when background delivery is disabled.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use crate::event::Event;
use crate::transport::client::CollectorClient;

/// A queued event plus its delivery bookkeeping.
#[derive(Debug)]
pub struct QueueEntry {
    pub event: Event,
    pub queued_at: DateTime<Utc>,
    /// Failed delivery attempts so far. Zero when the entry was queued
    /// without an attempt (offline).
    pub attempts: u32,
}

impl QueueEntry {
    fn new(event: Event) -> Self {
        Self {
            event,
            queued_at: Utc::now(),
            attempts: 0,
        }
    }
}

/// What happened to an event handed to [`DirectTransport::send`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SendOutcome {
    Delivered,
    Queued,
}

/// Outcome counts for one queue flush.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FlushOutcome {
    pub delivered: usize,
    pub requeued: usize,
    pub dropped: usize,
}

#[derive(Clone)]
pub struct DirectTransport {
    client: CollectorClient,
    online: Arc<AtomicBool>,
    queue: Arc<Mutex<VecDeque<QueueEntry>>>,
    max_retries: u32,
}

impl DirectTransport {
    pub fn new(client: CollectorClient, max_retries: u32) -> Self {
        Self {
            client,
            online: Arc::new(AtomicBool::new(true)),
            queue: Arc::new(Mutex::new(VecDeque::new())),
            max_retries,
        }
    }

    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }

    pub fn set_online(&self, online: bool) {
        let was = self.online.swap(online, Ordering::SeqCst);
        if was != online {
            debug!(online, "connectivity changed");
        }
    }

    pub fn queue_size(&self) -> usize {
        self.lock_queue().len()
    }

    /// Deliver one event, queueing it on failure. Offline sends skip the
    /// network entirely and queue with zero attempts.
    pub async fn send(&self, event: Event) -> SendOutcome {
        if !self.is_online() {
            debug!(event = event.kind.wire_name(), "offline, queueing event");
            self.lock_queue().push_back(QueueEntry::new(event));
            return SendOutcome::Queued;
        }
        match self.client.send(&event).await {
            Ok(()) => SendOutcome::Delivered,
            // Rejections queue like network failures; the retry budget in
            // flush_queue is the only thing that ever drops an entry.
            Err(e) => {
                debug!(
                    event = event.kind.wire_name(),
                    error = %e,
                    "delivery failed, queueing for retry"
                );
                let mut entry = QueueEntry::new(event);
                entry.attempts = 1;
                self.lock_queue().push_back(entry);
                SendOutcome::Queued
            }
        }
    }

    /// Snapshot the queue and attempt every entry in FIFO order. Failed
    /// entries with attempts left are put back at the front, keeping their
    /// relative order; the rest are dropped. A no-op while offline.
    pub async fn flush_queue(&self) -> FlushOutcome {
        let mut outcome = FlushOutcome::default();
        if !self.is_online() {
            debug!(pending = self.queue_size(), "offline, skipping queue flush");
            return outcome;
        }
        let snapshot: Vec<QueueEntry> = self.lock_queue().drain(..).collect();
        let mut requeue = Vec::new();
        for mut entry in snapshot {
            match self.client.send(&entry.event).await {
                Ok(()) => outcome.delivered += 1,
                Err(e) if entry.attempts + 1 < self.max_retries => {
                    debug!(
                        event = entry.event.kind.wire_name(),
                        attempts = entry.attempts + 1,
                        error = %e,
                        "flush attempt failed, requeueing"
                    );
                    entry.attempts += 1;
                    requeue.push(entry);
                    outcome.requeued += 1;
                }
                Err(e) => {
                    warn!(
                        event = entry.event.kind.wire_name(),
                        attempts = entry.attempts + 1,
                        error = %e,
                        "giving up on queued event"
                    );
                    outcome.dropped += 1;
                }
            }
        }
        if !requeue.is_empty() {
            // Ahead of anything that arrived while we were flushing.
            let mut queue = self.lock_queue();
            for entry in requeue.into_iter().rev() {
                queue.push_front(entry);
            }
        }
        if outcome.delivered > 0 || outcome.dropped > 0 {
            debug!(
                delivered = outcome.delivered,
                requeued = outcome.requeued,
                dropped = outcome.dropped,
                "queue flush complete"
            );
        }
        outcome
    }

    fn lock_queue(&self) -> MutexGuard<'_, VecDeque<QueueEntry>> {
        self.queue
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
