//! Event delivery. Two modes behind one surface: direct delivery with an
//! in-process retry queue, or a background worker task that batches. The
//! rest of the agent never branches on the mode except here.

pub mod background;
pub mod client;
pub mod direct;
pub mod worker;

use tracing::{debug, warn};

pub use background::BackgroundTransport;
pub use client::{CollectorClient, DeliveryError, TOKEN_HEADER};
pub use direct::{DirectTransport, FlushOutcome, QueueEntry, SendOutcome};
pub use worker::{WorkerCommand, WorkerConfig, WorkerReply};

use crate::config::Config;
use crate::event::Event;

pub enum Transport {
    Direct(DirectTransport),
    Background {
        worker: BackgroundTransport,
        /// Critical events cannot wait for a batch window, so they skip
        /// the worker and go out immediately on this client.
        beacon: CollectorClient,
    },
}

impl Transport {
    /// Build the transport for the configured mode.
    pub fn new(config: &Config) -> Result<Self, DeliveryError> {
        let client = CollectorClient::new(&config.endpoint, &config.token)?;
        if config.background_delivery {
            debug!("using background delivery");
            Ok(Transport::Background {
                worker: BackgroundTransport::spawn(config),
                beacon: client,
            })
        } else {
            debug!("using direct delivery");
            Ok(Transport::Direct(DirectTransport::new(
                client,
                config.max_retries,
            )))
        }
    }

    pub fn mode(&self) -> &'static str {
        match self {
            Transport::Direct(_) => "direct",
            Transport::Background { .. } => "background",
        }
    }

    /// Hand one event off for delivery. In background mode critical events
    /// bypass the worker; everything else is batched.
    pub async fn send(&self, event: Event) {
        match self {
            Transport::Direct(direct) => {
                direct.send(event).await;
            }
            Transport::Background { worker, beacon } => {
                if event.kind.is_critical() {
                    if let Err(e) = beacon.send(&event).await {
                        warn!(
                            event = event.kind.wire_name(),
                            error = %e,
                            "critical event delivery failed"
                        );
                    }
                } else {
                    worker.track(event);
                }
            }
        }
    }

    /// Force a queue flush now.
    pub async fn flush(&self) {
        match self {
            Transport::Direct(direct) => {
                direct.flush_queue().await;
            }
            Transport::Background { worker, .. } => {
                if let Err(message) = worker.flush().await {
                    debug!(error = %message, "flush did not complete");
                }
            }
        }
    }

    /// Record a connectivity change. Coming back online triggers a flush;
    /// going offline only flips the flag.
    pub async fn set_online(&self, online: bool) {
        match self {
            Transport::Direct(direct) => {
                direct.set_online(online);
                if online {
                    direct.flush_queue().await;
                }
            }
            // The worker flushes on its own Online command.
            Transport::Background { worker, .. } => worker.set_online(online),
        }
    }

    pub fn is_background(&self) -> bool {
        matches!(self, Transport::Background { .. })
    }

    pub async fn queue_size(&self) -> usize {
        match self {
            Transport::Direct(direct) => direct.queue_size(),
            Transport::Background { worker, .. } => worker.queue_size().await,
        }
    }

    /// Final flush and, in background mode, a clean worker shutdown.
    pub async fn shutdown(&self) {
        match self {
            Transport::Direct(direct) => {
                direct.flush_queue().await;
            }
            Transport::Background { worker, .. } => worker.terminate().await,
        }
    }
}
