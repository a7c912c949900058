//! Embeddable page-telemetry agent: captures page views, clicks,
//! conversions and session lifecycle events and delivers them to a
//! collector, riding out offline stretches with queueing and retry.
//! Delivery runs either directly with an in-process queue or through a
//! background worker task that batches.
//!
//! The host drives the agent: it implements the traits in [`host`] and
//! pushes platform notifications into the tracker's signal channel.
//!
//! ```no_run
//! use pagewire::{Config, HostHooks, HostSignal, Tracker};
//!
//! # async fn run() -> Result<(), pagewire::InitError> {
//! let config = Config::builder("abc123", "https://collect.example/api/v1/events").build()?;
//! let tracker = Tracker::init(config, HostHooks::default()).await?;
//!
//! let signals = tracker.signals();
//! signals.send(HostSignal::RouteChanged {
//!     url: "https://site.example/pricing".into(),
//! }).ok();
//!
//! tracker.track("signup_click", Default::default()).await;
//! tracker.flush().await;
//! tracker.destroy().await;
//! # Ok(())
//! # }
//! ```

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

mod compose;
pub mod config;
pub mod dedupe;
pub mod event;
pub mod host;
pub mod rules;
pub mod schedule;
pub mod session;
mod tracker;
pub mod transport;

pub use compose::{EventBuilder, EventError};
pub use config::{Config, ConfigBuilder, ConfigError, GeoConfig};
pub use event::{Event, EventKind, Payload};
pub use host::{HostHooks, HostSignal};
pub use session::Session;
pub use tracker::{auto_init, InitError, Tracker};
pub use transport::TOKEN_HEADER;

/// Install a stdout subscriber for debugging the agent. `RUST_LOG`
/// overrides the default `pagewire=debug` filter. Safe to call more than
/// once; later calls are no-ops.
pub fn init_debug_logging() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("pagewire=debug"));
    tracing_subscriber::registry()
        .with(fmt::layer().with_ansi(true))
        .with(filter)
        .try_init()
        .ok();
}
