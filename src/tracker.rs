//! The tracker object. Owns the session, event builder, conversion rules
//! and transport; consumes host signals from a channel; exposes the
//! tracking entry points the embedding application calls. Constructed
//! explicitly and destroyed explicitly, never a process-wide singleton.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::compose::EventBuilder;
use crate::config::{Config, ConfigError};
use crate::event::{EventKind, Payload};
use crate::host::{HostHooks, HostSignal};
use crate::rules::{self, ConversionRule, RemoteConfig, RuleSet};
use crate::schedule::{TaskHandle, Ticker};
use crate::session::Session;
use crate::transport::{DeliveryError, Transport};

/// Failures that abort initialization. Anything else degrades: the
/// tracker comes up and logs what it had to do without.
#[derive(Debug)]
pub enum InitError {
    Config(ConfigError),
    /// The collector answered the configuration fetch with `success: false`.
    ConfigRejected,
    /// The page is not covered by the domain the token is registered for.
    DomainMismatch { domain: String },
    Transport(DeliveryError),
}

impl fmt::Display for InitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InitError::Config(e) => write!(f, "invalid configuration: {}", e),
            InitError::ConfigRejected => write!(f, "collector rejected the tracker token"),
            InitError::DomainMismatch { domain } => {
                write!(f, "page not covered by configured domain '{}'", domain)
            }
            InitError::Transport(e) => write!(f, "transport setup failed: {}", e),
        }
    }
}

impl std::error::Error for InitError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            InitError::Config(e) => Some(e),
            InitError::Transport(e) => Some(e),
            _ => None,
        }
    }
}

impl From<ConfigError> for InitError {
    fn from(e: ConfigError) -> Self {
        InitError::Config(e)
    }
}

impl From<DeliveryError> for InitError {
    fn from(e: DeliveryError) -> Self {
        InitError::Transport(e)
    }
}

pub struct Tracker {
    inner: Arc<TrackerInner>,
    signal_tx: mpsc::UnboundedSender<HostSignal>,
    signal_loop: TaskHandle,
}

struct TrackerInner {
    config: Config,
    hooks: HostHooks,
    session: Arc<Session>,
    builder: EventBuilder,
    transport: Transport,
    rules: RuleSet,
    /// Do-not-track was honored: every event is discarded before it is
    /// built, and the collector is never contacted.
    inert: bool,
    ping_ticker: Mutex<Option<Ticker>>,
    retry_ticker: Mutex<Option<Ticker>>,
    destroyed: AtomicBool,
}

impl Tracker {
    /// Bring the agent up: honor do-not-track, fetch conversion rules,
    /// build the transport, start the session and emit the initial events,
    /// then start the timers and the signal loop.
    pub async fn init(config: Config, hooks: HostHooks) -> Result<Tracker, InitError> {
        let inert = config.respect_dnt && hooks.page.do_not_track();

        let rules = if inert {
            RuleSet::default()
        } else {
            match RemoteConfig::fetch(&config.endpoint, &config.token).await {
                Ok(remote) => {
                    if !remote.success {
                        return Err(InitError::ConfigRejected);
                    }
                    let page_url = hooks.page.current_url();
                    if !rules::verify_domain(&page_url, &remote.domain) {
                        return Err(InitError::DomainMismatch {
                            domain: remote.domain,
                        });
                    }
                    let rules = RuleSet::compile(remote.conversion_rules);
                    debug!(rules = rules.len(), domain = %remote.domain, "remote configuration loaded");
                    rules
                }
                Err(e) => {
                    warn!(error = %e, "configuration fetch failed, continuing without conversion rules");
                    RuleSet::default()
                }
            }
        };

        let transport = Transport::new(&config)?;
        let session = Arc::new(Session::new());
        let builder = EventBuilder::new(&config, session.clone(), hooks.clone());

        let inner = Arc::new(TrackerInner {
            config,
            hooks,
            session,
            builder,
            transport,
            rules,
            inert,
            ping_ticker: Mutex::new(None),
            retry_ticker: Mutex::new(None),
            destroyed: AtomicBool::new(false),
        });

        let (signal_tx, signal_rx) = mpsc::unbounded_channel();
        let signal_loop = TaskHandle::spawn(run_signals(inner.clone(), signal_rx));
        let tracker = Tracker {
            inner: inner.clone(),
            signal_tx,
            signal_loop,
        };

        if inert {
            info!("do-not-track set, tracker inert");
            return Ok(tracker);
        }

        let geo = &inner.config.geolocation;
        if geo.enabled && geo.prompt_on_load {
            if let Err(e) = inner.hooks.geolocation.request_permission().await {
                debug!(error = %e, "location permission request failed");
            }
        }

        let session_id = inner.session.start();
        info!(
            endpoint = %inner.config.endpoint,
            mode = inner.transport.mode(),
            session_id = %session_id,
            "tracker initialized"
        );

        inner.emit(EventKind::SessionStart, Payload::new()).await;
        if inner.config.auto_track {
            inner.page_view(Payload::new()).await;
        } else {
            // No initial page view, so the landing URL is checked here.
            let url = inner.hooks.page.current_url();
            inner.evaluate_url_rules(&url).await;
        }

        inner.start_timers();
        Ok(tracker)
    }

    /// Sender half of the host-signal channel. The host's platform glue
    /// (navigation observer, visibility and connectivity listeners, click
    /// capture) pushes notifications here.
    pub fn signals(&self) -> mpsc::UnboundedSender<HostSignal> {
        self.signal_tx.clone()
    }

    /// Track a named event. Canonical names map to their own types;
    /// anything else is classified as a click and keeps its name in the
    /// `action` field.
    pub async fn track(&self, name: &str, data: Payload) {
        if self.stopped() {
            return;
        }
        let kind = EventKind::classify(name);
        let mut data = data;
        if kind == EventKind::Click && name != EventKind::Click.wire_name() {
            data.entry("action".to_string())
                .or_insert_with(|| Value::String(name.to_string()));
        }
        self.inner.emit(kind, data).await;
    }

    /// Track a page view and evaluate URL conversion rules against it.
    pub async fn page_view(&self, data: Payload) {
        if self.stopped() {
            return;
        }
        self.inner.page_view(data).await;
    }

    /// Track a conversion by name, outside any fetched rule.
    pub async fn conversion(&self, name: &str, data: Payload) {
        if self.stopped() {
            return;
        }
        let mut payload = Payload::new();
        payload.insert("conversion_name".to_string(), Value::String(name.to_string()));
        payload.extend(data);
        self.inner.emit(EventKind::Conversion, payload).await;
    }

    /// Force a transport flush now.
    pub async fn flush(&self) {
        if self.stopped() {
            return;
        }
        self.inner.transport.flush().await;
    }

    /// Number of undelivered events currently queued.
    pub async fn queue_size(&self) -> usize {
        self.inner.transport.queue_size().await
    }

    pub fn session_id(&self) -> Option<String> {
        self.inner.session.id()
    }

    /// Selectors the host should match click targets against; a hit comes
    /// back as [`HostSignal::Click`] with the selector set.
    pub fn watched_selectors(&self) -> Vec<String> {
        self.inner.rules.watched_selectors()
    }

    pub fn is_inert(&self) -> bool {
        self.inner.inert
    }

    /// Tear down: end the session with a final critical event, flush and
    /// shut down the transport, and cancel every pending timer. Idempotent.
    pub async fn destroy(&self) {
        if self.inner.destroyed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.inner.stop_timers();
        if self.inner.session.is_active() {
            self.inner.emit(EventKind::SessionEnd, Payload::new()).await;
        }
        self.inner.transport.flush().await;
        self.inner.transport.shutdown().await;
        self.inner.session.end();
        self.inner.builder.reset();
        self.signal_loop.cancel();
        info!("tracker destroyed");
    }

    fn stopped(&self) -> bool {
        if self.inner.destroyed.load(Ordering::SeqCst) {
            debug!("tracker destroyed, call ignored");
            return true;
        }
        false
    }
}

async fn run_signals(inner: Arc<TrackerInner>, mut signals: mpsc::UnboundedReceiver<HostSignal>) {
    while let Some(signal) = signals.recv().await {
        inner.handle_signal(signal).await;
    }
}

impl TrackerInner {
    /// Build and hand one event to the transport. Local build failures
    /// (no session, duplicate) are logged and swallowed.
    async fn emit(&self, kind: EventKind, data: Payload) {
        if self.inert {
            debug!(event = kind.wire_name(), "do-not-track set, event discarded");
            return;
        }
        match self.builder.build(kind, data).await {
            Ok(event) => {
                debug!(
                    event = kind.wire_name(),
                    event_id = %event.event_id,
                    "event tracked"
                );
                self.transport.send(event).await;
            }
            Err(e) => debug!(event = kind.wire_name(), reason = %e, "event not produced"),
        }
    }

    async fn page_view(&self, data: Payload) {
        // A route-change override also drives rule evaluation.
        let url = data
            .get("url")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| self.hooks.page.current_url());
        self.emit(EventKind::PageView, data).await;
        self.evaluate_url_rules(&url).await;
    }

    async fn evaluate_url_rules(&self, url: &str) {
        for rule in self.rules.match_url(url) {
            debug!(rule_id = %rule.id, url, "conversion rule matched");
            let mut payload = rule_metadata(rule);
            payload.insert("matched_url".to_string(), Value::String(url.to_string()));
            self.emit(EventKind::Conversion, payload).await;
        }
    }

    async fn handle_signal(&self, signal: HostSignal) {
        if self.destroyed.load(Ordering::SeqCst) {
            return;
        }
        match signal {
            HostSignal::Online => self.transport.set_online(true).await,
            HostSignal::Offline => self.transport.set_online(false).await,
            HostSignal::PageVisible => {
                if let Some(ticker) = &*lock(&self.ping_ticker) {
                    ticker.start();
                }
            }
            HostSignal::PageHidden => {
                if let Some(ticker) = &*lock(&self.ping_ticker) {
                    ticker.stop();
                }
            }
            HostSignal::RouteChanged { url } => {
                if self.config.auto_track && !self.inert {
                    debug!(url = %url, "route changed");
                    let mut data = Payload::new();
                    data.insert("url".to_string(), Value::String(url));
                    self.page_view(data).await;
                }
            }
            HostSignal::Click { selector, data } => self.handle_click(selector, data).await,
            HostSignal::PageUnload => self.page_unload().await,
        }
    }

    async fn handle_click(&self, selector: Option<String>, data: Payload) {
        if let Some(selector) = selector {
            if let Some(rule) = self.rules.match_click(&selector) {
                debug!(rule_id = %rule.id, selector = %selector, "click conversion matched");
                let mut payload = rule_metadata(rule);
                payload.insert("selector".to_string(), Value::String(selector));
                payload.extend(data);
                self.emit(EventKind::Conversion, payload).await;
                return;
            }
            if self.config.auto_track {
                let mut payload = data;
                payload.insert("selector".to_string(), Value::String(selector));
                self.emit(EventKind::Click, payload).await;
            }
        } else if self.config.auto_track {
            self.emit(EventKind::Click, data).await;
        }
    }

    /// Page teardown: both critical events while the session still exists,
    /// a best-effort flush, then the session ends and the timers go.
    async fn page_unload(&self) {
        debug!("page unloading");
        self.emit(EventKind::SessionEnd, Payload::new()).await;
        self.emit(EventKind::PageUnload, Payload::new()).await;
        self.transport.flush().await;
        if let Some(session_id) = self.session.end() {
            debug!(session_id = %session_id, "session ended");
        }
        self.stop_timers();
    }

    async fn ping(&self) {
        self.emit(EventKind::Ping, Payload::new()).await;
    }

    /// Spin up the ping timer and, in direct mode, the queue retry timer.
    /// Closures hold weak references so the timers never keep a destroyed
    /// tracker alive.
    fn start_timers(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        let ping = Ticker::new(self.config.ping_interval, move || {
            spawn_upgraded(&weak, |inner| async move { inner.ping().await });
        });
        ping.start();
        *lock(&self.ping_ticker) = Some(ping);

        if !self.transport.is_background() {
            let weak = Arc::downgrade(self);
            let retry = Ticker::new(self.config.retry_delay, move || {
                spawn_upgraded(&weak, |inner| async move {
                    inner.transport.flush().await;
                });
            });
            retry.start();
            *lock(&self.retry_ticker) = Some(retry);
        }
    }

    fn stop_timers(&self) {
        lock(&self.ping_ticker).take();
        lock(&self.retry_ticker).take();
    }
}

fn spawn_upgraded<F, Fut>(weak: &Weak<TrackerInner>, run: F)
where
    F: FnOnce(Arc<TrackerInner>) -> Fut,
    Fut: std::future::Future<Output = ()> + Send + 'static,
{
    if let Some(inner) = weak.upgrade() {
        tokio::spawn(run(inner));
    }
}

fn rule_metadata(rule: &ConversionRule) -> Payload {
    let mut payload = Payload::new();
    payload.insert("conversion_id".to_string(), Value::String(rule.id.clone()));
    if !rule.name.is_empty() {
        payload.insert(
            "conversion_name".to_string(),
            Value::String(rule.name.clone()),
        );
    }
    payload
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Convenience boundary for hosts that configure through embed-tag
/// attributes: parse, optionally install the debug subscriber, init.
pub async fn auto_init<K, V>(
    attributes: impl IntoIterator<Item = (K, V)>,
    hooks: HostHooks,
) -> Result<Tracker, InitError>
where
    K: AsRef<str>,
    V: AsRef<str>,
{
    let config = Config::from_attributes(attributes)?;
    if config.debug {
        crate::init_debug_logging();
    }
    Tracker::init(config, hooks).await
}
