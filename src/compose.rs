//! Event construction. Turns a semantic event kind plus caller data into
//! a fully-formed [`Event`]: session identity, page context, UTM
//! attribution, timing metrics and optional geolocation, with caller
//! data taking precedence over anything computed. Also the dedup gate.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use serde_json::Value;
use tracing::debug;
use url::Url;

use crate::config::{Config, GeoConfig};
use crate::dedupe::DedupRegistry;
use crate::event::{Event, EventKind, Payload};
use crate::host::{GeoPosition, GeoRequest, HostHooks};
use crate::session::Session;

/// Storage keys for attribution carried across navigations.
const UTM_STORAGE_KEY: &str = "pagewire:utm";
const GEO_STORAGE_KEY: &str = "pagewire:geo";

/// Local reasons an event was not produced. Neither reaches the
/// transport; both are logged and swallowed by the tracker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventError {
    NoActiveSession,
    DuplicateEvent,
}

impl fmt::Display for EventError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EventError::NoActiveSession => write!(f, "no active session"),
            EventError::DuplicateEvent => write!(f, "duplicate event suppressed"),
        }
    }
}

impl std::error::Error for EventError {}

pub struct EventBuilder {
    token: String,
    geo: GeoConfig,
    session: Arc<Session>,
    hooks: HostHooks,
    dedup: DedupRegistry,
}

impl EventBuilder {
    pub fn new(config: &Config, session: Arc<Session>, hooks: HostHooks) -> Self {
        Self {
            token: config.token.clone(),
            geo: config.geolocation.clone(),
            session,
            hooks,
            dedup: DedupRegistry::new(),
        }
    }

    /// Assemble one event. Fails locally when no session is active or when
    /// an identical event (kind, timestamp, payload) was built within the
    /// dedup window.
    pub async fn build(&self, kind: EventKind, data: Payload) -> Result<Event, EventError> {
        let Some(session_id) = self.session.id() else {
            return Err(EventError::NoActiveSession);
        };

        let mut payload = self.enrich();
        // Only session starts and conversions are worth a location fix.
        if matches!(kind, EventKind::SessionStart | EventKind::Conversion) {
            if let Some(position) = self.geolocate().await {
                if let Ok(value) = serde_json::to_value(position) {
                    payload.insert("geolocation".to_string(), value);
                }
            }
        }
        payload.extend(data);

        let event = Event::new(kind, session_id, self.token.clone(), payload);
        if !self.dedup.register(&event.dedup_key()) {
            return Err(EventError::DuplicateEvent);
        }
        Ok(event)
    }

    /// Drop all pending dedup entries and their expiry timers.
    pub fn reset(&self) {
        self.dedup.clear();
    }

    fn enrich(&self) -> Payload {
        let mut payload = Payload::new();
        let url = self.hooks.page.current_url();
        payload.insert("url".to_string(), Value::String(url.clone()));
        if let Some(referrer) = self.hooks.page.referrer().filter(|r| !r.is_empty()) {
            payload.insert("referrer".to_string(), Value::String(referrer));
        }
        if let Some(title) = self.hooks.page.title().filter(|t| !t.is_empty()) {
            payload.insert("title".to_string(), Value::String(title));
        }
        if let Some(timing) = self.hooks.page.timing() {
            if let Some(ms) = timing.load_time_ms {
                payload.insert("load_time_ms".to_string(), Value::from(ms));
            }
            if let Some(bytes) = timing.transfer_bytes {
                payload.insert("transfer_bytes".to_string(), Value::from(bytes));
            }
        }
        for (key, value) in self.utm_parameters(&url) {
            payload.insert(key, Value::String(value));
        }
        payload
    }

    /// UTM parameters from the current URL, persisted so later pages in
    /// the session keep the original attribution after the query is gone.
    fn utm_parameters(&self, url: &str) -> BTreeMap<String, String> {
        let mut from_url = BTreeMap::new();
        if let Ok(parsed) = Url::parse(url) {
            for (key, value) in parsed.query_pairs() {
                if key.starts_with("utm_") {
                    from_url.insert(key.into_owned(), value.into_owned());
                }
            }
        }
        if !from_url.is_empty() {
            if let Ok(serialized) = serde_json::to_string(&from_url) {
                self.hooks.storage.set(UTM_STORAGE_KEY, &serialized);
            }
            return from_url;
        }
        self.hooks
            .storage
            .get(UTM_STORAGE_KEY)
            .and_then(|stored| serde_json::from_str(&stored).ok())
            .unwrap_or_default()
    }

    /// Resolve a location fix, if enabled: cached value first, otherwise a
    /// provider lookup raced against the configured timeout. Never fails
    /// the event; a miss just means no location.
    async fn geolocate(&self) -> Option<GeoPosition> {
        if !self.geo.enabled {
            return None;
        }
        if let Some(cached) = self.hooks.storage.get(GEO_STORAGE_KEY) {
            match serde_json::from_str::<GeoPosition>(&cached) {
                Ok(position) => return Some(position),
                Err(_) => self.hooks.storage.remove(GEO_STORAGE_KEY),
            }
        }
        let request = GeoRequest {
            high_accuracy: self.geo.high_accuracy,
            allow_prompt: self.geo.request_permission,
            timeout: self.geo.timeout,
        };
        let lookup = self.hooks.geolocation.current_position(request);
        match tokio::time::timeout(self.geo.timeout, lookup).await {
            Ok(Ok(position)) => {
                if let Ok(serialized) = serde_json::to_string(&position) {
                    self.hooks.storage.set(GEO_STORAGE_KEY, &serialized);
                }
                Some(position)
            }
            Ok(Err(e)) => {
                debug!(error = %e, "geolocation lookup failed");
                None
            }
            Err(_) => {
                debug!(
                    timeout_ms = self.geo.timeout.as_millis() as u64,
                    "geolocation lookup timed out"
                );
                None
            }
        }
    }
}
