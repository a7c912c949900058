//! Host-environment seams. The embedding application drives the agent
//! through a [`HostSignal`] stream and a small set of collaborator traits;
//! the agent never touches a DOM, a history API, or a permissions prompt
//! itself. Inert defaults are provided for hosts (and tests) that lack a
//! facility.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::event::Payload;

/// Platform notifications the host feeds into [`crate::Tracker::signals`].
/// Delivery is FIFO per sender; the agent never polls the platform.
#[derive(Clone, Debug)]
pub enum HostSignal {
    /// Network came back; flips the transport online and triggers a flush.
    Online,
    /// Network lost; only flips the flag.
    Offline,
    /// Page became visible; resumes the ping timer.
    PageVisible,
    /// Page was hidden; stops the ping timer.
    PageHidden,
    /// Route change observed by the host's navigation observer.
    RouteChanged { url: String },
    /// A click happened. When the host matched it against one of
    /// [`crate::Tracker::watched_selectors`], `selector` names the match and
    /// the click becomes a conversion; otherwise it is a plain click event.
    Click {
        selector: Option<String>,
        data: Payload,
    },
    /// The page is being torn down. Emits the critical unload events and
    /// ends the session.
    PageUnload,
}

/// Navigation timing and byte accounting for the current page, when the
/// host platform can measure it.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct PageTiming {
    pub load_time_ms: Option<u64>,
    pub transfer_bytes: Option<u64>,
}

/// Read-only view of the page the agent is embedded in.
pub trait PageContext: Send + Sync {
    fn current_url(&self) -> String;
    fn referrer(&self) -> Option<String>;
    fn title(&self) -> Option<String>;
    /// The platform's do-not-track signal.
    fn do_not_track(&self) -> bool {
        false
    }
    fn timing(&self) -> Option<PageTiming> {
        None
    }
}

/// A geographic fix produced by the host's geolocation facility.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct GeoPosition {
    pub latitude: f64,
    pub longitude: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub accuracy: Option<f64>,
}

#[derive(Debug, Clone)]
pub enum GeoError {
    PermissionDenied,
    Unavailable(String),
}

impl fmt::Display for GeoError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GeoError::PermissionDenied => write!(f, "geolocation permission denied"),
            GeoError::Unavailable(msg) => write!(f, "geolocation unavailable: {}", msg),
        }
    }
}

impl std::error::Error for GeoError {}

/// Hints forwarded to the provider for a single lookup.
#[derive(Clone, Copy, Debug)]
pub struct GeoRequest {
    pub high_accuracy: bool,
    /// Whether this lookup may surface a permission prompt to the user.
    pub allow_prompt: bool,
    pub timeout: Duration,
}

/// Host geolocation facility. Lookups are raced against the configured
/// timeout; a slow provider loses the race and its result is discarded.
#[async_trait]
pub trait GeolocationProvider: Send + Sync {
    async fn current_position(&self, request: GeoRequest) -> Result<GeoPosition, GeoError>;

    /// Ask the platform for permission ahead of time. Default is a no-op.
    async fn request_permission(&self) -> Result<(), GeoError> {
        Ok(())
    }
}

/// Session-scoped key-value storage the host provides, used to carry UTM
/// attribution and cached geolocation across navigations.
pub trait PageStorage: Send + Sync {
    fn get(&self, key: &str) -> Option<String>;
    fn set(&self, key: &str, value: &str);
    fn remove(&self, key: &str);
}

/// Everything the agent needs from its host, bundled for `Tracker::init`.
#[derive(Clone)]
pub struct HostHooks {
    pub page: Arc<dyn PageContext>,
    pub storage: Arc<dyn PageStorage>,
    pub geolocation: Arc<dyn GeolocationProvider>,
}

impl Default for HostHooks {
    fn default() -> Self {
        Self {
            page: Arc::new(StaticPage::new("http://localhost/")),
            storage: Arc::new(MemoryStorage::new()),
            geolocation: Arc::new(NullGeolocation),
        }
    }
}

/// Geolocation stub for hosts without a facility: every lookup fails.
pub struct NullGeolocation;

#[async_trait]
impl GeolocationProvider for NullGeolocation {
    async fn current_position(&self, _request: GeoRequest) -> Result<GeoPosition, GeoError> {
        Err(GeoError::Unavailable("no geolocation facility".into()))
    }
}

/// In-process storage, the default when the host offers nothing better.
#[derive(Default)]
pub struct MemoryStorage {
    inner: Mutex<HashMap<String, String>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

impl PageStorage for MemoryStorage {
    fn get(&self, key: &str) -> Option<String> {
        lock_or_recover(&self.inner).get(key).cloned()
    }

    fn set(&self, key: &str, value: &str) {
        lock_or_recover(&self.inner).insert(key.to_string(), value.to_string());
    }

    fn remove(&self, key: &str) {
        lock_or_recover(&self.inner).remove(key);
    }
}

/// Page context backed by plain values. Hosts with a real page update the
/// URL on navigation; tests drive it directly.
pub struct StaticPage {
    url: Mutex<String>,
    referrer: Option<String>,
    title: Option<String>,
    do_not_track: bool,
    timing: Option<PageTiming>,
}

impl StaticPage {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: Mutex::new(url.into()),
            referrer: None,
            title: None,
            do_not_track: false,
            timing: None,
        }
    }

    pub fn with_referrer(mut self, referrer: impl Into<String>) -> Self {
        self.referrer = Some(referrer.into());
        self
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }

    pub fn with_do_not_track(mut self, dnt: bool) -> Self {
        self.do_not_track = dnt;
        self
    }

    pub fn with_timing(mut self, timing: PageTiming) -> Self {
        self.timing = Some(timing);
        self
    }

    /// Update the current URL, as a navigation observer would after a route
    /// change.
    pub fn set_url(&self, url: impl Into<String>) {
        *lock_or_recover(&self.url) = url.into();
    }
}

impl PageContext for StaticPage {
    fn current_url(&self) -> String {
        lock_or_recover(&self.url).clone()
    }

    fn referrer(&self) -> Option<String> {
        self.referrer.clone()
    }

    fn title(&self) -> Option<String> {
        self.title.clone()
    }

    fn do_not_track(&self) -> bool {
        self.do_not_track
    }

    fn timing(&self) -> Option<PageTiming> {
        self.timing
    }
}

fn lock_or_recover<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
