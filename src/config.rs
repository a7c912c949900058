use std::fmt;
use std::time::Duration;

use tracing::debug;
use url::Url;

pub const DEFAULT_PING_INTERVAL: Duration = Duration::from_secs(15);
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(5);
pub const DEFAULT_MAX_RETRIES: u32 = 3;
pub const DEFAULT_BATCH_SIZE: usize = 10;
pub const DEFAULT_BATCH_INTERVAL: Duration = Duration::from_millis(5000);
pub const DEFAULT_GEO_TIMEOUT: Duration = Duration::from_millis(10_000);

/// Errors that make a configuration unusable. All of them are fatal to
/// initialization: the agent logs them and sends nothing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    MissingToken,
    MissingEndpoint,
    InvalidEndpoint { given: String, reason: String },
    InvalidValue { key: String, given: String },
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::MissingToken => write!(f, "tracker token is required"),
            ConfigError::MissingEndpoint => write!(f, "collector endpoint is required"),
            ConfigError::InvalidEndpoint { given, reason } => {
                write!(f, "invalid collector endpoint '{}': {}", given, reason)
            }
            ConfigError::InvalidValue { key, given } => {
                write!(f, "invalid value '{}' for option '{}'", given, key)
            }
        }
    }
}

impl std::error::Error for ConfigError {}

/// Geolocation enrichment settings.
#[derive(Debug, Clone)]
pub struct GeoConfig {
    /// Attempt lookups at all. Off by default.
    pub enabled: bool,
    /// Whether a lookup may trigger a host permission prompt.
    pub request_permission: bool,
    /// Upper bound on a lookup; slower lookups lose the race and the event
    /// ships without location.
    pub timeout: Duration,
    /// Passed through to the provider.
    pub high_accuracy: bool,
    /// Fire a permission request during init instead of on first lookup.
    pub prompt_on_load: bool,
}

impl Default for GeoConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            request_permission: false,
            timeout: DEFAULT_GEO_TIMEOUT,
            high_accuracy: false,
            prompt_on_load: false,
        }
    }
}

/// Validated runtime settings. Construct through [`Config::builder`] or
/// [`Config::from_attributes`]; both validate and normalize.
#[derive(Debug, Clone)]
pub struct Config {
    /// Per-site API key, sent with every request in the `X-Tracker-Token`
    /// header.
    pub token: String,
    /// Collector base URL, normalized with at most one trailing slash
    /// stripped.
    pub endpoint: String,
    pub ping_interval: Duration,
    pub debug: bool,
    /// Automatically emit page views on init and route changes, and plain
    /// click events for unmatched click reports.
    pub auto_track: bool,
    /// Honor the host's do-not-track signal; a set signal makes the whole
    /// agent inert.
    pub respect_dnt: bool,
    /// Delivery attempts per queue entry before it is dropped.
    pub max_retries: u32,
    /// Cadence of the direct-queue retry flush tick.
    pub retry_delay: Duration,
    /// Route delivery through the background worker. When false, or when
    /// the worker cannot be spawned, everything goes through direct mode.
    pub background_delivery: bool,
    /// Worker batch threshold; reaching it flushes immediately.
    pub batch_size: usize,
    /// Worker flush timer period.
    pub batch_interval: Duration,
    pub geolocation: GeoConfig,
}

impl Config {
    pub fn builder(token: impl Into<String>, endpoint: impl Into<String>) -> ConfigBuilder {
        ConfigBuilder::new(token, endpoint)
    }

    /// Build a config from a flat attribute map, the shape hosts scrape off
    /// an embed tag. Keys are kebab-case, with or without a `data-` prefix;
    /// an empty value means a bare boolean attribute. Unknown keys are
    /// ignored with a debug log; malformed values are errors.
    pub fn from_attributes<K, V>(attrs: impl IntoIterator<Item = (K, V)>) -> Result<Config, ConfigError>
    where
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let mut token = None;
        let mut endpoint = None;
        let mut builder_opts = AttributeOptions::default();

        for (key, value) in attrs {
            let key = key.as_ref();
            let key = key.strip_prefix("data-").unwrap_or(key);
            let value = value.as_ref();
            match key {
                "token" => token = Some(value.to_string()),
                "endpoint" => endpoint = Some(value.to_string()),
                "ping-interval" => builder_opts.ping_interval = Some(parse_millis(key, value)?),
                "debug" => builder_opts.debug = Some(parse_flag(key, value)?),
                "auto-track" => builder_opts.auto_track = Some(parse_flag(key, value)?),
                "respect-dnt" => builder_opts.respect_dnt = Some(parse_flag(key, value)?),
                "max-retries" => builder_opts.max_retries = Some(parse_number(key, value)?),
                "retry-delay" => builder_opts.retry_delay = Some(parse_millis(key, value)?),
                "disable-worker" => {
                    builder_opts.background_delivery = Some(!parse_flag(key, value)?)
                }
                "batch-size" => builder_opts.batch_size = Some(parse_number::<usize>(key, value)?),
                "batch-interval" => builder_opts.batch_interval = Some(parse_millis(key, value)?),
                "enable-geolocation" => builder_opts.geo_enabled = Some(parse_flag(key, value)?),
                "request-geolocation" => builder_opts.geo_request = Some(parse_flag(key, value)?),
                "geolocation-timeout" => builder_opts.geo_timeout = Some(parse_millis(key, value)?),
                "high-accuracy" => builder_opts.geo_high_accuracy = Some(parse_flag(key, value)?),
                "prompt-on-load" => builder_opts.geo_prompt_on_load = Some(parse_flag(key, value)?),
                other => debug!(key = other, "ignoring unrecognized tracker attribute"),
            }
        }

        let token = token.ok_or(ConfigError::MissingToken)?;
        let endpoint = endpoint.ok_or(ConfigError::MissingEndpoint)?;
        let mut builder = ConfigBuilder::new(token, endpoint);
        builder_opts.apply(&mut builder);
        builder.build()
    }
}

#[derive(Default)]
struct AttributeOptions {
    ping_interval: Option<Duration>,
    debug: Option<bool>,
    auto_track: Option<bool>,
    respect_dnt: Option<bool>,
    max_retries: Option<u32>,
    retry_delay: Option<Duration>,
    background_delivery: Option<bool>,
    batch_size: Option<usize>,
    batch_interval: Option<Duration>,
    geo_enabled: Option<bool>,
    geo_request: Option<bool>,
    geo_timeout: Option<Duration>,
    geo_high_accuracy: Option<bool>,
    geo_prompt_on_load: Option<bool>,
}

impl AttributeOptions {
    fn apply(self, builder: &mut ConfigBuilder) {
        if let Some(v) = self.ping_interval {
            builder.config.ping_interval = v;
        }
        if let Some(v) = self.debug {
            builder.config.debug = v;
        }
        if let Some(v) = self.auto_track {
            builder.config.auto_track = v;
        }
        if let Some(v) = self.respect_dnt {
            builder.config.respect_dnt = v;
        }
        if let Some(v) = self.max_retries {
            builder.config.max_retries = v;
        }
        if let Some(v) = self.retry_delay {
            builder.config.retry_delay = v;
        }
        if let Some(v) = self.background_delivery {
            builder.config.background_delivery = v;
        }
        if let Some(v) = self.batch_size {
            builder.config.batch_size = v;
        }
        if let Some(v) = self.batch_interval {
            builder.config.batch_interval = v;
        }
        if let Some(v) = self.geo_enabled {
            builder.config.geolocation.enabled = v;
        }
        if let Some(v) = self.geo_request {
            builder.config.geolocation.request_permission = v;
        }
        if let Some(v) = self.geo_timeout {
            builder.config.geolocation.timeout = v;
        }
        if let Some(v) = self.geo_high_accuracy {
            builder.config.geolocation.high_accuracy = v;
        }
        if let Some(v) = self.geo_prompt_on_load {
            builder.config.geolocation.prompt_on_load = v;
        }
    }
}

/// Builder with documented defaults; `build` validates token and endpoint.
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    fn new(token: impl Into<String>, endpoint: impl Into<String>) -> Self {
        Self {
            config: Config {
                token: token.into(),
                endpoint: endpoint.into(),
                ping_interval: DEFAULT_PING_INTERVAL,
                debug: false,
                auto_track: true,
                respect_dnt: true,
                max_retries: DEFAULT_MAX_RETRIES,
                retry_delay: DEFAULT_RETRY_DELAY,
                background_delivery: true,
                batch_size: DEFAULT_BATCH_SIZE,
                batch_interval: DEFAULT_BATCH_INTERVAL,
                geolocation: GeoConfig::default(),
            },
        }
    }

    pub fn ping_interval(mut self, interval: Duration) -> Self {
        self.config.ping_interval = interval;
        self
    }

    pub fn debug(mut self, debug: bool) -> Self {
        self.config.debug = debug;
        self
    }

    pub fn auto_track(mut self, auto_track: bool) -> Self {
        self.config.auto_track = auto_track;
        self
    }

    pub fn respect_dnt(mut self, respect: bool) -> Self {
        self.config.respect_dnt = respect;
        self
    }

    pub fn max_retries(mut self, retries: u32) -> Self {
        self.config.max_retries = retries;
        self
    }

    pub fn retry_delay(mut self, delay: Duration) -> Self {
        self.config.retry_delay = delay;
        self
    }

    pub fn background_delivery(mut self, enabled: bool) -> Self {
        self.config.background_delivery = enabled;
        self
    }

    pub fn batch_size(mut self, size: usize) -> Self {
        self.config.batch_size = size;
        self
    }

    pub fn batch_interval(mut self, interval: Duration) -> Self {
        self.config.batch_interval = interval;
        self
    }

    pub fn geolocation(mut self, geo: GeoConfig) -> Self {
        self.config.geolocation = geo;
        self
    }

    pub fn build(mut self) -> Result<Config, ConfigError> {
        if self.config.token.trim().is_empty() {
            return Err(ConfigError::MissingToken);
        }
        if self.config.endpoint.trim().is_empty() {
            return Err(ConfigError::MissingEndpoint);
        }
        self.config.endpoint = normalize_endpoint(&self.config.endpoint)?;
        self.config.batch_size = self.config.batch_size.max(1);
        Ok(self.config)
    }
}

/// Validate the endpoint as an absolute http(s) URL and strip at most one
/// trailing slash.
fn normalize_endpoint(endpoint: &str) -> Result<String, ConfigError> {
    let parsed = Url::parse(endpoint).map_err(|e| ConfigError::InvalidEndpoint {
        given: endpoint.to_string(),
        reason: e.to_string(),
    })?;
    match parsed.scheme() {
        "http" | "https" => {}
        other => {
            return Err(ConfigError::InvalidEndpoint {
                given: endpoint.to_string(),
                reason: format!("unsupported scheme '{}'", other),
            })
        }
    }
    Ok(endpoint
        .strip_suffix('/')
        .unwrap_or(endpoint)
        .to_string())
}

fn parse_flag(key: &str, value: &str) -> Result<bool, ConfigError> {
    match value {
        // a bare attribute carries no value and means "on"
        "" | "true" | "1" | "yes" => Ok(true),
        "false" | "0" | "no" => Ok(false),
        other => Err(ConfigError::InvalidValue {
            key: key.to_string(),
            given: other.to_string(),
        }),
    }
}

fn parse_number<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
    value.parse().map_err(|_| ConfigError::InvalidValue {
        key: key.to_string(),
        given: value.to_string(),
    })
}

fn parse_millis(key: &str, value: &str) -> Result<Duration, ConfigError> {
    parse_number::<u64>(key, value).map(Duration::from_millis)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_applies_documented_defaults() {
        let config = Config::builder("abc123", "https://collect.example/api").build().unwrap();
        assert_eq!(config.ping_interval, DEFAULT_PING_INTERVAL);
        assert!(config.auto_track);
        assert!(config.respect_dnt);
        assert!(config.background_delivery);
        assert_eq!(config.max_retries, DEFAULT_MAX_RETRIES);
        assert_eq!(config.batch_size, DEFAULT_BATCH_SIZE);
        assert_eq!(config.batch_interval, DEFAULT_BATCH_INTERVAL);
        assert!(!config.geolocation.enabled);
        assert_eq!(config.geolocation.timeout, DEFAULT_GEO_TIMEOUT);
    }

    #[test]
    fn endpoint_trailing_slash_is_stripped_once() {
        let config = Config::builder("t", "https://collect.example/api/v1/events/")
            .build()
            .unwrap();
        assert_eq!(config.endpoint, "https://collect.example/api/v1/events");
    }

    #[test]
    fn missing_token_is_fatal() {
        let err = Config::builder("   ", "https://collect.example").build().unwrap_err();
        assert_eq!(err, ConfigError::MissingToken);
    }

    #[test]
    fn non_http_endpoint_is_rejected() {
        let err = Config::builder("t", "ftp://collect.example").build().unwrap_err();
        assert!(matches!(err, ConfigError::InvalidEndpoint { .. }));
    }

    #[test]
    fn relative_endpoint_is_rejected() {
        let err = Config::builder("t", "/just/a/path").build().unwrap_err();
        assert!(matches!(err, ConfigError::InvalidEndpoint { .. }));
    }

    #[test]
    fn attributes_parse_documented_keys() {
        let config = Config::from_attributes([
            ("data-token", "abc123"),
            ("data-endpoint", "https://collect.example/v1/"),
            ("data-ping-interval", "30000"),
            ("data-debug", ""),
            ("data-auto-track", "false"),
            ("data-disable-worker", "true"),
            ("data-enable-geolocation", "true"),
            ("data-geolocation-timeout", "2500"),
        ])
        .unwrap();

        assert_eq!(config.token, "abc123");
        assert_eq!(config.endpoint, "https://collect.example/v1");
        assert_eq!(config.ping_interval, Duration::from_millis(30_000));
        assert!(config.debug);
        assert!(!config.auto_track);
        assert!(!config.background_delivery);
        assert!(config.geolocation.enabled);
        assert_eq!(config.geolocation.timeout, Duration::from_millis(2500));
    }

    #[test]
    fn attributes_accept_unprefixed_keys_and_ignore_unknown() {
        let config = Config::from_attributes([
            ("token", "t"),
            ("endpoint", "http://127.0.0.1:9"),
            ("charset", "utf-8"),
        ])
        .unwrap();
        assert_eq!(config.token, "t");
    }

    #[test]
    fn malformed_attribute_values_are_errors() {
        let err = Config::from_attributes([
            ("token", "t"),
            ("endpoint", "http://127.0.0.1:9"),
            ("max-retries", "lots"),
        ])
        .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { .. }));

        let err = Config::from_attributes([
            ("token", "t"),
            ("endpoint", "http://127.0.0.1:9"),
            ("debug", "maybe"),
        ])
        .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { .. }));
    }

    #[test]
    fn attributes_missing_token_or_endpoint_are_fatal() {
        let err = Config::from_attributes([("endpoint", "http://127.0.0.1:9")]).unwrap_err();
        assert_eq!(err, ConfigError::MissingToken);

        let err = Config::from_attributes([("token", "t")]).unwrap_err();
        assert_eq!(err, ConfigError::MissingEndpoint);
    }

    #[test]
    fn batch_size_is_clamped_to_at_least_one() {
        let config = Config::builder("t", "http://127.0.0.1:9")
            .batch_size(0)
            .build()
            .unwrap();
        assert_eq!(config.batch_size, 1);
    }
}
