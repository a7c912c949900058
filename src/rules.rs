//! Conversion rules. A one-time configuration fetch at startup returns
//! the site's rule list and allowed domain; URL rules are evaluated
//! against every page view, click rules become watched selectors the
//! host matches against click targets.

use std::fmt;
use std::time::Duration;

use regex::Regex;
use serde::Deserialize;
use tracing::{debug, warn};
use url::Url;

const CONFIG_FETCH_TIMEOUT: Duration = Duration::from_secs(10);

/// Response of `<endpoint>/keys/config`.
#[derive(Debug, Clone, Deserialize)]
pub struct RemoteConfig {
    pub success: bool,
    /// Domain the token is valid for. Empty or `"*"` means unrestricted;
    /// a `*.` prefix allows subdomains.
    #[serde(default)]
    pub domain: String,
    #[serde(default)]
    pub conversion_rules: Vec<ConversionRule>,
}

impl RemoteConfig {
    /// One-time fetch of the site configuration. The token rides in the
    /// query here, not the header; this is the one collector call that
    /// predates the delivery transport.
    pub async fn fetch(endpoint: &str, token: &str) -> Result<RemoteConfig, RulesError> {
        let client = reqwest::Client::builder()
            .timeout(CONFIG_FETCH_TIMEOUT)
            .redirect(reqwest::redirect::Policy::none())
            .build()?;
        let url = format!(
            "{}/keys/config?api_key={}",
            endpoint,
            urlencoding::encode(token)
        );
        debug!(endpoint, "fetching remote configuration");
        let response = client.get(&url).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(RulesError::Status(status.as_u16()));
        }
        Ok(response.json::<RemoteConfig>().await?)
    }
}

#[derive(Debug)]
pub enum RulesError {
    Http(reqwest::Error),
    Status(u16),
}

impl fmt::Display for RulesError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RulesError::Http(e) => write!(f, "configuration fetch failed: {}", e),
            RulesError::Status(status) => {
                write!(f, "configuration fetch answered status {}", status)
            }
        }
    }
}

impl std::error::Error for RulesError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            RulesError::Http(e) => Some(e),
            RulesError::Status(_) => None,
        }
    }
}

impl From<reqwest::Error> for RulesError {
    fn from(e: reqwest::Error) -> Self {
        RulesError::Http(e)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleKind {
    Url,
    Click,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchKind {
    #[default]
    Exact,
    Contains,
    StartsWith,
    EndsWith,
    Regex,
}

/// One operator-defined conversion condition, immutable once fetched.
#[derive(Debug, Clone, Deserialize)]
pub struct ConversionRule {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: RuleKind,
    #[serde(default)]
    pub match_type: MatchKind,
    #[serde(default)]
    pub pattern: String,
    pub selector: Option<String>,
    #[serde(default)]
    pub name: String,
}

struct UrlRule {
    rule: ConversionRule,
    /// Compiled up front so a bad pattern costs one warning, not one per
    /// page view.
    regex: Option<Regex>,
}

impl UrlRule {
    fn matches(&self, url: &str, path: &str) -> bool {
        let pattern = &self.rule.pattern;
        match self.rule.match_type {
            MatchKind::Exact => path == pattern || url == pattern,
            MatchKind::Contains => url.contains(pattern.as_str()) || path.contains(pattern.as_str()),
            MatchKind::StartsWith => path.starts_with(pattern) || url.starts_with(pattern),
            MatchKind::EndsWith => path.ends_with(pattern) || url.ends_with(pattern),
            MatchKind::Regex => self
                .regex
                .as_ref()
                .is_some_and(|re| re.is_match(url) || re.is_match(path)),
        }
    }
}

/// Fetched rules in evaluation-ready form.
#[derive(Default)]
pub struct RuleSet {
    url_rules: Vec<UrlRule>,
    click_rules: Vec<ConversionRule>,
}

impl RuleSet {
    /// Partition and compile fetched rules. Unusable rules (empty URL
    /// pattern, click rule without a selector, invalid regex) are skipped
    /// with a warning rather than failing startup.
    pub fn compile(rules: Vec<ConversionRule>) -> RuleSet {
        let mut set = RuleSet::default();
        for rule in rules {
            match rule.kind {
                RuleKind::Url => {
                    if rule.pattern.is_empty() {
                        warn!(rule_id = %rule.id, "url rule without a pattern, skipping");
                        continue;
                    }
                    let regex = if rule.match_type == MatchKind::Regex {
                        match Regex::new(&rule.pattern) {
                            Ok(re) => Some(re),
                            Err(e) => {
                                warn!(
                                    rule_id = %rule.id,
                                    error = %e,
                                    "invalid regex in conversion rule, skipping"
                                );
                                continue;
                            }
                        }
                    } else {
                        None
                    };
                    set.url_rules.push(UrlRule { rule, regex });
                }
                RuleKind::Click => {
                    if rule.selector.as_deref().unwrap_or("").is_empty() {
                        warn!(rule_id = %rule.id, "click rule without a selector, skipping");
                        continue;
                    }
                    set.click_rules.push(rule);
                }
            }
        }
        set
    }

    pub fn len(&self) -> usize {
        self.url_rules.len() + self.click_rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// All URL rules matching the given location. Matching runs against
    /// the full URL as given and against its parsed path, so a pattern of
    /// `/thank-you` fires on `https://site.example/thank-you?x=1` but not
    /// on `/thank-you/`.
    pub fn match_url(&self, url: &str) -> Vec<&ConversionRule> {
        let path = parsed_path(url);
        self.url_rules
            .iter()
            .filter(|rule| rule.matches(url, &path))
            .map(|rule| &rule.rule)
            .collect()
    }

    /// The click rule registered for a selector the host matched.
    pub fn match_click(&self, selector: &str) -> Option<&ConversionRule> {
        self.click_rules
            .iter()
            .find(|rule| rule.selector.as_deref() == Some(selector))
    }

    /// Selectors the host should watch click targets against.
    pub fn watched_selectors(&self) -> Vec<String> {
        self.click_rules
            .iter()
            .filter_map(|rule| rule.selector.clone())
            .collect()
    }
}

fn parsed_path(url: &str) -> String {
    Url::parse(url)
        .map(|parsed| parsed.path().to_string())
        .unwrap_or_else(|_| url.to_string())
}

/// Whether the current page is covered by the configured domain.
pub fn verify_domain(page_url: &str, domain: &str) -> bool {
    if domain.is_empty() || domain == "*" {
        return true;
    }
    let host = match Url::parse(page_url).ok().and_then(|u| u.host_str().map(str::to_lowercase)) {
        Some(host) => host,
        None => return false,
    };
    let domain = domain.to_lowercase();
    if let Some(suffix) = domain.strip_prefix("*.") {
        return host == suffix || host.ends_with(&format!(".{}", suffix));
    }
    host == domain
}
