//! HTTP client for the collector endpoint. One event per request: regular
//! events ride a GET with the payload flattened into the query string,
//! critical events ride a beacon-style POST so they survive page teardown.

use std::time::Duration;

use serde::Deserialize;
use tracing::debug;

use crate::event::Event;

/// Header carrying the site token on every collector request.
pub const TOKEN_HEADER: &str = "X-Tracker-Token";

/// Per-request timeout. Collector calls are small; anything slower than
/// this is treated as a failed attempt and requeued.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug)]
pub enum DeliveryError {
    /// Transport-level failure (DNS, connect, timeout, TLS).
    Http(reqwest::Error),
    /// The collector answered with a non-success status.
    Rejected { status: u16, message: String },
}

impl std::fmt::Display for DeliveryError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeliveryError::Http(e) => write!(f, "http error: {}", e),
            DeliveryError::Rejected { status, message } => {
                write!(f, "collector rejected request ({}): {}", status, message)
            }
        }
    }
}

impl std::error::Error for DeliveryError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            DeliveryError::Http(e) => Some(e),
            DeliveryError::Rejected { .. } => None,
        }
    }
}

impl From<reqwest::Error> for DeliveryError {
    fn from(e: reqwest::Error) -> Self {
        DeliveryError::Http(e)
    }
}

/// Shared HTTP client bound to one collector endpoint and token.
#[derive(Clone)]
pub struct CollectorClient {
    client: reqwest::Client,
    endpoint: String,
    token: String,
}

impl CollectorClient {
    pub fn new(endpoint: &str, token: &str) -> Result<Self, DeliveryError> {
        // Collectors answer in place; a redirect means a misconfigured
        // endpoint, not a destination to chase.
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .redirect(reqwest::redirect::Policy::none())
            .build()?;
        Ok(Self {
            client,
            endpoint: endpoint.to_string(),
            token: token.to_string(),
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Deliver one event, choosing the route by criticality: plain events
    /// go over GET, critical events over the beacon POST.
    pub async fn send(&self, event: &Event) -> Result<(), DeliveryError> {
        if event.kind.is_critical() {
            self.send_beacon(event).await
        } else {
            self.send_event(event).await
        }
    }

    /// Deliver one event over GET with the payload in the query string.
    pub async fn send_event(&self, event: &Event) -> Result<(), DeliveryError> {
        let url = format!("{}?{}", self.endpoint, event.query_string());
        debug!(
            event = event.kind.wire_name(),
            event_id = %event.event_id,
            "delivering event"
        );
        let response = self
            .client
            .get(&url)
            .header(TOKEN_HEADER, &self.token)
            .send()
            .await?;
        Self::classify(response).await
    }

    /// Deliver a critical event as a JSON POST, falling back to the GET
    /// path when the POST cannot be completed.
    pub async fn send_beacon(&self, event: &Event) -> Result<(), DeliveryError> {
        let result = self
            .client
            .post(&self.endpoint)
            .header(TOKEN_HEADER, &self.token)
            .json(&event.beacon_body())
            .send()
            .await;
        match result {
            Ok(response) => Self::classify(response).await,
            Err(e) => {
                debug!(
                    event = event.kind.wire_name(),
                    error = %e,
                    "beacon post failed, falling back to query delivery"
                );
                self.send_event(event).await
            }
        }
    }

    async fn classify(response: reqwest::Response) -> Result<(), DeliveryError> {
        let status = response.status();
        if status == reqwest::StatusCode::OK || status == reqwest::StatusCode::ACCEPTED {
            return Ok(());
        }
        let body = response.text().await.unwrap_or_default();
        Err(DeliveryError::Rejected {
            status: status.as_u16(),
            message: rejection_message(&body),
        })
    }
}

#[derive(Deserialize)]
struct ErrorBody {
    error: Option<String>,
    message: Option<String>,
}

/// Pull a human-readable reason out of an error response. Collectors
/// answer JSON with an `error` or `message` field; anything else is used
/// verbatim.
fn rejection_message(body: &str) -> String {
    if let Ok(parsed) = serde_json::from_str::<ErrorBody>(body) {
        if let Some(msg) = parsed.error.or(parsed.message) {
            return msg;
        }
    }
    let trimmed = body.trim();
    if trimmed.is_empty() {
        "no error detail".to_string()
    } else {
        trimmed.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejection_message_prefers_error_field() {
        let msg = rejection_message(r#"{"error":"unknown token","message":"other"}"#);
        assert_eq!(msg, "unknown token");
    }

    #[test]
    fn rejection_message_falls_back_to_message_field() {
        let msg = rejection_message(r#"{"message":"rate limited"}"#);
        assert_eq!(msg, "rate limited");
    }

    #[test]
    fn rejection_message_uses_raw_body_when_not_json() {
        assert_eq!(rejection_message("  upstream busy \n"), "upstream busy");
        assert_eq!(rejection_message(""), "no error detail");
    }
}
