use std::collections::BTreeMap;

use chrono::{SecondsFormat, Utc};
use serde_json::Value;
use uuid::Uuid;

/// Free-form event data. Ordered so wire encoding and dedup keys are
/// deterministic for identical contents.
pub type Payload = BTreeMap<String, Value>;

/// Type-safe representation of the event types the agent emits.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum EventKind {
    SessionStart,
    PageView,
    Click,
    Conversion,
    Ping,
    SessionEnd,
    PageUnload,
}

impl EventKind {
    /// Wire name carried in the `event` parameter. Every type maps to
    /// itself; `session_start` is its own wire type.
    pub fn wire_name(&self) -> &'static str {
        match self {
            EventKind::SessionStart => "session_start",
            EventKind::PageView => "page_view",
            EventKind::Click => "click",
            EventKind::Conversion => "conversion",
            EventKind::Ping => "ping",
            EventKind::SessionEnd => "session_end",
            EventKind::PageUnload => "page_unload",
        }
    }

    /// Parse a wire name back into a kind.
    pub fn from_wire_name(name: &str) -> Option<EventKind> {
        match name {
            "session_start" => Some(EventKind::SessionStart),
            "page_view" => Some(EventKind::PageView),
            "click" => Some(EventKind::Click),
            "conversion" => Some(EventKind::Conversion),
            "ping" => Some(EventKind::Ping),
            "session_end" => Some(EventKind::SessionEnd),
            "page_unload" => Some(EventKind::PageUnload),
            _ => None,
        }
    }

    /// Classify a caller-supplied event name. Unknown names fall back to
    /// the `click` classification.
    pub fn classify(name: &str) -> EventKind {
        EventKind::from_wire_name(name).unwrap_or(EventKind::Click)
    }

    /// Critical events must survive page teardown and take the beacon path.
    pub fn is_critical(&self) -> bool {
        matches!(self, EventKind::SessionEnd | EventKind::PageUnload)
    }

    /// All event types.
    pub fn all() -> &'static [EventKind] {
        &[
            EventKind::SessionStart,
            EventKind::PageView,
            EventKind::Click,
            EventKind::Conversion,
            EventKind::Ping,
            EventKind::SessionEnd,
            EventKind::PageUnload,
        ]
    }
}

/// A fully-formed event, ready for transport.
#[derive(Clone, Debug)]
pub struct Event {
    pub kind: EventKind,
    pub event_id: String,
    pub session_id: String,
    pub tracker_token: String,
    /// ISO-8601 with millisecond precision.
    pub timestamp: String,
    pub payload: Payload,
}

impl Event {
    pub fn new(
        kind: EventKind,
        session_id: impl Into<String>,
        tracker_token: impl Into<String>,
        payload: Payload,
    ) -> Self {
        Self {
            kind,
            event_id: Uuid::new_v4().to_string(),
            session_id: session_id.into(),
            tracker_token: tracker_token.into(),
            timestamp: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
            payload,
        }
    }

    /// Flatten the event into query parameters. Scalar payload values are
    /// rendered raw; nested objects and arrays are JSON-stringified into a
    /// single parameter value. The tracker token travels in a header, never
    /// in the query.
    pub fn query_pairs(&self) -> Vec<(String, String)> {
        let mut pairs = vec![
            ("event".to_string(), self.kind.wire_name().to_string()),
            ("event_id".to_string(), self.event_id.clone()),
            ("session_id".to_string(), self.session_id.clone()),
            ("timestamp".to_string(), self.timestamp.clone()),
        ];
        for (key, value) in &self.payload {
            pairs.push((key.clone(), flatten_value(value)));
        }
        pairs
    }

    /// Percent-encoded query string for the GET dispatch path.
    pub fn query_string(&self) -> String {
        self.query_pairs()
            .iter()
            .map(|(k, v)| format!("{}={}", urlencoding::encode(k), urlencoding::encode(v)))
            .collect::<Vec<_>>()
            .join("&")
    }

    /// JSON blob body for the teardown-safe beacon path. Same flat shape as
    /// the query encoding, but values keep their JSON types.
    pub fn beacon_body(&self) -> Value {
        let mut body = serde_json::Map::new();
        body.insert("event".into(), Value::String(self.kind.wire_name().into()));
        body.insert("event_id".into(), Value::String(self.event_id.clone()));
        body.insert("session_id".into(), Value::String(self.session_id.clone()));
        body.insert("timestamp".into(), Value::String(self.timestamp.clone()));
        body.insert(
            "tracker_token".into(),
            Value::String(self.tracker_token.clone()),
        );
        for (key, value) in &self.payload {
            body.insert(key.clone(), value.clone());
        }
        Value::Object(body)
    }

    /// Composite identity used for duplicate suppression: type, timestamp
    /// and serialized payload.
    pub fn dedup_key(&self) -> String {
        let payload = serde_json::to_string(&self.payload).unwrap_or_default();
        format!("{}:{}:{}", self.kind.wire_name(), self.timestamp, payload)
    }
}

fn flatten_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Object(_) | Value::Array(_) => value.to_string(),
        other => other.to_string(),
    }
}
