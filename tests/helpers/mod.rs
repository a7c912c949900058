#![allow(dead_code)] // Test helpers appear unused when compiled independently

use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::routing::get;
use axum::{Json, Router};
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio::sync::Mutex;

use pagewire::TOKEN_HEADER;

pub const WAIT_ATTEMPTS: usize = 50;
pub const WAIT_DELAY: Duration = Duration::from_millis(100);

/// One event request the collector answered, successful or not.
#[derive(Clone, Debug)]
pub struct ReceivedEvent {
    pub method: &'static str,
    pub status: u16,
    pub token: Option<String>,
    pub fields: BTreeMap<String, String>,
}

impl ReceivedEvent {
    pub fn kind(&self) -> &str {
        self.field("event")
    }

    pub fn field(&self, name: &str) -> &str {
        self.fields.get(name).map(String::as_str).unwrap_or("")
    }
}

#[derive(Clone)]
struct CollectorState {
    received: Arc<Mutex<Vec<ReceivedEvent>>>,
    fail_plan: Arc<Mutex<VecDeque<u16>>>,
    config_body: Arc<Mutex<Value>>,
    config_status: Arc<Mutex<u16>>,
}

/// In-process stand-in for the collector: records every event request it
/// answers and serves the remote configuration document.
pub struct MockCollector {
    base: String,
    state: CollectorState,
}

impl MockCollector {
    /// Collector that accepts everything, matches any domain, and carries
    /// no conversion rules.
    pub async fn start() -> MockCollector {
        Self::start_with_config(json!({
            "success": true,
            "domain": "*",
            "conversion_rules": [],
        }))
        .await
    }

    pub async fn start_with_config(config: Value) -> MockCollector {
        let state = CollectorState {
            received: Arc::new(Mutex::new(Vec::new())),
            fail_plan: Arc::new(Mutex::new(VecDeque::new())),
            config_body: Arc::new(Mutex::new(config)),
            config_status: Arc::new(Mutex::new(200)),
        };

        let app = Router::new()
            .route("/collect", get(collect_get).post(collect_post))
            .route("/collect/keys/config", get(serve_config))
            .with_state(state.clone());

        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("failed to bind mock collector listener");
        let addr = listener.local_addr().expect("mock collector local addr");
        tokio::spawn(async move {
            if let Err(err) = axum::serve(listener, app).await {
                eprintln!("mock collector server error: {}", err);
            }
        });

        MockCollector {
            base: format!("http://{}", addr),
            state,
        }
    }

    /// Endpoint to hand to the tracker configuration.
    pub fn endpoint(&self) -> String {
        format!("{}/collect", self.base)
    }

    /// Queue HTTP statuses to answer with before going back to 200. One
    /// status is consumed per event request, in order.
    pub async fn plan_failures(&self, statuses: impl IntoIterator<Item = u16>) {
        self.state.fail_plan.lock().await.extend(statuses);
    }

    pub async fn set_config_status(&self, status: u16) {
        *self.state.config_status.lock().await = status;
    }

    /// Every answered event request, including failed ones.
    pub async fn received(&self) -> Vec<ReceivedEvent> {
        self.state.received.lock().await.clone()
    }

    /// Event requests answered with a success status.
    pub async fn delivered(&self) -> Vec<ReceivedEvent> {
        self.received()
            .await
            .into_iter()
            .filter(|e| e.status < 300)
            .collect()
    }

    pub async fn delivered_kinds(&self) -> Vec<String> {
        self.delivered()
            .await
            .iter()
            .map(|e| e.kind().to_string())
            .collect()
    }

    /// Poll until at least `min` events were delivered.
    pub async fn wait_for_delivered(&self, min: usize) -> Vec<ReceivedEvent> {
        for _ in 0..WAIT_ATTEMPTS {
            let delivered = self.delivered().await;
            if delivered.len() >= min {
                return delivered;
            }
            tokio::time::sleep(WAIT_DELAY).await;
        }
        panic!(
            "timed out waiting for {} delivered events, got {:?}",
            min,
            self.delivered_kinds().await
        );
    }
}

async fn collect_get(
    State(state): State<CollectorState>,
    headers: HeaderMap,
    Query(params): Query<BTreeMap<String, String>>,
) -> (StatusCode, Json<Value>) {
    answer(&state, "GET", &headers, params).await
}

async fn collect_post(
    State(state): State<CollectorState>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> (StatusCode, Json<Value>) {
    let mut fields = BTreeMap::new();
    if let Value::Object(map) = body {
        for (key, value) in map {
            let flat = match value {
                Value::String(s) => s,
                other => other.to_string(),
            };
            fields.insert(key, flat);
        }
    }
    answer(&state, "POST", &headers, fields).await
}

async fn answer(
    state: &CollectorState,
    method: &'static str,
    headers: &HeaderMap,
    fields: BTreeMap<String, String>,
) -> (StatusCode, Json<Value>) {
    let status = state.fail_plan.lock().await.pop_front().unwrap_or(200);
    let token = headers
        .get(TOKEN_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    state.received.lock().await.push(ReceivedEvent {
        method,
        status,
        token,
        fields,
    });
    let status = StatusCode::from_u16(status).unwrap_or(StatusCode::OK);
    if status.is_success() {
        (status, Json(json!({ "status": "ok" })))
    } else {
        (status, Json(json!({ "error": "synthetic failure" })))
    }
}

async fn serve_config(State(state): State<CollectorState>) -> (StatusCode, Json<Value>) {
    let status = *state.config_status.lock().await;
    let status = StatusCode::from_u16(status).unwrap_or(StatusCode::OK);
    (status, Json(state.config_body.lock().await.clone()))
}

/// Best-effort check for whether binding to loopback is permitted in the current sandbox.
pub async fn can_bind_loopback() -> bool {
    match TcpListener::bind("127.0.0.1:0").await {
        Ok(listener) => {
            drop(listener);
            true
        }
        Err(e) if e.kind() == std::io::ErrorKind::PermissionDenied => false,
        Err(_) => true, // treat other errors as non-fatal for skipping
    }
}
