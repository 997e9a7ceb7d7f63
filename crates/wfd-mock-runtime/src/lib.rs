//! A small stand-in for the external workflow runtime.
//!
//! Serves webhook triggers at `POST /webhook/{name}`, a health path, and the
//! executions API the dispatcher queries on demand. Executions are kept in
//! memory and never actually run.

use std::collections::{BTreeSet, HashMap};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    body::Bytes,
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, SecondsFormat, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use serde_json::{json, Value};
use tokio::task::JoinHandle;

pub const API_KEY_HEADER: &str = "x-n8n-api-key";

#[derive(Debug, Clone, Default)]
pub struct MockOptions {
    /// When set, credentialed routes answer 401 without a matching header.
    pub api_key: Option<String>,
    /// Webhook names that always answer 500.
    pub failing: BTreeSet<String>,
    /// Delay applied before answering a webhook.
    pub latency: Duration,
}

impl MockOptions {
    /// Read `WFD_MOCK_API_KEY`, `WFD_MOCK_FAIL` (comma separated) and
    /// `WFD_MOCK_LATENCY_MS`.
    pub fn from_env() -> Self {
        let api_key = std::env::var("WFD_MOCK_API_KEY")
            .ok()
            .filter(|k| !k.trim().is_empty());
        let failing = std::env::var("WFD_MOCK_FAIL")
            .map(|raw| {
                raw.split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();
        let latency = std::env::var("WFD_MOCK_LATENCY_MS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .map(Duration::from_millis)
            .unwrap_or_default();
        Self {
            api_key,
            failing,
            latency,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Execution {
    pub id: String,
    pub workflow: String,
    pub status: String,
    pub finished: bool,
    pub started_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stopped_at: Option<DateTime<Utc>>,
    pub data: Value,
}

/// Shared state behind the router.
#[derive(Debug, Default)]
pub struct MockRuntime {
    options: MockOptions,
    executions: RwLock<HashMap<String, Execution>>,
    webhook_hits: RwLock<HashMap<String, u64>>,
}

impl MockRuntime {
    pub fn new(options: MockOptions) -> Arc<Self> {
        Arc::new(Self {
            options,
            ..Default::default()
        })
    }

    pub fn execution(&self, id: &str) -> Option<Execution> {
        self.executions.read().get(id).cloned()
    }

    pub fn executions(&self) -> Vec<Execution> {
        let mut all: Vec<Execution> = self.executions.read().values().cloned().collect();
        all.sort_by(|a, b| a.started_at.cmp(&b.started_at));
        all
    }

    /// Webhook calls received for `name`, including failed ones.
    pub fn hits(&self, name: &str) -> u64 {
        self.webhook_hits.read().get(name).copied().unwrap_or_default()
    }

    fn authorized(&self, headers: &HeaderMap) -> bool {
        match &self.options.api_key {
            None => true,
            Some(expected) => headers
                .get(API_KEY_HEADER)
                .and_then(|v| v.to_str().ok())
                .map(|v| v == expected)
                .unwrap_or(false),
        }
    }
}

pub fn router(state: Arc<MockRuntime>) -> Router {
    Router::new()
        .route("/", get(root))
        .route("/healthz", get(healthz))
        .route("/webhook/{name}", post(webhook))
        .route("/api/v1/workflows", get(list_workflows))
        .route("/api/v1/executions/{id}", get(get_execution))
        .route("/api/v1/executions/{id}/stop", post(stop_execution))
        .with_state(state)
}

/// A mock runtime serving on a background task.
#[derive(Debug)]
pub struct SpawnedRuntime {
    pub addr: SocketAddr,
    pub state: Arc<MockRuntime>,
    handle: JoinHandle<()>,
}

impl SpawnedRuntime {
    pub fn base_url(&self) -> String {
        format!("http://{}", self.addr)
    }

    pub fn shutdown(self) {
        self.handle.abort();
    }
}

/// Bind `addr` (port 0 picks a free one) and serve in the background.
pub async fn spawn(addr: SocketAddr, options: MockOptions) -> anyhow::Result<SpawnedRuntime> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    let addr = listener.local_addr()?;
    let state = MockRuntime::new(options);
    let app = router(state.clone());
    let handle = tokio::spawn(async move {
        if let Err(err) = axum::serve(listener, app).await {
            tracing::error!(target: "wfd::mock", %err, "mock runtime server exited");
        }
    });
    tracing::info!(target: "wfd::mock", %addr, "mock runtime listening");
    Ok(SpawnedRuntime {
        addr,
        state,
        handle,
    })
}

fn now_rfc3339() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

async fn root() -> &'static str {
    "workflow runtime"
}

async fn healthz() -> Json<Value> {
    Json(json!({"status": "ok", "generated": now_rfc3339()}))
}

async fn webhook(
    State(state): State<Arc<MockRuntime>>,
    Path(name): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    *state.webhook_hits.write().entry(name.clone()).or_default() += 1;
    if !state.options.latency.is_zero() {
        tokio::time::sleep(state.options.latency).await;
    }
    if !state.authorized(&headers) {
        return (StatusCode::UNAUTHORIZED, "invalid api key").into_response();
    }
    if state.options.failing.contains(&name) {
        tracing::debug!(target: "wfd::mock", workflow = %name, "failing webhook on request");
        return (StatusCode::INTERNAL_SERVER_ERROR, "workflow failed").into_response();
    }
    let execution = Execution {
        id: format!("mock-{}", uuid::Uuid::new_v4()),
        workflow: name,
        status: "running".to_string(),
        finished: false,
        started_at: Utc::now(),
        stopped_at: None,
        data: serde_json::from_slice(&body).unwrap_or(Value::Null),
    };
    let reply = json!({
        "executionId": execution.id,
        "status": execution.status,
        "startedAt": execution.started_at,
    });
    tracing::debug!(target: "wfd::mock", execution = %execution.id, workflow = %execution.workflow, "execution accepted");
    state
        .executions
        .write()
        .insert(execution.id.clone(), execution);
    Json(reply).into_response()
}

async fn list_workflows(State(state): State<Arc<MockRuntime>>, headers: HeaderMap) -> Response {
    if !state.authorized(&headers) {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    let mut names: BTreeSet<String> = state.webhook_hits.read().keys().cloned().collect();
    names.extend(state.options.failing.iter().cloned());
    Json(json!({"data": names})).into_response()
}

async fn get_execution(
    State(state): State<Arc<MockRuntime>>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Response {
    if !state.authorized(&headers) {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    match state.execution(&id) {
        Some(execution) => Json(execution).into_response(),
        None => (StatusCode::NOT_FOUND, "execution not found").into_response(),
    }
}

async fn stop_execution(
    State(state): State<Arc<MockRuntime>>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Response {
    if !state.authorized(&headers) {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    let mut executions = state.executions.write();
    let Some(execution) = executions.get_mut(&id) else {
        return (StatusCode::NOT_FOUND, "execution not found").into_response();
    };
    if !execution.finished {
        execution.status = "canceled".to_string();
        execution.finished = true;
        execution.stopped_at = Some(Utc::now());
    }
    Json(execution.clone()).into_response()
}
