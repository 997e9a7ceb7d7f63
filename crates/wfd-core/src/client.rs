use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use reqwest::header::{CONTENT_TYPE, HeaderValue};
use reqwest::StatusCode;
use serde_json::Value;
use tracing::{debug, warn};

use crate::config::DispatchConfig;
use crate::error::{ClientError, ExecutionError};
use crate::health::{HealthReport, HealthState};
use crate::request::{RuntimeResponse, WorkflowPayload};

/// Credential header understood by the runtime.
pub const API_KEY_HEADER: &str = "X-N8N-API-KEY";

/// Ordered health probe candidates as `(path, send_credential)`.
const PROBE_PATHS: [(&str, bool); 3] = [("/healthz", true), ("/api/v1/workflows", true), ("", false)];

const BODY_SNIPPET_LIMIT: usize = 512;

/// HTTP transport to the external workflow runtime.
#[derive(Clone)]
pub struct RuntimeClient {
    http: reqwest::Client,
    base_url: Arc<str>,
    api_key: Option<Arc<str>>,
    workflows: Arc<BTreeMap<String, String>>,
    timeout: Duration,
    health_timeout: Duration,
}

impl std::fmt::Debug for RuntimeClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RuntimeClient")
            .field("base_url", &self.base_url)
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .field("workflows", &self.workflows.len())
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl RuntimeClient {
    pub fn new(config: &DispatchConfig) -> Result<Self, ClientError> {
        Ok(Self::with_http(crate::http_client::build_client()?, config))
    }

    pub fn with_http(http: reqwest::Client, config: &DispatchConfig) -> Self {
        Self {
            http,
            base_url: Arc::from(config.base()),
            api_key: config.api_key.as_deref().map(Arc::from),
            workflows: Arc::new(config.workflows.clone()),
            timeout: config.default_timeout,
            health_timeout: config.health_timeout,
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn resolve_endpoint(&self, workflow: &str) -> Result<&str, ExecutionError> {
        self.workflows
            .get(workflow)
            .map(String::as_str)
            .ok_or_else(|| ExecutionError::Configuration(format!("unknown workflow `{workflow}`")))
    }

    fn url_for(&self, path: &str) -> String {
        if path.is_empty() {
            return self.base_url.to_string();
        }
        if path.starts_with('/') {
            format!("{}{}", self.base_url, path)
        } else {
            format!("{}/{}", self.base_url, path)
        }
    }

    fn authorize(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.api_key {
            Some(key) => req.header(API_KEY_HEADER, key.as_ref()),
            None => req,
        }
    }

    /// One execution attempt. Does not retry.
    pub async fn execute(
        &self,
        workflow: &str,
        payload: &WorkflowPayload,
    ) -> Result<RuntimeResponse, ExecutionError> {
        let endpoint = self.resolve_endpoint(workflow)?;
        let body = serde_json::to_vec(payload)
            .map_err(|err| ExecutionError::ClientSetup(format!("serialize payload: {err}")))?;
        let url = self.url_for(endpoint);
        let request = self
            .authorize(self.http.post(&url))
            .header(CONTENT_TYPE, HeaderValue::from_static("application/json"))
            .timeout(self.timeout)
            .body(body);

        let resp = request.send().await.map_err(|err| {
            if err.is_timeout() {
                ExecutionError::Transient(format!("request to {url} timed out after {:?}", self.timeout))
            } else {
                ExecutionError::Transient(format!("request to {url} failed: {err}"))
            }
        })?;
        let status = resp.status();
        let text = resp
            .text()
            .await
            .map_err(|err| ExecutionError::Transient(format!("read response body: {err}")))?;
        if status != StatusCode::OK && status != StatusCode::ACCEPTED {
            return Err(ExecutionError::Transient(format!(
                "runtime returned HTTP {}: {}",
                status.as_u16(),
                snippet(&text)
            )));
        }
        let (response, structured) = RuntimeResponse::parse_tolerant(&text).map_err(|err| {
            ExecutionError::Transient(format!(
                "malformed runtime response ({err}): {}",
                snippet(&text)
            ))
        })?;
        if !structured {
            debug!(
                target: "wfd::client",
                workflow,
                body_len = text.len(),
                "runtime response not structured; using synthetic response"
            );
        }
        Ok(response)
    }

    /// `GET /api/v1/executions/{id}`.
    pub async fn execution_status(&self, execution_id: &str) -> Result<Value, ClientError> {
        let url = self.url_for(&format!("/api/v1/executions/{execution_id}"));
        let resp = self
            .authorize(self.http.get(&url))
            .timeout(self.timeout)
            .send()
            .await?;
        let status = resp.status();
        let text = resp.text().await?;
        if !status.is_success() {
            return Err(ClientError::Status {
                code: status.as_u16(),
                body: snippet(&text),
            });
        }
        serde_json::from_str(&text).map_err(|err| ClientError::Decode(err.to_string()))
    }

    /// `POST /api/v1/executions/{id}/stop`.
    pub async fn stop_execution(&self, execution_id: &str) -> Result<(), ClientError> {
        let url = self.url_for(&format!("/api/v1/executions/{execution_id}/stop"));
        let resp = self
            .authorize(self.http.post(&url))
            .timeout(self.timeout)
            .send()
            .await?;
        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(ClientError::Status {
                code: status.as_u16(),
                body: snippet(&text),
            });
        }
        Ok(())
    }

    /// One health tick: first candidate answering 200/401/403 wins.
    pub async fn probe(&self) -> HealthReport {
        let started = Instant::now();
        let mut failures: Vec<String> = Vec::new();
        for (path, with_auth) in PROBE_PATHS {
            let url = self.url_for(path);
            let mut req = self.http.get(&url).timeout(self.health_timeout);
            if with_auth {
                req = self.authorize(req);
            }
            match req.send().await {
                Ok(resp) => {
                    let code = resp.status();
                    if is_live_status(code) {
                        return HealthReport {
                            state: HealthState::Healthy,
                            endpoint: Some(url),
                            status_code: Some(code.as_u16()),
                            error: None,
                            latency_ms: started.elapsed().as_millis() as u64,
                            checked_at: Some(Utc::now()),
                        };
                    }
                    failures.push(format!("{url}: HTTP {}", code.as_u16()));
                }
                Err(err) => failures.push(format!("{url}: {err}")),
            }
        }
        warn!(
            target: "wfd::client",
            base = %self.base_url,
            attempts = failures.len(),
            "all health probe candidates failed"
        );
        HealthReport {
            state: HealthState::Unhealthy,
            endpoint: None,
            status_code: None,
            error: Some(failures.join("; ")),
            latency_ms: started.elapsed().as_millis() as u64,
            checked_at: Some(Utc::now()),
        }
    }
}

/// 401/403 mean a live service rejecting credentials.
fn is_live_status(code: StatusCode) -> bool {
    matches!(
        code,
        StatusCode::OK | StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN
    )
}

fn snippet(body: &str) -> String {
    if body.len() <= BODY_SNIPPET_LIMIT {
        return body.to_string();
    }
    let mut end = BODY_SNIPPET_LIMIT;
    while !body.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}…", &body[..end])
}
