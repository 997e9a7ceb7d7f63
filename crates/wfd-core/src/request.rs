use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Metadata key read to classify a submission's priority.
pub const TRIGGER_TYPE_KEY: &str = "trigger_type";

/// Caller-owned business payload forwarded verbatim to the runtime.
///
/// The engine only interprets `job_id`, `workflow` and the `trigger_type`
/// metadata entry; everything else is opaque.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkflowPayload {
    pub job_id: String,
    /// Key into the configured workflow → endpoint map.
    pub workflow: String,
    #[serde(default)]
    pub metadata: BTreeMap<String, Value>,
    #[serde(default)]
    pub data: Value,
}

impl WorkflowPayload {
    pub fn new(job_id: impl Into<String>, workflow: impl Into<String>, data: Value) -> Self {
        Self {
            job_id: job_id.into(),
            workflow: workflow.into(),
            metadata: BTreeMap::new(),
            data,
        }
    }

    pub fn with_trigger(mut self, trigger: impl Into<String>) -> Self {
        self.metadata
            .insert(TRIGGER_TYPE_KEY.to_string(), Value::String(trigger.into()));
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    pub fn trigger_type(&self) -> Option<&str> {
        self.metadata.get(TRIGGER_TYPE_KEY).and_then(|v| v.as_str())
    }
}

/// Lower value means higher priority. Informational only: the dispatch
/// queue is FIFO regardless of priority.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    High = 1,
    Normal = 2,
    Low = 3,
}

impl Priority {
    pub fn from_trigger(trigger: Option<&str>) -> Self {
        let Some(raw) = trigger else {
            return Priority::Low;
        };
        let normalized = raw.trim().to_ascii_lowercase();
        match normalized.as_str() {
            "user" | "user_action" | "user_initiated" | "manual" | "ui" => Priority::High,
            "file_change" | "file_watch" | "watcher" | "passive" | "schedule" => Priority::Normal,
            _ => Priority::Low,
        }
    }

    pub fn as_i32(self) -> i32 {
        self as i32
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum RequestStatus {
    Queued,
    Processing,
    Completed,
    Failed,
}

impl RequestStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RequestStatus::Queued => "queued",
            RequestStatus::Processing => "processing",
            RequestStatus::Completed => "completed",
            RequestStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, RequestStatus::Completed | RequestStatus::Failed)
    }
}

impl std::fmt::Display for RequestStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One unit of work destined for the external runtime.
///
/// Owned by the engine once submitted; only the worker that dequeued it
/// writes to its fields.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    pub id: String,
    pub job_id: String,
    pub workflow: String,
    pub payload: WorkflowPayload,
    pub priority: Priority,
    pub status: RequestStatus,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    /// Incremented before each retry attempt; never reset.
    pub retry_count: u32,
    pub max_retries: u32,
    #[serde(default)]
    pub last_error: Option<String>,
    #[serde(default)]
    pub runtime_execution_id: Option<String>,
    #[serde(default)]
    pub response_data: Option<Value>,
}

impl Request {
    pub fn new(payload: WorkflowPayload, max_retries: u32) -> Self {
        let priority = Priority::from_trigger(payload.trigger_type());
        Self {
            id: Uuid::new_v4().to_string(),
            job_id: payload.job_id.clone(),
            workflow: payload.workflow.clone(),
            payload,
            priority,
            status: RequestStatus::Queued,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            retry_count: 0,
            max_retries,
            last_error: None,
            runtime_execution_id: None,
            response_data: None,
        }
    }

    /// Wall-clock time between dequeue and the terminal transition.
    pub fn elapsed_ms(&self) -> Option<i64> {
        match (self.started_at, self.completed_at) {
            (Some(start), Some(end)) => Some((end - start).num_milliseconds()),
            _ => None,
        }
    }
}

/// Result of one successful execution attempt.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RuntimeResponse {
    #[serde(alias = "executionId", alias = "id")]
    pub execution_id: String,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub data: Value,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default, alias = "startedAt")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, alias = "stoppedAt", alias = "finishedAt")]
    pub finished_at: Option<DateTime<Utc>>,
}

impl RuntimeResponse {
    /// Fallback used when an accepted response is empty or carries JSON
    /// that is not a structured response.
    pub fn synthetic(data: Value) -> Self {
        let now = Utc::now();
        Self {
            execution_id: format!("local-{}", Uuid::new_v4()),
            status: "success".to_string(),
            data,
            error: None,
            started_at: Some(now),
            finished_at: Some(now),
        }
    }

    /// Structured decode first, synthetic fallback second. A non-empty body
    /// that is not JSON at all is an error; the flag reports whether the
    /// structured shape matched.
    pub fn parse_tolerant(raw_body: &str) -> Result<(Self, bool), serde_json::Error> {
        if raw_body.trim().is_empty() {
            return Ok((RuntimeResponse::synthetic(Value::Null), false));
        }
        let value = serde_json::from_str::<Value>(raw_body)?;
        match serde_json::from_value::<RuntimeResponse>(value.clone()) {
            Ok(resp) if !resp.execution_id.trim().is_empty() => Ok((resp, true)),
            _ => Ok((RuntimeResponse::synthetic(value), false)),
        }
    }
}
