use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::request::{Priority, Request};

/// Status values the engine reports to the job tracker. Success is never
/// reported from here; it arrives through the runtime's result callback.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Processing,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JobUpdate {
    pub status: JobStatus,
    pub request_id: String,
    pub workflow: String,
    pub priority: Priority,
    pub at: DateTime<Utc>,
}

impl JobUpdate {
    pub fn for_request(request: &Request, status: JobStatus) -> Self {
        Self {
            status,
            request_id: request.id.clone(),
            workflow: request.workflow.clone(),
            priority: request.priority,
            at: Utc::now(),
        }
    }
}

/// External record of human-visible job status.
#[async_trait::async_trait]
pub trait JobTracker: Send + Sync {
    async fn update_job(&self, job_id: &str, update: JobUpdate) -> anyhow::Result<()>;
    async fn fail_job(&self, job_id: &str, reason: &str) -> anyhow::Result<()>;
}

#[derive(Debug, Clone, PartialEq)]
pub enum TrackedCall {
    Update { job_id: String, update: JobUpdate },
    Fail { job_id: String, reason: String },
}

impl TrackedCall {
    pub fn job_id(&self) -> &str {
        match self {
            TrackedCall::Update { job_id, .. } | TrackedCall::Fail { job_id, .. } => job_id,
        }
    }
}

/// Records every call in order.
#[derive(Debug, Default)]
pub struct InMemoryJobTracker {
    calls: Mutex<Vec<TrackedCall>>,
}

impl InMemoryJobTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> Vec<TrackedCall> {
        self.calls.lock().clone()
    }

    pub fn count_status(&self, status: JobStatus) -> usize {
        self.calls
            .lock()
            .iter()
            .filter(|c| matches!(c, TrackedCall::Update { update, .. } if update.status == status))
            .count()
    }

    pub fn failures(&self) -> Vec<(String, String)> {
        self.calls
            .lock()
            .iter()
            .filter_map(|c| match c {
                TrackedCall::Fail { job_id, reason } => Some((job_id.clone(), reason.clone())),
                _ => None,
            })
            .collect()
    }

    pub fn calls_for(&self, job_id: &str) -> Vec<TrackedCall> {
        self.calls
            .lock()
            .iter()
            .filter(|c| c.job_id() == job_id)
            .cloned()
            .collect()
    }
}

#[async_trait::async_trait]
impl JobTracker for InMemoryJobTracker {
    async fn update_job(&self, job_id: &str, update: JobUpdate) -> anyhow::Result<()> {
        self.calls.lock().push(TrackedCall::Update {
            job_id: job_id.to_string(),
            update,
        });
        Ok(())
    }

    async fn fail_job(&self, job_id: &str, reason: &str) -> anyhow::Result<()> {
        self.calls.lock().push(TrackedCall::Fail {
            job_id: job_id.to_string(),
            reason: reason.to_string(),
        });
        Ok(())
    }
}

/// Logs transitions; for deployments without a job store.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingJobTracker;

#[async_trait::async_trait]
impl JobTracker for TracingJobTracker {
    async fn update_job(&self, job_id: &str, update: JobUpdate) -> anyhow::Result<()> {
        info!(
            target: "wfd::jobs",
            job_id,
            request_id = %update.request_id,
            workflow = %update.workflow,
            priority = update.priority.as_i32(),
            status = ?update.status,
            "job updated"
        );
        Ok(())
    }

    async fn fail_job(&self, job_id: &str, reason: &str) -> anyhow::Result<()> {
        info!(target: "wfd::jobs", job_id, reason, "job failed");
        Ok(())
    }
}
