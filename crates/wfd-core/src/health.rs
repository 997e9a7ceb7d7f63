use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::client::RuntimeClient;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum HealthState {
    #[default]
    Unknown,
    Healthy,
    Unhealthy,
}

impl HealthState {
    pub fn as_str(&self) -> &'static str {
        match self {
            HealthState::Unknown => "unknown",
            HealthState::Healthy => "healthy",
            HealthState::Unhealthy => "unhealthy",
        }
    }
}

/// Outcome of one health tick.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct HealthReport {
    pub state: HealthState,
    /// Candidate URL that answered, if any.
    pub endpoint: Option<String>,
    pub status_code: Option<u16>,
    pub error: Option<String>,
    pub latency_ms: u64,
    pub checked_at: Option<DateTime<Utc>>,
}

impl HealthReport {
    pub fn unknown() -> Self {
        Self::default()
    }

    pub fn is_healthy(&self) -> bool {
        self.state == HealthState::Healthy
    }
}

/// Probe the runtime every `interval` until `cancel` fires. Reports are only
/// published and logged; request admission never depends on them.
pub(crate) async fn run_health_monitor(
    client: RuntimeClient,
    interval: std::time::Duration,
    publish: Arc<watch::Sender<HealthReport>>,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                debug!(target: "wfd::health", "health monitor cancelled");
                break;
            }
            _ = ticker.tick() => {
                let report = tokio::select! {
                    _ = cancel.cancelled() => break,
                    report = client.probe() => report,
                };
                let previous = publish.borrow().state;
                log_report(previous, &report);
                publish.send_replace(report);
            }
        }
    }
}

fn log_report(previous: HealthState, report: &HealthReport) {
    match (previous, report.state) {
        (HealthState::Healthy, HealthState::Healthy) => debug!(
            target: "wfd::health",
            endpoint = report.endpoint.as_deref().unwrap_or(""),
            latency_ms = report.latency_ms,
            "runtime healthy"
        ),
        (_, HealthState::Healthy) => info!(
            target: "wfd::health",
            endpoint = report.endpoint.as_deref().unwrap_or(""),
            status = report.status_code.unwrap_or_default(),
            "runtime reachable"
        ),
        (_, _) => warn!(
            target: "wfd::health",
            error = report.error.as_deref().unwrap_or(""),
            "runtime health check failed"
        ),
    }
}
