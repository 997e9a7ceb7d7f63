use std::panic::AssertUnwindSafe;
use std::time::Instant;

use chrono::Utc;
use futures_util::FutureExt;
use tracing::{debug, error, info, warn};

use crate::engine::Shared;
use crate::error::ExecutionError;
use crate::events::DispatchEvent;
use crate::queue::QueueReceiver;
use crate::registry::Outcome;
use crate::request::{Request, RequestStatus, RuntimeResponse};
use crate::tracker::{JobStatus, JobUpdate};

/// Worker loop: pull until the queue is closed and drained.
pub(crate) async fn run_worker(worker_id: usize, shared: std::sync::Arc<Shared>, queue: QueueReceiver) {
    debug!(target: "wfd::worker", worker_id, "worker started");
    while let Some(request) = queue.recv().await {
        let fallback = request.clone();
        let result = AssertUnwindSafe(execute_with_retry(&shared, worker_id, request))
            .catch_unwind()
            .await;
        let finished = match result {
            Ok(finished) => finished,
            Err(panic) => {
                let reason = format!("worker panicked: {}", panic_message(panic.as_ref()));
                error!(
                    target: "wfd::worker",
                    worker_id,
                    request_id = %fallback.id,
                    job_id = %fallback.job_id,
                    "{reason}"
                );
                let evicted = shared.state.lock().registry.evict(&fallback.id, &reason);
                evicted.unwrap_or_else(|| fail_unstarted(fallback, &reason))
            }
        };
        report_terminal(&shared, &finished).await;
    }
    debug!(target: "wfd::worker", worker_id, "worker exiting: queue closed");
}

/// Execute-with-retry for one request. Returns the request in its terminal
/// state, already removed from the active registry.
pub(crate) async fn execute_with_retry(shared: &Shared, worker_id: usize, mut request: Request) -> Request {
    let active = {
        let mut state = shared.state.lock();
        state.registry.begin(&mut request);
        state.registry.len()
    };
    metrics::gauge!("wfd.requests.active").set(active as f64);
    shared.emit(DispatchEvent::Started {
        request: request.clone(),
        worker: worker_id,
    });
    if let Err(err) = shared
        .tracker
        .update_job(&request.job_id, JobUpdate::for_request(&request, JobStatus::Processing))
        .await
    {
        warn!(target: "wfd::worker", job_id = %request.job_id, error = %err, "job tracker rejected processing update");
    }

    let retry_delay = shared.config.retry_delay;
    let mut outcome: Result<RuntimeResponse, ExecutionError> =
        Err(ExecutionError::Transient("no attempt made".to_string()));
    for attempt in 0..=request.max_retries {
        if attempt > 0 {
            let delay = retry_delay * attempt;
            request.retry_count += 1;
            shared.state.lock().registry.record_attempt(&request);
            metrics::counter!("wfd.requests.retries", "workflow" => request.workflow.clone())
                .increment(1);
            info!(
                target: "wfd::worker",
                worker_id,
                request_id = %request.id,
                attempt,
                max_retries = request.max_retries,
                delay_ms = delay.as_millis() as u64,
                "retrying workflow execution"
            );
            shared.emit(DispatchEvent::Retrying {
                request_id: request.id.clone(),
                job_id: request.job_id.clone(),
                attempt,
                delay_ms: delay.as_millis() as u64,
                error: request.last_error.clone().unwrap_or_default(),
            });
            tokio::time::sleep(delay).await;
        }

        if shared.config.verbose {
            info!(
                target: "wfd::worker",
                worker_id,
                request_id = %request.id,
                workflow = %request.workflow,
                attempt,
                "dispatching to runtime"
            );
        }
        let started = Instant::now();
        let result = shared.client.execute(&request.workflow, &request.payload).await;
        metrics::histogram!("wfd.attempt.latency_ms").record(started.elapsed().as_millis() as f64);
        match result {
            Ok(resp) => {
                outcome = Ok(resp);
                break;
            }
            Err(err) => {
                request.last_error = Some(err.to_string());
                shared.state.lock().registry.record_attempt(&request);
                warn!(
                    target: "wfd::worker",
                    worker_id,
                    request_id = %request.id,
                    workflow = %request.workflow,
                    attempt,
                    kind = err.kind(),
                    error = %err,
                    "workflow execution attempt failed"
                );
                let retryable = err.is_retryable();
                outcome = Err(err);
                if !retryable {
                    break;
                }
            }
        }
    }

    let active = {
        let mut state = shared.state.lock();
        match outcome {
            Ok(resp) => state.registry.finish(&mut request, Outcome::Completed(resp)),
            Err(err) => state.registry.finish(&mut request, Outcome::Failed(err.to_string())),
        }
        state.registry.len()
    };
    metrics::gauge!("wfd.requests.active").set(active as f64);
    request
}

/// Publish a terminal request: tracker on failure, then subscribers.
pub(crate) async fn report_terminal(shared: &Shared, request: &Request) {
    match request.status {
        RequestStatus::Completed => {
            metrics::counter!("wfd.requests.completed", "workflow" => request.workflow.clone())
                .increment(1);
            info!(
                target: "wfd::worker",
                request_id = %request.id,
                job_id = %request.job_id,
                execution_id = request.runtime_execution_id.as_deref().unwrap_or(""),
                retries = request.retry_count,
                elapsed_ms = request.elapsed_ms().unwrap_or_default(),
                "workflow dispatched"
            );
            shared.emit(DispatchEvent::Completed {
                request: request.clone(),
            });
        }
        RequestStatus::Failed => {
            metrics::counter!("wfd.requests.failed", "workflow" => request.workflow.clone())
                .increment(1);
            let reason = request.last_error.as_deref().unwrap_or("unknown error");
            warn!(
                target: "wfd::worker",
                request_id = %request.id,
                job_id = %request.job_id,
                retries = request.retry_count,
                reason,
                "workflow dispatch failed"
            );
            if let Err(err) = shared.tracker.fail_job(&request.job_id, reason).await {
                warn!(target: "wfd::worker", job_id = %request.job_id, error = %err, "job tracker rejected failure");
            }
            shared.emit(DispatchEvent::Failed {
                request: request.clone(),
            });
        }
        RequestStatus::Queued | RequestStatus::Processing => {}
    }
}

/// Fail a request that never reached the registry.
pub(crate) fn fail_unstarted(mut request: Request, reason: &str) -> Request {
    request.status = RequestStatus::Failed;
    request.completed_at = Some(Utc::now());
    request.last_error = Some(reason.to_string());
    request
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(msg) = panic.downcast_ref::<&str>() {
        (*msg).to_string()
    } else if let Some(msg) = panic.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic".to_string()
    }
}
