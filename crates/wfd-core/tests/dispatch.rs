use std::sync::Arc;
use std::time::{Duration, Instant};

use httpmock::prelude::*;
use serde_json::json;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use wfd_core::{
    DispatchConfig, DispatchError, DispatchEvent, Dispatcher, HealthState, InMemoryJobTracker,
    JobStatus, JobTracker, JobUpdate, Priority, Request, RequestStatus, WorkflowPayload,
    SHUTDOWN_REASON,
};

const WEBHOOK: &str = "/webhook/ingest";

fn config(server: &MockServer) -> DispatchConfig {
    DispatchConfig::new(server.base_url())
        .with_workflow("ingest", WEBHOOK)
        .with_retry_delay(Duration::from_millis(10))
        .with_timeout(Duration::from_secs(10))
        .with_health_interval(Duration::from_secs(3600))
        .with_health_timeout(Duration::from_millis(200))
}

fn payload(job: &str) -> WorkflowPayload {
    WorkflowPayload::new(job, "ingest", json!({"path": format!("/data/{job}.csv")}))
}

fn engine(cfg: DispatchConfig) -> (Dispatcher, Arc<InMemoryJobTracker>) {
    let tracker = Arc::new(InMemoryJobTracker::new());
    let dispatcher = Dispatcher::new(cfg, tracker.clone()).unwrap();
    (dispatcher, tracker)
}

async fn next_event(rx: &mut broadcast::Receiver<DispatchEvent>) -> DispatchEvent {
    loop {
        match timeout(Duration::from_secs(10), rx.recv()).await {
            Ok(Ok(event)) => return event,
            Ok(Err(RecvError::Lagged(_))) => continue,
            Ok(Err(RecvError::Closed)) => panic!("event channel closed"),
            Err(_) => panic!("timed out waiting for dispatch event"),
        }
    }
}

async fn wait_started(rx: &mut broadcast::Receiver<DispatchEvent>, id: &str) {
    loop {
        let event = next_event(rx).await;
        if matches!(event, DispatchEvent::Started { .. }) && event.request_id() == id {
            return;
        }
    }
}

async fn wait_terminal(rx: &mut broadcast::Receiver<DispatchEvent>, id: &str) -> Request {
    loop {
        let event = next_event(rx).await;
        if event.is_terminal() && event.request_id() == id {
            return event.into_terminal().unwrap();
        }
    }
}

#[tokio::test]
async fn persistent_server_errors_exhaust_retries() {
    let server = MockServer::start_async().await;
    let hook = server
        .mock_async(|when, then| {
            when.method(POST).path(WEBHOOK);
            then.status(500).body("internal error");
        })
        .await;
    let (dispatcher, tracker) = engine(config(&server).with_max_retries(2));
    let mut events = dispatcher.subscribe();
    dispatcher.start().unwrap();

    let started = Instant::now();
    let queued = dispatcher.submit(payload("job-500")).await.unwrap();
    assert_eq!(queued.status, RequestStatus::Queued);
    let done = wait_terminal(&mut events, &queued.id).await;

    assert_eq!(done.status, RequestStatus::Failed);
    assert_eq!(done.retry_count, 2);
    assert!(done.last_error.as_deref().unwrap().contains("HTTP 500"));
    assert!(done.completed_at.is_some());
    // Linear backoff: 10ms before the second attempt, 20ms before the third.
    assert!(started.elapsed() >= Duration::from_millis(30));
    assert_eq!(hook.hits_async().await, 3);

    assert_eq!(tracker.count_status(JobStatus::Queued), 1);
    assert_eq!(tracker.count_status(JobStatus::Processing), 1);
    let failures = tracker.failures();
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].0, "job-500");
    assert!(failures[0].1.contains("HTTP 500"));

    dispatcher.stop().await.unwrap();
}

#[tokio::test]
async fn retry_events_precede_failure() {
    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method(POST).path(WEBHOOK);
            then.status(503);
        })
        .await;
    let (dispatcher, _tracker) = engine(config(&server).with_max_retries(3));
    let mut events = dispatcher.subscribe();
    dispatcher.start().unwrap();
    let req = dispatcher.submit(payload("job-retry")).await.unwrap();

    let mut attempts = Vec::new();
    loop {
        match next_event(&mut events).await {
            DispatchEvent::Retrying { attempt, delay_ms, .. } => attempts.push((attempt, delay_ms)),
            event if event.is_terminal() && event.request_id() == req.id => break,
            _ => {}
        }
    }
    assert_eq!(attempts, vec![(1, 10), (2, 20), (3, 30)]);
    dispatcher.stop().await.unwrap();
}

#[tokio::test]
async fn structured_response_completes_on_first_attempt() {
    let server = MockServer::start_async().await;
    let hook = server
        .mock_async(|when, then| {
            when.method(POST)
                .path(WEBHOOK)
                .header("content-type", "application/json")
                .json_body_partial(r#"{"job_id":"job-ok","workflow":"ingest"}"#);
            then.status(200)
                .json_body(json!({"executionId": "exec-42", "status": "running", "data": {"rows": 3}}));
        })
        .await;
    let (dispatcher, tracker) = engine(config(&server));
    let mut events = dispatcher.subscribe();
    dispatcher.start().unwrap();

    let req = dispatcher.submit(payload("job-ok")).await.unwrap();
    let done = wait_terminal(&mut events, &req.id).await;
    assert_eq!(done.status, RequestStatus::Completed);
    assert_eq!(done.retry_count, 0);
    assert_eq!(done.runtime_execution_id.as_deref(), Some("exec-42"));
    assert_eq!(done.response_data, Some(json!({"rows": 3})));
    assert!(done.last_error.is_none());
    hook.assert_async().await;
    assert!(tracker.failures().is_empty());

    dispatcher.stop().await.unwrap();
}

#[tokio::test]
async fn unstructured_accepted_response_gets_local_execution_id() {
    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method(POST).path(WEBHOOK);
            then.status(202).json_body(json!({"message": "Workflow was started"}));
        })
        .await;
    let (dispatcher, _tracker) = engine(config(&server));
    let mut events = dispatcher.subscribe();
    dispatcher.start().unwrap();

    let req = dispatcher.submit(payload("job-raw")).await.unwrap();
    let done = wait_terminal(&mut events, &req.id).await;
    assert_eq!(done.status, RequestStatus::Completed);
    let exec = done.runtime_execution_id.unwrap();
    assert!(exec.starts_with("local-"), "{exec}");
    assert_eq!(done.response_data, Some(json!({"message": "Workflow was started"})));

    dispatcher.stop().await.unwrap();
}

#[tokio::test]
async fn malformed_accepted_body_is_retried_then_failed() {
    let server = MockServer::start_async().await;
    let hook = server
        .mock_async(|when, then| {
            when.method(POST).path(WEBHOOK);
            then.status(200).body("{not json");
        })
        .await;
    let (dispatcher, tracker) = engine(config(&server).with_max_retries(2));
    let mut events = dispatcher.subscribe();
    dispatcher.start().unwrap();

    let req = dispatcher.submit(payload("job-garbled")).await.unwrap();
    let done = wait_terminal(&mut events, &req.id).await;
    assert_eq!(done.status, RequestStatus::Failed);
    assert_eq!(done.retry_count, 2);
    assert!(done.runtime_execution_id.is_none());
    assert!(done
        .last_error
        .as_deref()
        .unwrap()
        .contains("malformed runtime response"));
    assert_eq!(hook.hits_async().await, 3);
    assert_eq!(tracker.failures().len(), 1);

    dispatcher.stop().await.unwrap();
}

#[tokio::test]
async fn unknown_workflow_fails_without_retrying() {
    let server = MockServer::start_async().await;
    let hook = server
        .mock_async(|when, then| {
            when.method(POST);
            then.status(200);
        })
        .await;
    let (dispatcher, tracker) = engine(config(&server));
    let mut events = dispatcher.subscribe();
    dispatcher.start().unwrap();

    let req = dispatcher
        .submit(WorkflowPayload::new("job-x", "does-not-exist", json!({})))
        .await
        .unwrap();
    let done = wait_terminal(&mut events, &req.id).await;
    assert_eq!(done.status, RequestStatus::Failed);
    assert_eq!(done.retry_count, 0);
    assert!(done.last_error.unwrap().contains("unknown workflow"));
    assert_eq!(hook.hits_async().await, 0);
    assert_eq!(tracker.failures().len(), 1);

    dispatcher.stop().await.unwrap();
}

#[tokio::test]
async fn attempt_timeouts_are_retried() {
    let server = MockServer::start_async().await;
    let hook = server
        .mock_async(|when, then| {
            when.method(POST).path(WEBHOOK);
            then.status(200).delay(Duration::from_millis(800));
        })
        .await;
    let cfg = config(&server)
        .with_max_retries(2)
        .with_timeout(Duration::from_millis(100));
    let (dispatcher, _tracker) = engine(cfg);
    let mut events = dispatcher.subscribe();
    dispatcher.start().unwrap();

    let req = dispatcher.submit(payload("job-slow")).await.unwrap();
    let done = wait_terminal(&mut events, &req.id).await;
    assert_eq!(done.status, RequestStatus::Failed);
    assert_eq!(done.retry_count, 2);
    assert!(done.last_error.unwrap().contains("timed out"));
    assert_eq!(hook.hits_async().await, 3);

    dispatcher.stop().await.unwrap();
}

#[tokio::test]
async fn full_queue_rejects_without_reporting_queued() {
    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method(POST).path(WEBHOOK);
            then.status(200).delay(Duration::from_millis(300));
        })
        .await;
    let cfg = config(&server).with_workers(1).with_queue_capacity(1);
    let (dispatcher, tracker) = engine(cfg);
    let mut events = dispatcher.subscribe();
    dispatcher.start().unwrap();

    let first = dispatcher.submit(payload("job-1")).await.unwrap();
    wait_started(&mut events, &first.id).await;
    dispatcher.submit(payload("job-2")).await.unwrap();
    assert_eq!(dispatcher.stats().queue_depth, 1);

    let err = dispatcher.submit(payload("job-3")).await.unwrap_err();
    assert!(matches!(err, DispatchError::QueueFull { capacity: 1 }));
    assert!(err.is_submission_error());
    assert_eq!(tracker.count_status(JobStatus::Queued), 2);
    assert!(tracker.calls_for("job-3").is_empty());

    let report = dispatcher.stop().await.unwrap();
    assert_eq!(report.abandoned_requests, 0);
    assert_eq!(tracker.count_status(JobStatus::Processing), 2);
    assert!(tracker.failures().is_empty());
}

#[tokio::test]
async fn stop_drains_buffered_requests() {
    let server = MockServer::start_async().await;
    let hook = server
        .mock_async(|when, then| {
            when.method(POST).path(WEBHOOK);
            then.status(200)
                .delay(Duration::from_millis(30))
                .json_body(json!({"id": "exec-drain"}));
        })
        .await;
    let cfg = config(&server).with_workers(1).with_queue_capacity(10);
    let (dispatcher, tracker) = engine(cfg);
    let mut events = dispatcher.subscribe();
    dispatcher.start().unwrap();

    let mut ids = Vec::new();
    for i in 0..5 {
        ids.push(dispatcher.submit(payload(&format!("job-{i}"))).await.unwrap().id);
    }
    let report = dispatcher.stop().await.unwrap();
    assert_eq!(report.aborted_workers, 0);
    assert_eq!(report.drained_workers, 1);
    assert_eq!(hook.hits_async().await, 5);
    assert!(tracker.failures().is_empty());
    assert!(dispatcher.active_requests().is_empty());

    let mut completed = Vec::new();
    while let Ok(event) = events.try_recv() {
        if let DispatchEvent::Completed { request } = event {
            completed.push(request.id);
        }
    }
    assert_eq!(completed, ids);
    assert!(matches!(
        dispatcher.submit(payload("late")).await,
        Err(DispatchError::NotRunning)
    ));
}

#[tokio::test]
async fn active_requests_are_detached_copies() {
    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method(POST).path(WEBHOOK);
            then.status(200).delay(Duration::from_millis(400));
        })
        .await;
    let (dispatcher, _tracker) = engine(config(&server).with_workers(1));
    let mut events = dispatcher.subscribe();
    dispatcher.start().unwrap();

    let req = dispatcher
        .submit(payload("job-view").with_trigger("user_action"))
        .await
        .unwrap();
    assert_eq!(req.priority, Priority::High);
    wait_started(&mut events, &req.id).await;

    let mut view = dispatcher.active_requests();
    let entry = view.get_mut(&req.id).unwrap();
    assert_eq!(entry.status, RequestStatus::Processing);
    assert!(entry.started_at.is_some());
    entry.status = RequestStatus::Failed;
    view.clear();

    let again = dispatcher.request_status(&req.id).unwrap();
    assert_eq!(again.status, RequestStatus::Processing);
    assert_eq!(dispatcher.stats().active_requests, 1);

    let done = wait_terminal(&mut events, &req.id).await;
    assert_eq!(done.status, RequestStatus::Completed);
    assert!(matches!(
        dispatcher.request_status(&req.id),
        Err(DispatchError::NotFound(_))
    ));
    assert!(dispatcher.active_requests().is_empty());

    dispatcher.stop().await.unwrap();
}

#[tokio::test]
async fn registry_only_holds_processing_requests() {
    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method(POST).path(WEBHOOK);
            then.status(500).delay(Duration::from_millis(20));
        })
        .await;
    let (dispatcher, _tracker) = engine(config(&server).with_workers(2).with_max_retries(1));
    dispatcher.start().unwrap();
    for i in 0..4 {
        dispatcher.submit(payload(&format!("job-{i}"))).await.unwrap();
    }
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        let view = dispatcher.active_requests();
        assert!(view.len() <= 2);
        assert!(view.values().all(|r| r.status == RequestStatus::Processing));
        if view.is_empty() && dispatcher.stats().queue_depth == 0 {
            break;
        }
        assert!(Instant::now() < deadline, "requests never drained");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    dispatcher.stop().await.unwrap();
}

#[tokio::test]
async fn cancelled_submission_is_not_queued() {
    let server = MockServer::start_async().await;
    let (dispatcher, tracker) = engine(config(&server));
    dispatcher.start().unwrap();

    let token = CancellationToken::new();
    token.cancel();
    let err = dispatcher
        .submit_cancellable(payload("job-c"), &token)
        .await
        .unwrap_err();
    assert!(matches!(err, DispatchError::Cancelled));
    assert!(tracker.calls().is_empty());
    assert_eq!(dispatcher.stats().queue_depth, 0);

    dispatcher.stop().await.unwrap();
}

#[tokio::test]
async fn bounded_stop_fails_unfinished_work() {
    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method(POST).path(WEBHOOK);
            then.status(200).delay(Duration::from_secs(5));
        })
        .await;
    let cfg = config(&server).with_workers(1).with_queue_capacity(5);
    let (dispatcher, tracker) = engine(cfg);
    let mut events = dispatcher.subscribe();
    dispatcher.start().unwrap();

    let first = dispatcher.submit(payload("job-a")).await.unwrap();
    wait_started(&mut events, &first.id).await;
    dispatcher.submit(payload("job-b")).await.unwrap();
    dispatcher.submit(payload("job-c")).await.unwrap();

    let started = Instant::now();
    let report = dispatcher
        .stop_with_grace(Duration::from_millis(100))
        .await
        .unwrap();
    assert!(started.elapsed() < Duration::from_secs(3));
    assert_eq!(report.aborted_workers, 1);
    assert_eq!(report.abandoned_requests, 3);
    assert!(dispatcher.active_requests().is_empty());

    let mut failures = tracker.failures();
    failures.sort();
    let jobs: Vec<&str> = failures.iter().map(|(job, _)| job.as_str()).collect();
    assert_eq!(jobs, vec!["job-a", "job-b", "job-c"]);
    assert!(failures.iter().all(|(_, reason)| reason == SHUTDOWN_REASON));
}

/// Holds the queued update open so a stop can land mid-submission.
struct SlowQueuedTracker {
    entered: tokio::sync::Notify,
    hold: Duration,
    inner: InMemoryJobTracker,
}

impl SlowQueuedTracker {
    fn new(hold: Duration) -> Self {
        Self {
            entered: tokio::sync::Notify::new(),
            hold,
            inner: InMemoryJobTracker::new(),
        }
    }
}

#[async_trait::async_trait]
impl JobTracker for SlowQueuedTracker {
    async fn update_job(&self, job_id: &str, update: JobUpdate) -> anyhow::Result<()> {
        if update.status == JobStatus::Queued {
            self.entered.notify_one();
            tokio::time::sleep(self.hold).await;
        }
        self.inner.update_job(job_id, update).await
    }

    async fn fail_job(&self, job_id: &str, reason: &str) -> anyhow::Result<()> {
        self.inner.fail_job(job_id, reason).await
    }
}

#[tokio::test]
async fn bounded_stop_fails_submission_in_flight() {
    let server = MockServer::start_async().await;
    let hook = server
        .mock_async(|when, then| {
            when.method(POST).path(WEBHOOK);
            then.status(200).json_body(json!({"executionId": "exec-late"}));
        })
        .await;
    let tracker = Arc::new(SlowQueuedTracker::new(Duration::from_millis(500)));
    let dispatcher = Dispatcher::new(config(&server).with_workers(1), tracker.clone()).unwrap();
    dispatcher.start().unwrap();

    let submitting = {
        let dispatcher = dispatcher.clone();
        tokio::spawn(async move { dispatcher.submit(payload("job-late")).await })
    };
    timeout(Duration::from_secs(5), tracker.entered.notified())
        .await
        .unwrap();

    let report = dispatcher
        .stop_with_grace(Duration::from_millis(50))
        .await
        .unwrap();
    let accepted = submitting.await.unwrap().unwrap();
    assert_eq!(accepted.job_id, "job-late");
    assert_eq!(report.aborted_workers, 1);
    assert_eq!(report.abandoned_requests, 1);

    let failures = tracker.inner.failures();
    assert_eq!(failures, vec![("job-late".to_string(), SHUTDOWN_REASON.to_string())]);
    assert_eq!(hook.hits_async().await, 0);
}

#[tokio::test]
async fn graceful_stop_runs_submission_in_flight() {
    let server = MockServer::start_async().await;
    let hook = server
        .mock_async(|when, then| {
            when.method(POST).path(WEBHOOK);
            then.status(200).json_body(json!({"executionId": "exec-late"}));
        })
        .await;
    let tracker = Arc::new(SlowQueuedTracker::new(Duration::from_millis(200)));
    let dispatcher = Dispatcher::new(config(&server), tracker.clone()).unwrap();
    let mut events = dispatcher.subscribe();
    dispatcher.start().unwrap();

    let submitting = {
        let dispatcher = dispatcher.clone();
        tokio::spawn(async move { dispatcher.submit(payload("job-late")).await })
    };
    timeout(Duration::from_secs(5), tracker.entered.notified())
        .await
        .unwrap();

    let report = dispatcher.stop().await.unwrap();
    assert_eq!(report.aborted_workers, 0);
    let accepted = submitting.await.unwrap().unwrap();
    let done = wait_terminal(&mut events, &accepted.id).await;
    assert_eq!(done.status, RequestStatus::Completed);
    assert_eq!(hook.hits_async().await, 1);

    // The flag is cleared under the same lock that admits submissions.
    assert!(matches!(
        dispatcher.submit(payload("job-after")).await,
        Err(DispatchError::NotRunning)
    ));
    assert!(tracker.inner.failures().is_empty());
}

#[tokio::test]
async fn health_does_not_gate_submissions() {
    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method(GET);
            then.status(500);
        })
        .await;
    server
        .mock_async(|when, then| {
            when.method(POST).path(WEBHOOK);
            then.status(200).json_body(json!({"executionId": "exec-h"}));
        })
        .await;
    let cfg = config(&server).with_health_interval(Duration::from_millis(50));
    let (dispatcher, _tracker) = engine(cfg);
    let mut health = dispatcher.health_updates();
    let mut events = dispatcher.subscribe();
    dispatcher.start().unwrap();

    timeout(Duration::from_secs(5), health.changed())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(health.borrow().state, HealthState::Unhealthy);
    assert_eq!(dispatcher.health().state, HealthState::Unhealthy);

    let req = dispatcher.submit(payload("job-h")).await.unwrap();
    let done = wait_terminal(&mut events, &req.id).await;
    assert_eq!(done.status, RequestStatus::Completed);

    let on_demand = dispatcher.check_health().await;
    assert_eq!(on_demand.state, HealthState::Unhealthy);
    dispatcher.stop().await.unwrap();
}

struct BrokenTracker;

#[async_trait::async_trait]
impl JobTracker for BrokenTracker {
    async fn update_job(&self, _job_id: &str, _update: JobUpdate) -> anyhow::Result<()> {
        anyhow::bail!("tracker offline")
    }

    async fn fail_job(&self, _job_id: &str, _reason: &str) -> anyhow::Result<()> {
        anyhow::bail!("tracker offline")
    }
}

#[tokio::test]
async fn tracker_errors_do_not_change_outcomes() {
    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method(POST).path(WEBHOOK);
            then.status(200).json_body(json!({"executionId": "exec-t"}));
        })
        .await;
    let dispatcher = Dispatcher::new(config(&server), Arc::new(BrokenTracker)).unwrap();
    let mut events = dispatcher.subscribe();
    dispatcher.start().unwrap();

    let req = dispatcher.submit(payload("job-t")).await.unwrap();
    let done = wait_terminal(&mut events, &req.id).await;
    assert_eq!(done.status, RequestStatus::Completed);
    assert_eq!(done.runtime_execution_id.as_deref(), Some("exec-t"));
    dispatcher.stop().await.unwrap();
}

#[tokio::test]
async fn execution_api_is_proxied() {
    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method(GET).path("/api/v1/executions/exec-9");
            then.status(200).json_body(json!({"id": "exec-9", "finished": true}));
        })
        .await;
    let stop = server
        .mock_async(|when, then| {
            when.method(POST).path("/api/v1/executions/exec-9/stop");
            then.status(200).json_body(json!({}));
        })
        .await;
    let (dispatcher, _tracker) = engine(config(&server));

    let status = dispatcher.execution_status("exec-9").await.unwrap();
    assert_eq!(status["finished"], json!(true));
    dispatcher.stop_execution("exec-9").await.unwrap();
    stop.assert_async().await;
    assert!(matches!(
        dispatcher.execution_status("exec-missing").await,
        Err(DispatchError::Client(_))
    ));
}
