//! Dispatcher lifecycle: start, submit, stop, and introspection.
//!
//! One lock guards the running flag, the queue handles and the active
//! registry together, so a submission can never slip in after `stop` has
//! flipped the flag, and a request is in the registry exactly while it is
//! `processing`.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::{broadcast, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::client::RuntimeClient;
use crate::config::DispatchConfig;
use crate::error::{ClientError, DispatchError};
use crate::events::DispatchEvent;
use crate::health::{run_health_monitor, HealthReport};
use crate::queue::{self, QueueError, QueueReceiver, QueueSender};
use crate::registry::ActiveRegistry;
use crate::request::{Request, WorkflowPayload};
use crate::tasks::{TaskHandle, TaskOutcome, TaskSet};
use crate::tracker::{JobStatus, JobTracker, JobUpdate};
use crate::worker;

const EVENT_CAPACITY: usize = 1024;

/// Reason recorded on requests abandoned by a bounded shutdown.
pub const SHUTDOWN_REASON: &str = "dispatcher stopped before the request finished";

/// Reason recorded when a submission is cancelled after its queued update.
pub const SUBMISSION_CANCELLED_REASON: &str = "submission cancelled";

#[derive(Default)]
pub(crate) struct EngineState {
    pub(crate) running: bool,
    pub(crate) registry: ActiveRegistry,
    sender: Option<QueueSender>,
    receiver: Option<QueueReceiver>,
    stop: Option<CancellationToken>,
    workers: TaskSet,
    monitor: Option<TaskHandle>,
}

pub(crate) struct Shared {
    pub(crate) config: DispatchConfig,
    pub(crate) client: RuntimeClient,
    pub(crate) tracker: Arc<dyn JobTracker>,
    pub(crate) state: Mutex<EngineState>,
    events: broadcast::Sender<DispatchEvent>,
    health: Arc<watch::Sender<HealthReport>>,
}

impl Shared {
    pub(crate) fn emit(&self, event: DispatchEvent) {
        // No subscribers is the common case.
        let _ = self.events.send(event);
    }
}

/// Point-in-time view of the dispatcher.
#[derive(Debug, Clone, Serialize)]
pub struct DispatchStats {
    pub running: bool,
    pub queue_depth: usize,
    pub queue_capacity: usize,
    pub active_requests: usize,
    pub worker_count: usize,
    pub batch_size: usize,
    pub health: HealthReport,
}

/// What a stop call did with the work that was in the system.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ShutdownReport {
    pub drained_workers: usize,
    pub aborted_workers: usize,
    /// Requests failed because their worker was aborted or they were still
    /// buffered when it was.
    pub abandoned_requests: usize,
}

/// Bounded, retrying dispatcher for workflow executions.
///
/// Cheap to clone; all clones drive the same engine. `start` spawns onto the
/// ambient Tokio runtime and must be called from within one.
#[derive(Clone)]
pub struct Dispatcher {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("base_url", &self.shared.client.base_url())
            .field("running", &self.is_running())
            .finish()
    }
}

impl Dispatcher {
    pub fn new(config: DispatchConfig, tracker: Arc<dyn JobTracker>) -> Result<Self, ClientError> {
        let config = config.normalized();
        let client = RuntimeClient::new(&config)?;
        Ok(Self::with_client(config, client, tracker))
    }

    /// Build around an existing runtime client.
    pub fn with_client(config: DispatchConfig, client: RuntimeClient, tracker: Arc<dyn JobTracker>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let (health, _) = watch::channel(HealthReport::unknown());
        Self {
            shared: Arc::new(Shared {
                config: config.normalized(),
                client,
                tracker,
                state: Mutex::new(EngineState::default()),
                events,
                health: Arc::new(health),
            }),
        }
    }

    pub fn config(&self) -> &DispatchConfig {
        &self.shared.config
    }

    pub fn is_running(&self) -> bool {
        self.shared.state.lock().running
    }

    /// Create the queue, spawn the workers and the health monitor.
    pub fn start(&self) -> Result<(), DispatchError> {
        let cfg = &self.shared.config;
        let mut state = self.shared.state.lock();
        if state.running {
            return Err(DispatchError::AlreadyRunning);
        }
        let (sender, receiver) = queue::bounded(cfg.queue_capacity);
        let stop = CancellationToken::new();

        let mut workers = TaskSet::new();
        for worker_id in 0..cfg.worker_count {
            let handle = tokio::spawn(worker::run_worker(
                worker_id,
                self.shared.clone(),
                receiver.clone(),
            ));
            workers.push(TaskHandle::new(format!("dispatch.worker.{worker_id}"), handle));
        }
        let monitor = tokio::spawn(run_health_monitor(
            self.shared.client.clone(),
            cfg.health_interval,
            self.shared.health.clone(),
            stop.clone(),
        ));

        state.running = true;
        state.sender = Some(sender);
        state.receiver = Some(receiver);
        state.stop = Some(stop);
        state.workers = workers;
        state.monitor = Some(TaskHandle::new("dispatch.health", monitor));
        info!(
            target: "wfd::dispatch",
            runtime = %cfg.base(),
            workers = cfg.worker_count,
            queue_capacity = cfg.queue_capacity,
            max_retries = cfg.max_retries,
            "dispatcher started"
        );
        Ok(())
    }

    /// Close the queue and wait until every buffered and in-flight request
    /// has reached a terminal state.
    pub async fn stop(&self) -> Result<ShutdownReport, DispatchError> {
        self.shutdown(None).await
    }

    /// Like [`Dispatcher::stop`] but aborts workers still busy after `grace`.
    /// Requests they held, and anything left in the queue, are failed through
    /// the job tracker.
    pub async fn stop_with_grace(&self, grace: Duration) -> Result<ShutdownReport, DispatchError> {
        self.shutdown(Some(grace)).await
    }

    async fn shutdown(&self, grace: Option<Duration>) -> Result<ShutdownReport, DispatchError> {
        let (stop, sender, receiver, workers, monitor) = {
            let mut state = self.shared.state.lock();
            if !state.running {
                return Err(DispatchError::NotRunning);
            }
            state.running = false;
            (
                state.stop.take(),
                state.sender.take(),
                state.receiver.take(),
                std::mem::take(&mut state.workers),
                state.monitor.take(),
            )
        };
        if let Some(stop) = stop {
            stop.cancel();
        }
        let pending = sender.as_ref().map(QueueSender::depth).unwrap_or_default();
        drop(sender);
        info!(target: "wfd::dispatch", pending, ?grace, "dispatcher stopping");

        let outcomes = match grace {
            None => workers.join_all().await,
            Some(grace) => workers.shutdown_with_grace(grace).await,
        };
        if let Some(monitor) = monitor {
            let (name, handle) = monitor.into_inner();
            if let Err(err) = handle.await {
                debug!(target: "wfd::dispatch", task = %name, ?err, "health monitor join failed");
            }
        }

        let aborted = outcomes.iter().filter(|o| **o == TaskOutcome::Aborted).count();
        let mut report = ShutdownReport {
            drained_workers: outcomes.len() - aborted,
            aborted_workers: aborted,
            abandoned_requests: 0,
        };
        if aborted > 0 {
            report.abandoned_requests = self.abandon(receiver).await;
            warn!(
                target: "wfd::dispatch",
                aborted_workers = aborted,
                abandoned = report.abandoned_requests,
                "dispatcher stopped with unfinished work"
            );
        } else {
            info!(target: "wfd::dispatch", workers = report.drained_workers, "dispatcher stopped");
        }
        Ok(report)
    }

    /// Fail whatever aborted workers left behind, including requests whose
    /// submission reserved a slot before the stop and sends after it.
    async fn abandon(&self, receiver: Option<QueueReceiver>) -> usize {
        let mut orphans: Vec<Request> = {
            let mut state = self.shared.state.lock();
            state
                .registry
                .ids()
                .iter()
                .filter_map(|id| state.registry.evict(id, SHUTDOWN_REASON))
                .collect()
        };
        if let Some(receiver) = receiver {
            orphans.extend(
                receiver
                    .close_and_drain()
                    .await
                    .into_iter()
                    .map(|req| worker::fail_unstarted(req, SHUTDOWN_REASON)),
            );
        }
        for request in &orphans {
            worker::report_terminal(&self.shared, request).await;
        }
        orphans.len()
    }

    /// Queue a workflow execution. Never blocks on a full queue.
    pub async fn submit(&self, payload: WorkflowPayload) -> Result<Request, DispatchError> {
        self.submit_cancellable(payload, &CancellationToken::new()).await
    }

    /// Queue a workflow execution unless `cancel` fires first.
    pub async fn submit_cancellable(
        &self,
        payload: WorkflowPayload,
        cancel: &CancellationToken,
    ) -> Result<Request, DispatchError> {
        if cancel.is_cancelled() {
            return Err(DispatchError::Cancelled);
        }
        let request = Request::new(payload, self.shared.config.max_retries);
        // Admission is decided under the state lock: once `stop` has cleared
        // the running flag no slot can be reserved.
        let reserved = {
            let state = self.shared.state.lock();
            match (&state.sender, state.running) {
                (Some(sender), true) => sender
                    .try_reserve()
                    .map_err(|err| (err, sender.capacity())),
                _ => return Err(DispatchError::NotRunning),
            }
        };
        let slot = match reserved {
            Ok(slot) => slot,
            Err((QueueError::Full, capacity)) => {
                metrics::counter!("wfd.requests.rejected").increment(1);
                warn!(
                    target: "wfd::dispatch",
                    job_id = %request.job_id,
                    workflow = %request.workflow,
                    capacity,
                    "dispatch queue full; rejecting request"
                );
                return Err(DispatchError::QueueFull { capacity });
            }
            Err((QueueError::Closed, _)) => return Err(DispatchError::NotRunning),
        };

        if let Err(err) = self
            .shared
            .tracker
            .update_job(&request.job_id, JobUpdate::for_request(&request, JobStatus::Queued))
            .await
        {
            warn!(target: "wfd::dispatch", job_id = %request.job_id, error = %err, "job tracker rejected queued update");
        }
        if cancel.is_cancelled() {
            drop(slot);
            if let Err(err) = self
                .shared
                .tracker
                .fail_job(&request.job_id, SUBMISSION_CANCELLED_REASON)
                .await
            {
                warn!(target: "wfd::dispatch", job_id = %request.job_id, error = %err, "job tracker rejected failure");
            }
            return Err(DispatchError::Cancelled);
        }

        metrics::counter!("wfd.requests.submitted", "workflow" => request.workflow.clone())
            .increment(1);
        debug!(
            target: "wfd::dispatch",
            request_id = %request.id,
            job_id = %request.job_id,
            workflow = %request.workflow,
            priority = request.priority.as_i32(),
            "request queued"
        );
        self.shared.emit(DispatchEvent::Queued {
            request: request.clone(),
        });
        slot.send(request.clone());
        Ok(request)
    }

    /// Detached copy of every request currently processing.
    pub fn active_requests(&self) -> HashMap<String, Request> {
        self.shared.state.lock().registry.snapshot()
    }

    /// Copy of an in-flight request.
    pub fn request_status(&self, request_id: &str) -> Result<Request, DispatchError> {
        self.shared
            .state
            .lock()
            .registry
            .get(request_id)
            .ok_or_else(|| DispatchError::NotFound(request_id.to_string()))
    }

    pub fn stats(&self) -> DispatchStats {
        let (running, active, sender) = {
            let state = self.shared.state.lock();
            (state.running, state.registry.len(), state.sender.clone())
        };
        let cfg = &self.shared.config;
        DispatchStats {
            running,
            queue_depth: sender.as_ref().map(QueueSender::depth).unwrap_or_default(),
            queue_capacity: sender
                .as_ref()
                .map(QueueSender::capacity)
                .unwrap_or(cfg.queue_capacity),
            active_requests: active,
            worker_count: cfg.worker_count,
            batch_size: cfg.batch_size,
            health: self.health(),
        }
    }

    /// Most recent report from the background monitor.
    pub fn health(&self) -> HealthReport {
        self.shared.health.borrow().clone()
    }

    pub fn health_updates(&self) -> watch::Receiver<HealthReport> {
        self.shared.health.subscribe()
    }

    /// Probe the runtime now, outside the monitor's schedule.
    pub async fn check_health(&self) -> HealthReport {
        self.shared.client.probe().await
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DispatchEvent> {
        self.shared.events.subscribe()
    }

    pub async fn execution_status(&self, execution_id: &str) -> Result<Value, DispatchError> {
        Ok(self.shared.client.execution_status(execution_id).await?)
    }

    pub async fn stop_execution(&self, execution_id: &str) -> Result<(), DispatchError> {
        Ok(self.shared.client.stop_execution(execution_id).await?)
    }
}
