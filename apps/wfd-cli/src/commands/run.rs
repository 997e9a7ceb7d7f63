use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::Args;
use serde::Serialize;
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;
use wfd_core::{
    DispatchError, Dispatcher, JobTracker, JobUpdate, Request, RequestStatus, ShutdownReport,
    TracingJobTracker, WorkflowPayload, SUBMISSION_CANCELLED_REASON,
};

use super::{print_json, GlobalOpts};

#[derive(Args, Clone, Debug)]
pub struct RunArgs {
    /// JSONL file of workflow payloads (`-` reads stdin)
    #[arg(long)]
    pub jobs: PathBuf,
    /// Reject instead of waiting when the queue is full
    #[arg(long)]
    pub no_wait: bool,
    /// Backoff in milliseconds between retries of a rejected submission
    #[arg(long, default_value_t = 50)]
    pub backoff_ms: u64,
    /// Abort unfinished work this many seconds after an interrupt
    #[arg(long, default_value_t = 10)]
    pub grace_secs: u64,
    /// Pretty-print the summary
    #[arg(long)]
    pub pretty: bool,
}

#[derive(Debug, Serialize)]
struct JobResult {
    job_id: String,
    request_id: String,
    workflow: String,
    status: RequestStatus,
    execution_id: Option<String>,
    retries: u32,
    error: Option<String>,
}

impl From<Request> for JobResult {
    fn from(r: Request) -> Self {
        Self {
            job_id: r.job_id,
            request_id: r.id,
            workflow: r.workflow,
            status: r.status,
            execution_id: r.runtime_execution_id,
            retries: r.retry_count,
            error: r.last_error,
        }
    }
}

#[derive(Debug, Default, Serialize)]
struct RunSummary {
    submitted: usize,
    rejected: usize,
    completed: usize,
    failed: usize,
    interrupted: bool,
    /// Set when the event stream dropped entries; `results` is then partial
    /// while the counts stay exact.
    results_truncated: bool,
    shutdown: ShutdownReport,
    results: Vec<JobResult>,
}

/// Counts failures of accepted requests in constant memory and logs every
/// transition.
#[derive(Debug, Default)]
struct RunTracker {
    failed: AtomicUsize,
    log: TracingJobTracker,
}

impl RunTracker {
    fn failed(&self) -> usize {
        self.failed.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl JobTracker for RunTracker {
    async fn update_job(&self, job_id: &str, update: JobUpdate) -> anyhow::Result<()> {
        self.log.update_job(job_id, update).await
    }

    async fn fail_job(&self, job_id: &str, reason: &str) -> anyhow::Result<()> {
        if reason != SUBMISSION_CANCELLED_REASON {
            self.failed.fetch_add(1, Ordering::SeqCst);
        }
        self.log.fail_job(job_id, reason).await
    }
}

pub async fn execute(global: &GlobalOpts, args: &RunArgs) -> Result<()> {
    let cfg = global.dispatch_config()?;
    let payloads = read_jobs(&args.jobs)?;
    let tracker = Arc::new(RunTracker::default());
    let dispatcher = Dispatcher::new(cfg, tracker.clone())?;

    let mut events = dispatcher.subscribe();
    let collector = tokio::spawn(async move {
        let mut finished = Vec::new();
        let mut truncated = false;
        loop {
            match events.recv().await {
                Ok(event) => {
                    if let Some(request) = event.into_terminal() {
                        finished.push(request);
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    truncated = true;
                    tracing::warn!(target: "wfd::dispatch", skipped, "summary missed dispatch events");
                }
                Err(RecvError::Closed) => break,
            }
        }
        (finished, truncated)
    });

    let interrupt = CancellationToken::new();
    {
        let interrupt = interrupt.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                interrupt.cancel();
            }
        });
    }

    dispatcher.start()?;
    let mut summary = RunSummary::default();
    let backoff = Duration::from_millis(args.backoff_ms.max(1));
    'jobs: for payload in payloads {
        loop {
            match dispatcher.submit_cancellable(payload.clone(), &interrupt).await {
                Ok(_) => {
                    summary.submitted += 1;
                    break;
                }
                Err(DispatchError::QueueFull { .. }) if !args.no_wait => {
                    tokio::select! {
                        _ = interrupt.cancelled() => break 'jobs,
                        _ = tokio::time::sleep(backoff) => {}
                    }
                }
                Err(DispatchError::QueueFull { .. }) => {
                    summary.rejected += 1;
                    break;
                }
                Err(DispatchError::Cancelled) => break 'jobs,
                Err(err) => return Err(err.into()),
            }
        }
    }

    summary.interrupted = interrupt.is_cancelled();
    summary.shutdown = if summary.interrupted {
        dispatcher
            .stop_with_grace(Duration::from_secs(args.grace_secs))
            .await?
    } else {
        tokio::select! {
            report = dispatcher.stop() => report?,
            _ = interrupt.cancelled() => {
                eprintln!("interrupted while draining; exiting");
                std::process::exit(130);
            }
        }
    };
    drop(dispatcher);

    let (finished, truncated) = collector.await.context("event collector panicked")?;
    // Every accepted request is terminal once stop returns; only failures
    // reach the tracker.
    summary.failed = tracker.failed();
    summary.completed = summary.submitted.saturating_sub(summary.failed);
    summary.results_truncated = truncated;
    summary.results = finished.into_iter().map(JobResult::from).collect();
    print_json(&summary, args.pretty)?;
    if summary.failed > 0 {
        bail!("{} of {} request(s) failed", summary.failed, summary.submitted);
    }
    Ok(())
}

/// One payload per line; blank lines and `#` comments are skipped.
fn read_jobs(path: &Path) -> Result<Vec<WorkflowPayload>> {
    let reader: Box<dyn BufRead> = if path.as_os_str() == "-" {
        Box::new(BufReader::new(std::io::stdin()))
    } else {
        let file = std::fs::File::open(path)
            .with_context(|| format!("opening jobs file {}", path.display()))?;
        Box::new(BufReader::new(file))
    };
    let mut payloads = Vec::new();
    for (idx, line) in reader.lines().enumerate() {
        let line = line?;
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        let payload: WorkflowPayload = serde_json::from_str(trimmed)
            .with_context(|| format!("invalid payload on line {}", idx + 1))?;
        payloads.push(payload);
    }
    Ok(payloads)
}
