//! Workflow dispatch engine: accepts workflow execution requests, buffers
//! them in a bounded queue and drives them against an external HTTP runtime
//! with retries, while reporting job status to a pluggable tracker.

pub mod client;
mod config;
pub use config::{
    config_schema_json, load_config, load_settings, parse_settings, DispatchConfig, DispatchSettings,
    RuntimeSettings, Settings, DEFAULT_BATCH_SIZE, DEFAULT_HEALTH_INTERVAL, DEFAULT_HEALTH_TIMEOUT,
    DEFAULT_MAX_RETRIES, DEFAULT_QUEUE_CAPACITY, DEFAULT_RETRY_DELAY, DEFAULT_TIMEOUT,
    DEFAULT_WORKER_COUNT,
};
mod engine;
pub use engine::{
    DispatchStats, Dispatcher, ShutdownReport, SHUTDOWN_REASON, SUBMISSION_CANCELLED_REASON,
};
mod error;
pub use error::{ClientError, DispatchError, ExecutionError};
pub mod events;
pub use events::DispatchEvent;
pub mod health;
pub use health::{HealthReport, HealthState};
pub mod http_client;
mod queue;
mod registry;
pub mod request;
pub use request::{Priority, Request, RequestStatus, RuntimeResponse, WorkflowPayload};
pub mod tasks;
pub mod tracker;
pub use tracker::{InMemoryJobTracker, JobStatus, JobTracker, JobUpdate, TracingJobTracker};
mod worker;
