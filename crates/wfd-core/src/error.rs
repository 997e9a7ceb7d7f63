/// Errors surfaced synchronously by the dispatcher's public surface.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("dispatcher is not running")]
    NotRunning,
    #[error("dispatcher is already running")]
    AlreadyRunning,
    #[error("dispatch queue is full (capacity {capacity})")]
    QueueFull { capacity: usize },
    #[error("submission cancelled before the request was queued")]
    Cancelled,
    #[error("request `{0}` is not active")]
    NotFound(String),
    #[error(transparent)]
    Client(#[from] ClientError),
}

impl DispatchError {
    /// Submission errors are never retried by the engine; callers apply
    /// their own backoff.
    pub fn is_submission_error(&self) -> bool {
        matches!(
            self,
            DispatchError::NotRunning | DispatchError::QueueFull { .. } | DispatchError::Cancelled
        )
    }
}

/// Failure of one execution attempt against the runtime.
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum ExecutionError {
    /// Unknown workflow name; terminal.
    #[error("configuration error: {0}")]
    Configuration(String),
    /// Payload could not be turned into a request body; terminal.
    #[error("client setup error: {0}")]
    ClientSetup(String),
    /// Network failure, timeout or non-accepted HTTP status; retried.
    #[error("execution failed: {0}")]
    Transient(String),
}

impl ExecutionError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, ExecutionError::Transient(_))
    }

    pub fn kind(&self) -> &'static str {
        match self {
            ExecutionError::Configuration(_) => "configuration",
            ExecutionError::ClientSetup(_) => "client_setup",
            ExecutionError::Transient(_) => "transient",
        }
    }
}

/// Errors from on-demand runtime calls and client construction.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("failed to build http client: {0}")]
    Build(String),
    #[error("http request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("runtime returned HTTP {code}: {body}")]
    Status { code: u16, body: String },
    #[error("invalid runtime response: {0}")]
    Decode(String),
}
