use serde::Serialize;

use crate::request::Request;

/// Lifecycle notifications fanned out to `Dispatcher::subscribe` receivers.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DispatchEvent {
    Queued { request: Request },
    Started { request: Request, worker: usize },
    Retrying {
        request_id: String,
        job_id: String,
        attempt: u32,
        delay_ms: u64,
        error: String,
    },
    Completed { request: Request },
    Failed { request: Request },
}

impl DispatchEvent {
    pub fn request_id(&self) -> &str {
        match self {
            DispatchEvent::Queued { request }
            | DispatchEvent::Started { request, .. }
            | DispatchEvent::Completed { request }
            | DispatchEvent::Failed { request } => &request.id,
            DispatchEvent::Retrying { request_id, .. } => request_id,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            DispatchEvent::Completed { .. } | DispatchEvent::Failed { .. }
        )
    }

    /// The terminal request carried by `Completed` / `Failed`.
    pub fn into_terminal(self) -> Option<Request> {
        match self {
            DispatchEvent::Completed { request } | DispatchEvent::Failed { request } => Some(request),
            _ => None,
        }
    }
}
