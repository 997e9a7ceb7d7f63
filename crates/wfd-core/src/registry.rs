use std::collections::HashMap;

use chrono::Utc;

use crate::request::{Request, RequestStatus, RuntimeResponse};

/// Terminal outcome applied by `ActiveRegistry::finish`.
#[derive(Debug, Clone)]
pub enum Outcome {
    Completed(RuntimeResponse),
    Failed(String),
}

/// In-flight requests keyed by request id.
///
/// Not synchronized on its own: it lives inside the dispatcher state lock
/// next to the running flag. A request is present iff its status is
/// `processing`.
#[derive(Debug, Default)]
pub struct ActiveRegistry {
    entries: HashMap<String, Request>,
}

impl ActiveRegistry {
    /// Mark `request` processing and insert it.
    pub fn begin(&mut self, request: &mut Request) {
        request.status = RequestStatus::Processing;
        request.started_at = Some(Utc::now());
        self.entries.insert(request.id.clone(), request.clone());
    }

    /// Mirror retry bookkeeping into the registered copy.
    pub fn record_attempt(&mut self, request: &Request) {
        if let Some(entry) = self.entries.get_mut(&request.id) {
            entry.retry_count = request.retry_count;
            entry.last_error = request.last_error.clone();
        }
    }

    /// Apply the terminal status and remove the entry in one step.
    pub fn finish(&mut self, request: &mut Request, outcome: Outcome) {
        request.completed_at = Some(Utc::now());
        match outcome {
            Outcome::Completed(resp) => {
                request.status = RequestStatus::Completed;
                request.runtime_execution_id = Some(resp.execution_id);
                request.response_data = Some(resp.data);
            }
            Outcome::Failed(reason) => {
                request.status = RequestStatus::Failed;
                request.last_error = Some(reason);
            }
        }
        self.entries.remove(&request.id);
    }

    /// Remove an entry whose owning worker is gone, failing it.
    pub fn evict(&mut self, id: &str, reason: &str) -> Option<Request> {
        let mut request = self.entries.remove(id)?;
        request.completed_at = Some(Utc::now());
        request.status = RequestStatus::Failed;
        request.last_error = Some(reason.to_string());
        Some(request)
    }

    pub fn get(&self, id: &str) -> Option<Request> {
        self.entries.get(id).cloned()
    }

    pub fn ids(&self) -> Vec<String> {
        self.entries.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Detached copy; later mutations of either side are invisible to the other.
    pub fn snapshot(&self) -> HashMap<String, Request> {
        self.entries.clone()
    }
}
