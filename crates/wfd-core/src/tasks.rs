use std::borrow::Cow;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, trace};

#[derive(Debug)]
pub struct TaskHandle {
    name: Cow<'static, str>,
    handle: JoinHandle<()>,
}

impl TaskHandle {
    pub fn new(name: impl Into<Cow<'static, str>>, handle: JoinHandle<()>) -> Self {
        Self {
            name: name.into(),
            handle,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn into_inner(self) -> (Cow<'static, str>, JoinHandle<()>) {
        (self.name, self.handle)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskOutcome {
    Completed,
    Aborted,
}

/// Background tasks owned by a running dispatcher.
#[derive(Debug, Default)]
pub struct TaskSet {
    tasks: Vec<TaskHandle>,
}

impl TaskSet {
    pub fn new() -> Self {
        Self { tasks: Vec::new() }
    }

    pub fn push(&mut self, task: TaskHandle) {
        trace!(target: "wfd::tasks", task = task.name(), "task registered");
        self.tasks.push(task);
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Wait for every task to finish on its own.
    pub async fn join_all(self) -> Vec<TaskOutcome> {
        let mut outcomes = Vec::with_capacity(self.tasks.len());
        for task in self.tasks {
            let (name, handle) = task.into_inner();
            match handle.await {
                Ok(()) => outcomes.push(TaskOutcome::Completed),
                Err(err) => {
                    debug!(target: "wfd::tasks", task = %name, ?err, "task exited with error");
                    outcomes.push(TaskOutcome::Aborted);
                }
            }
        }
        outcomes
    }

    /// Wait up to `grace` overall, then abort whatever is still running.
    pub async fn shutdown_with_grace(self, grace: Duration) -> Vec<TaskOutcome> {
        let deadline = tokio::time::Instant::now() + grace;
        let mut outcomes = Vec::with_capacity(self.tasks.len());
        for task in self.tasks {
            let (name, mut handle) = task.into_inner();
            let sleeper = tokio::time::sleep_until(deadline);
            tokio::pin!(sleeper);
            let outcome = tokio::select! {
                res = &mut handle => {
                    if let Err(err) = res {
                        debug!(target: "wfd::tasks", task = %name, ?err, "task exited with error");
                        TaskOutcome::Aborted
                    } else {
                        TaskOutcome::Completed
                    }
                }
                _ = &mut sleeper => {
                    handle.abort();
                    match handle.await {
                        Ok(_) => TaskOutcome::Completed,
                        Err(err) => {
                            debug!(target: "wfd::tasks", task = %name, ?err, "task join after abort failed");
                            TaskOutcome::Aborted
                        }
                    }
                }
            };
            outcomes.push(outcome);
        }
        outcomes
    }
}
