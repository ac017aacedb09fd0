//! Process-wide set of running pipeline tasks.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tracing::{info, warn};

use crate::error::PipelineError;
use crate::task::{PipelineTask, TaskState};

pub struct Runner {
    tasks: Arc<Mutex<HashMap<String, Arc<PipelineTask>>>>,
    shutdown_grace: Duration,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Runner {
    pub fn new(shutdown_grace: Duration) -> Self {
        Self {
            tasks: Arc::new(Mutex::new(HashMap::new())),
            shutdown_grace,
        }
    }

    /// Start `task` and track it until it finishes, then call `on_complete`
    /// with its final state.
    pub fn spawn<F>(&self, task: Arc<PipelineTask>, on_complete: F) -> Result<(), PipelineError>
    where
        F: FnOnce(TaskState) + Send + 'static,
    {
        let id = task.id().to_string();
        {
            let mut tasks = lock(&self.tasks);
            if tasks.contains_key(&id) {
                return Err(PipelineError::TaskAlreadyRunning(id));
            }
            task.start()?;
            tasks.insert(id.clone(), task.clone());
        }

        let tasks = self.tasks.clone();
        tokio::spawn(async move {
            let outcome = task.await_completion().await;
            lock(&tasks).remove(&id);
            info!(session_id = %id, state = %outcome, "Pipeline task released");
            on_complete(outcome);
        });
        Ok(())
    }

    pub fn get(&self, id: &str) -> Option<Arc<PipelineTask>> {
        lock(&self.tasks).get(id).cloned()
    }

    /// Number of tasks currently tracked.
    pub fn active(&self) -> usize {
        lock(&self.tasks).len()
    }

    /// Cancel every task and wait for them, aborting any still running after
    /// the grace period.
    pub async fn shutdown(&self) {
        let tasks: Vec<_> = lock(&self.tasks).values().cloned().collect();
        if tasks.is_empty() {
            return;
        }
        info!(count = tasks.len(), grace_ms = self.shutdown_grace.as_millis() as u64, "Shutting down pipeline tasks");
        for task in &tasks {
            task.cancel();
        }

        let all = futures::future::join_all(tasks.iter().map(|t| t.await_completion()));
        if tokio::time::timeout(self.shutdown_grace, all).await.is_err() {
            for task in tasks.iter().filter(|t| !t.state().is_terminal()) {
                warn!(session_id = %task.id(), "Task ignored cancellation, aborting");
                task.abort();
            }
        }
    }
}
