//! Task completion events from providers.
//!
//! Providers send a [`TaskEvent`] when a task exits, is killed or is lost.
//! [`spawn_event_loop`] drains the channel into
//! [`ExecutionOrchestrator::record_task_exit`].

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::orchestrator::ExecutionOrchestrator;

/// A task left the running state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskEvent {
    /// Execution the task belonged to.
    pub execution_id: String,
    /// Process exit code, when the task exited on its own or was killed.
    pub exit_code: Option<i64>,
    /// Why the task ended without a usable exit code.
    pub reason: Option<String>,
}

impl TaskEvent {
    /// The task exited with `code`.
    pub fn exited(execution_id: &str, code: i64) -> Self {
        Self {
            execution_id: execution_id.to_owned(),
            exit_code: Some(code),
            reason: None,
        }
    }

    /// The task ended without an exit code (timeout, lost container, ...).
    pub fn lost(execution_id: &str, reason: String) -> Self {
        Self {
            execution_id: execution_id.to_owned(),
            exit_code: None,
            reason: Some(reason),
        }
    }
}

/// Drain `events` until every sender is dropped.
pub async fn run_event_loop(
    orchestrator: Arc<ExecutionOrchestrator>,
    mut events: mpsc::Receiver<TaskEvent>,
) {
    info!("task event loop started");
    while let Some(event) = events.recv().await {
        debug!(execution_id = %event.execution_id, exit_code = ?event.exit_code, "task event");
        if let Err(err) = orchestrator
            .record_task_exit(&event.execution_id, event.exit_code, event.reason)
            .await
        {
            warn!(execution_id = %event.execution_id, error = %err, "failed to record task exit");
        }
    }
    info!("task event loop stopped");
}

/// Spawn [`run_event_loop`] as a background task.
pub fn spawn_event_loop(
    orchestrator: Arc<ExecutionOrchestrator>,
    events: mpsc::Receiver<TaskEvent>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(run_event_loop(orchestrator, events))
}
