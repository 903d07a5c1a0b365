//! Execution lifecycle: submission, status, kill, listing and logs.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{
    Execution, ExecutionRequest, ExecutionStatus, ExecutionStatusResponse, KillResponse,
    LogsResponse, RunResponse,
};
use crate::authorization::AccessGrant;
use crate::error::{Error, Result};
use crate::providers::{LogManager, ProviderError, TaskManager, TaskSpec, WebSocketManager};
use crate::store::{ExecutionRepository, StoreError};

/// Timeout applied when a request does not set one.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(600);

/// Upper bound on any requested timeout.
pub const MAX_TIMEOUT: Duration = Duration::from_secs(4 * 60 * 60);

type LockMap = Mutex<HashMap<String, Arc<AsyncMutex<()>>>>;

/// Owns the execution lifecycle.
///
/// Operations on different executions run concurrently. Mutations of one
/// execution (provisioning, kill, exit recording) are serialised by a
/// per-execution async lock, so a duplicate kill observes the outcome of the
/// first one.
pub struct ExecutionOrchestrator {
    executions: Arc<dyn ExecutionRepository>,
    tasks: Arc<dyn TaskManager>,
    logs: Arc<dyn LogManager>,
    websockets: Arc<dyn WebSocketManager>,
    default_timeout: Duration,
    max_timeout: Duration,
    locks: LockMap,
}

impl std::fmt::Debug for ExecutionOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionOrchestrator")
            .field("default_timeout", &self.default_timeout)
            .field("max_timeout", &self.max_timeout)
            .finish_non_exhaustive()
    }
}

/// Held while one execution is being mutated. Dropping it releases the lock
/// and forgets the map entry when nobody else is waiting on it.
struct ExecutionLock<'a> {
    locks: &'a LockMap,
    id: String,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for ExecutionLock<'_> {
    fn drop(&mut self) {
        drop(self.guard.take());
        if let Ok(mut locks) = self.locks.lock() {
            if locks
                .get(&self.id)
                .is_some_and(|entry| Arc::strong_count(entry) == 1)
            {
                locks.remove(&self.id);
            }
        }
    }
}

fn store_error(context: &'static str) -> impl FnOnce(StoreError) -> Error {
    move |err| match err {
        StoreError::Duplicate(key) => Error::Conflict(format!("{context}: {key} already exists")),
        other => Error::unavailable(context, other),
    }
}

impl ExecutionOrchestrator {
    /// Build an orchestrator with the default timeouts.
    pub fn new(
        executions: Arc<dyn ExecutionRepository>,
        tasks: Arc<dyn TaskManager>,
        logs: Arc<dyn LogManager>,
        websockets: Arc<dyn WebSocketManager>,
    ) -> Self {
        Self {
            executions,
            tasks,
            logs,
            websockets,
            default_timeout: DEFAULT_TIMEOUT,
            max_timeout: MAX_TIMEOUT,
            locks: Mutex::new(HashMap::new()),
        }
    }

    /// Override the default and maximum execution timeouts.
    pub fn with_timeouts(mut self, default_timeout: Duration, max_timeout: Duration) -> Self {
        self.default_timeout = default_timeout;
        self.max_timeout = max_timeout.max(default_timeout);
        self
    }

    async fn lock(&self, id: &str) -> Result<ExecutionLock<'_>> {
        let entry = {
            let mut locks = self
                .locks
                .lock()
                .map_err(|_| Error::Internal("execution lock table poisoned".to_owned()))?;
            Arc::clone(locks.entry(id.to_owned()).or_default())
        };
        let guard = entry.lock_owned().await;
        Ok(ExecutionLock {
            locks: &self.locks,
            id: id.to_owned(),
            guard: Some(guard),
        })
    }

    async fn load(&self, id: &str) -> Result<Execution> {
        self.executions
            .get_execution(id)
            .await
            .map_err(store_error("loading execution"))?
            .ok_or_else(|| Error::not_found("execution", id))
    }

    async fn save(&self, execution: &Execution) -> Result<()> {
        let updated = self
            .executions
            .update_execution(execution)
            .await
            .map_err(store_error("updating execution"))?;
        if !updated {
            return Err(Error::not_found("execution", &execution.execution_id));
        }
        Ok(())
    }

    fn effective_timeout(&self, request: &ExecutionRequest) -> Result<Duration> {
        let timeout = request
            .timeout_seconds
            .map_or(self.default_timeout, Duration::from_secs);
        if timeout > self.max_timeout {
            return Err(Error::InvalidRequest(format!(
                "timeout_seconds exceeds the maximum of {}",
                self.max_timeout.as_secs()
            )));
        }
        Ok(timeout)
    }

    /// Persist and provision a new execution.
    ///
    /// The execution moves `PENDING -> STARTING -> RUNNING`. If the task
    /// provider fails, the execution is marked `FAILED` with the provider's
    /// message and the failure is returned; the start is never retried.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidRequest`] for malformed requests or a grant
    /// without an image, and [`Error::Unavailable`] when the repository or the
    /// task provider fails.
    pub async fn run_command(
        &self,
        grant: &AccessGrant,
        request: &ExecutionRequest,
        client_addr: &str,
    ) -> Result<RunResponse> {
        request.validate()?;
        let image = grant
            .image()
            .ok_or_else(|| Error::InvalidRequest("no image resolved for execution".to_owned()))?;
        let timeout = self.effective_timeout(request)?;
        let subject = grant.subject();

        let mut execution = Execution {
            execution_id: Uuid::new_v4().simple().to_string(),
            command: request.command.clone(),
            env: request.env.clone(),
            secrets: grant.secrets().to_vec(),
            image_id: image.image_id.clone(),
            status: ExecutionStatus::Pending,
            created_by: subject.to_owned(),
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            timeout_seconds: Some(timeout.as_secs()),
            task_ref: None,
            exit_code: None,
            reason: None,
        };
        let id = execution.execution_id.clone();

        let _lock = self.lock(&id).await?;
        self.executions
            .create_execution(&execution)
            .await
            .map_err(store_error("creating execution"))?;
        info!(execution_id = %id, subject, image_id = %image.image_id, "execution created");

        execution.transition(ExecutionStatus::Starting)?;
        self.save(&execution).await?;

        let spec = TaskSpec {
            execution_id: id.clone(),
            image: image.image.clone(),
            image_id: image.image_id.clone(),
            command: execution.command.clone(),
            env: execution.env.clone(),
            secrets: execution.secrets.clone(),
            timeout,
        };

        let handle = match self.tasks.start_task(subject, &spec).await {
            Ok(handle) => handle,
            Err(err) => {
                warn!(execution_id = %id, error = %err, "task failed to start");
                execution.transition(ExecutionStatus::Failed)?;
                execution.reason = Some(err.to_string());
                if let Err(save_err) = self.save(&execution).await {
                    warn!(execution_id = %id, error = %save_err, "failed to record start failure");
                }
                return Err(Error::unavailable("starting task", err));
            }
        };

        execution.transition(ExecutionStatus::Running)?;
        execution.started_at = Some(handle.started_at);
        execution.task_ref = Some(handle.task_ref);
        self.save(&execution).await?;
        info!(execution_id = %id, "execution running");

        let websocket_url = match self.websockets.generate_url(&id, subject, client_addr).await {
            Ok(url) => Some(url),
            Err(err) => {
                warn!(execution_id = %id, error = %err, "could not issue stream url");
                None
            }
        };

        Ok(RunResponse {
            execution_id: id,
            status: execution.status,
            image_id: execution.image_id,
            websocket_url,
        })
    }

    /// Full record of one execution.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] for unknown ids.
    pub async fn get_execution(&self, id: &str) -> Result<Execution> {
        self.load(id).await
    }

    /// Current status of one execution.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] for unknown ids.
    pub async fn get_execution_status(&self, id: &str) -> Result<ExecutionStatusResponse> {
        let execution = self.load(id).await?;
        Ok(ExecutionStatusResponse::from(&execution))
    }

    /// Request termination of an execution.
    ///
    /// Returns `Ok(None)` when the execution is already terminal; nothing was
    /// done. Otherwise the execution moves to `TERMINATING`, the task provider
    /// is asked to kill the task, and a body describing the action is returned.
    /// When the provider has no task (it never started or already exited), the
    /// execution goes straight to `TERMINATED`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] for unknown ids and [`Error::Unavailable`]
    /// when the provider fails; the execution then stays `TERMINATING` and the
    /// kill may be retried.
    pub async fn kill_execution(&self, id: &str) -> Result<Option<KillResponse>> {
        let _lock = self.lock(id).await?;
        let mut execution = self.load(id).await?;

        if execution.status.is_terminal() {
            debug!(execution_id = id, status = %execution.status, "kill on terminal execution");
            return Ok(None);
        }
        if execution.status != ExecutionStatus::Terminating {
            execution.transition(ExecutionStatus::Terminating)?;
            self.save(&execution).await?;
        }

        let message = match self.tasks.kill_task(id).await {
            Ok(()) => "termination requested".to_owned(),
            Err(ProviderError::TaskNotFound(_)) => {
                execution.transition(ExecutionStatus::Terminated)?;
                execution.reason = Some("killed before the task was running".to_owned());
                self.save(&execution).await?;
                "execution terminated".to_owned()
            }
            Err(err) => return Err(Error::unavailable("killing task", err)),
        };

        info!(execution_id = id, status = %execution.status, "kill processed");
        Ok(Some(KillResponse {
            execution_id: id.to_owned(),
            message,
        }))
    }

    /// Executions newest first.
    ///
    /// `limit == 0` means no limit. A non-empty `statuses` list is an OR filter
    /// of exact equality against trimmed, case-sensitive status names; `None`
    /// or an empty list means no filter. Blank and unknown entries never match,
    /// so a list made only of them yields an empty result.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Unavailable`] on repository failure.
    pub async fn list_executions(
        &self,
        limit: usize,
        statuses: Option<&[String]>,
    ) -> Result<Vec<Execution>> {
        let requested = statuses.unwrap_or_default();
        let mut filter = Vec::new();
        for raw in requested {
            let name = raw.trim();
            match name.parse::<ExecutionStatus>() {
                Ok(status) if !filter.contains(&status) => filter.push(status),
                Ok(_) => {}
                Err(_) => debug!(status = name, "status filter entry matches nothing"),
            }
        }
        if !requested.is_empty() && filter.is_empty() {
            return Ok(Vec::new());
        }

        let limit = (limit > 0).then_some(limit);
        self.executions
            .list_executions(limit, &filter)
            .await
            .map_err(store_error("listing executions"))
    }

    /// Logs collected so far, plus a live-tail URL while the execution runs.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] for unknown ids and [`Error::Unavailable`]
    /// when the log provider or the URL issuer fails.
    pub async fn get_logs_by_execution_id(
        &self,
        id: &str,
        subject: &str,
        client_addr: &str,
    ) -> Result<LogsResponse> {
        let execution = self.load(id).await?;

        let events = match self.logs.fetch_logs(id).await {
            Ok(events) => events,
            Err(ProviderError::TaskNotFound(_)) => Vec::new(),
            Err(err) => return Err(Error::unavailable("fetching logs", err)),
        };

        let websocket_url = if execution.status.is_terminal() {
            None
        } else {
            let url = self
                .websockets
                .generate_url(id, subject, client_addr)
                .await
                .map_err(|err| Error::unavailable("issuing stream url", err))?;
            Some(url)
        };

        Ok(LogsResponse {
            execution_id: execution.execution_id,
            status: execution.status,
            events,
            websocket_url,
        })
    }

    /// Apply a provider exit report.
    ///
    /// `RUNNING` becomes `SUCCEEDED` on exit code 0 and `FAILED` otherwise;
    /// `TERMINATING` becomes `TERMINATED`. Reports for terminal executions are
    /// ignored. A `STARTING` execution whose submission was abandoned after
    /// the task launched is treated as `RUNNING`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] for unknown ids and [`Error::Unavailable`]
    /// on repository failure.
    pub async fn record_task_exit(
        &self,
        id: &str,
        exit_code: Option<i64>,
        reason: Option<String>,
    ) -> Result<()> {
        let _lock = self.lock(id).await?;
        let mut execution = self.load(id).await?;

        if execution.status == ExecutionStatus::Starting {
            debug!(execution_id = id, "exit report before the start was recorded");
            execution.transition(ExecutionStatus::Running)?;
        }

        let next = match execution.status {
            status if status.is_terminal() => {
                debug!(execution_id = id, %status, "exit report for terminal execution");
                return Ok(());
            }
            ExecutionStatus::Terminating => ExecutionStatus::Terminated,
            ExecutionStatus::Running if exit_code == Some(0) => ExecutionStatus::Succeeded,
            _ => ExecutionStatus::Failed,
        };

        execution.transition(next)?;
        execution.exit_code = exit_code;
        execution.reason = match (next, reason, exit_code) {
            (_, Some(reason), _) => Some(reason),
            (ExecutionStatus::Terminated, None, _) => Some("killed".to_owned()),
            (ExecutionStatus::Failed, None, Some(code)) => Some(format!("exited with code {code}")),
            _ => None,
        };
        self.save(&execution).await?;

        info!(execution_id = id, status = %next, exit_code = ?exit_code, "execution finished");
        Ok(())
    }
}
