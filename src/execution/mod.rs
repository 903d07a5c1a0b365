//! Executions: request and record types, the status state machine, and the
//! orchestrator that owns the lifecycle.

pub mod events;
pub mod orchestrator;

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::catalog::secrets::secret_env_keys;
use crate::error::{Error, Result};
use crate::providers::LogEvent;

pub use events::{run_event_loop, spawn_event_loop, TaskEvent};
pub use orchestrator::ExecutionOrchestrator;

/// Maximum accepted command length in bytes.
pub const MAX_COMMAND_LEN: usize = 16 * 1024;

/// Lifecycle state of an execution.
///
/// ```text
/// PENDING -> STARTING -> RUNNING -> SUCCEEDED | FAILED
/// PENDING | STARTING | RUNNING -> TERMINATING -> TERMINATED
/// PENDING | STARTING -> FAILED            (provisioning failed)
/// ```
///
/// Terminal states accept no further transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutionStatus {
    /// Persisted, compute not yet requested.
    Pending,
    /// Compute requested from the task provider.
    Starting,
    /// The task is running.
    Running,
    /// The command exited with status 0.
    Succeeded,
    /// The command exited non-zero, timed out, or could not be started.
    Failed,
    /// A kill was requested and is in progress.
    Terminating,
    /// The task was killed.
    Terminated,
}

impl ExecutionStatus {
    /// Every status.
    pub const ALL: [ExecutionStatus; 7] = [
        ExecutionStatus::Pending,
        ExecutionStatus::Starting,
        ExecutionStatus::Running,
        ExecutionStatus::Succeeded,
        ExecutionStatus::Failed,
        ExecutionStatus::Terminating,
        ExecutionStatus::Terminated,
    ];

    /// Returns the string representation stored in repositories.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Starting => "STARTING",
            Self::Running => "RUNNING",
            Self::Succeeded => "SUCCEEDED",
            Self::Failed => "FAILED",
            Self::Terminating => "TERMINATING",
            Self::Terminated => "TERMINATED",
        }
    }

    /// Returns `true` for sink states.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Terminated)
    }

    /// Whether the state machine permits moving from `self` to `next`.
    pub fn can_transition_to(&self, next: ExecutionStatus) -> bool {
        use ExecutionStatus::*;
        matches!(
            (self, next),
            (Pending, Starting)
                | (Pending, Failed)
                | (Pending, Terminating)
                | (Starting, Running)
                | (Starting, Failed)
                | (Starting, Terminating)
                | (Running, Succeeded)
                | (Running, Failed)
                | (Running, Terminating)
                | (Terminating, Terminated)
        )
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExecutionStatus {
    type Err = Error;

    /// Exact, case-sensitive match against the canonical names.
    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| Error::InvalidRequest(format!("unknown execution status {s:?}")))
    }
}

/// A command submission.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionRequest {
    /// Shell command to run.
    pub command: String,
    /// Image reference; empty selects the default image.
    #[serde(default)]
    pub image: String,
    /// Extra environment variables.
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    /// Secret names to inject.
    #[serde(default)]
    pub secrets: Vec<String>,
    /// Timeout override in seconds.
    #[serde(default)]
    pub timeout_seconds: Option<u64>,
}

impl ExecutionRequest {
    /// Request running `command` on the default image.
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            ..Self::default()
        }
    }

    /// Structural validation, independent of authorization.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidRequest`] for an empty or oversized command, an
    /// empty or malformed environment key, or a zero timeout.
    pub fn validate(&self) -> Result<()> {
        if self.command.trim().is_empty() {
            return Err(Error::InvalidRequest("command is required".to_owned()));
        }
        if self.command.len() > MAX_COMMAND_LEN {
            return Err(Error::InvalidRequest(format!(
                "command exceeds {MAX_COMMAND_LEN} bytes"
            )));
        }
        for key in self.env.keys() {
            let valid = !key.is_empty()
                && !key.starts_with(|c: char| c.is_ascii_digit())
                && key.chars().all(|c| c.is_ascii_alphanumeric() || c == '_');
            if !valid {
                return Err(Error::InvalidRequest(format!(
                    "invalid environment variable name {key:?}"
                )));
            }
        }
        secret_env_keys(&self.secrets)?;
        if self.timeout_seconds == Some(0) {
            return Err(Error::InvalidRequest(
                "timeout_seconds must be positive".to_owned(),
            ));
        }
        Ok(())
    }
}

/// Persisted execution record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Execution {
    /// Unique identifier.
    pub execution_id: String,
    /// Shell command.
    pub command: String,
    /// Extra environment variables.
    pub env: BTreeMap<String, String>,
    /// Authorized secret names.
    pub secrets: Vec<String>,
    /// Resolved image id.
    pub image_id: String,
    /// Current status.
    pub status: ExecutionStatus,
    /// Email of the submitter.
    pub created_by: String,
    /// Submission time.
    pub created_at: DateTime<Utc>,
    /// When the task provider reported the task as started.
    pub started_at: Option<DateTime<Utc>>,
    /// When the execution reached a terminal status.
    pub completed_at: Option<DateTime<Utc>>,
    /// Effective timeout in seconds.
    pub timeout_seconds: Option<u64>,
    /// Provider-specific task reference (container id, task ARN, ...).
    pub task_ref: Option<String>,
    /// Exit code reported by the provider.
    pub exit_code: Option<i64>,
    /// Failure or termination reason.
    pub reason: Option<String>,
}

impl Execution {
    /// Move to `next`, stamping timestamps.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Conflict`] when the state machine forbids the transition.
    pub fn transition(&mut self, next: ExecutionStatus) -> Result<()> {
        if !self.status.can_transition_to(next) {
            return Err(Error::Conflict(format!(
                "execution {} cannot move from {} to {}",
                self.execution_id, self.status, next
            )));
        }
        self.status = next;
        if next.is_terminal() {
            self.completed_at = Some(Utc::now());
        }
        Ok(())
    }
}

/// Response to a successful submission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunResponse {
    /// New execution id.
    pub execution_id: String,
    /// Status after provisioning.
    pub status: ExecutionStatus,
    /// Image the command runs on.
    pub image_id: String,
    /// Scoped live-log streaming URL.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub websocket_url: Option<String>,
}

/// Status view of one execution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionStatusResponse {
    /// Execution id.
    pub execution_id: String,
    /// Current status.
    pub status: ExecutionStatus,
    /// Start time, once running.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    /// Completion time, once terminal.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    /// Exit code, once known.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i64>,
}

impl From<&Execution> for ExecutionStatusResponse {
    fn from(execution: &Execution) -> Self {
        Self {
            execution_id: execution.execution_id.clone(),
            status: execution.status,
            started_at: execution.started_at,
            completed_at: execution.completed_at,
            exit_code: execution.exit_code,
        }
    }
}

/// Body returned when a kill actually did something.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KillResponse {
    /// Execution that is being terminated.
    pub execution_id: String,
    /// Description of the action taken.
    pub message: String,
}

/// Logs plus an optional live-tail handle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogsResponse {
    /// Execution id.
    pub execution_id: String,
    /// Status at fetch time.
    pub status: ExecutionStatus,
    /// Log lines collected so far.
    pub events: Vec<LogEvent>,
    /// Live-tail URL, issued while the execution is not terminal.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub websocket_url: Option<String>,
}
