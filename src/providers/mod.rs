//! Compute and log-streaming collaborators.
//!
//! The execution core talks to the outside world through three traits:
//!
//! - [`TaskManager`] provisions and kills the compute that runs a command
//! - [`LogManager`] returns the log lines an execution produced so far
//! - [`WebSocketManager`] mints scoped live-tail URLs
//!
//! Two implementations ship with the crate: [`docker::DockerTaskManager`]
//! (containers via the local Docker daemon) and [`websocket::SignedUrlIssuer`]
//! (HMAC-SHA256 signed, expiring stream URLs).

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub mod docker;
pub mod websocket;

/// Errors reported by provider implementations.
#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    /// The provider has no task for this execution.
    #[error("no task for execution {0}")]
    TaskNotFound(String),

    /// The Docker daemon rejected or failed a request.
    #[error("docker: {0}")]
    Docker(#[from] bollard::errors::Error),

    /// A secret referenced by the task could not be loaded.
    #[error("secret {name} unavailable: {reason}")]
    Secret {
        /// Secret name.
        name: String,
        /// What went wrong.
        reason: String,
    },

    /// The task description cannot be realised by this provider.
    #[error("invalid task: {0}")]
    InvalidTask(String),

    /// A stream URL could not be built or verified.
    #[error("stream url: {0}")]
    StreamUrl(String),
}

/// Everything a [`TaskManager`] needs to launch one execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskSpec {
    /// Execution the task belongs to.
    pub execution_id: String,
    /// Raw image reference to run.
    pub image: String,
    /// Stable image id.
    pub image_id: String,
    /// Shell command.
    pub command: String,
    /// Plain environment variables.
    pub env: BTreeMap<String, String>,
    /// Authorized secret names; the provider resolves values itself.
    pub secrets: Vec<String>,
    /// Hard wall-clock limit for the task.
    pub timeout: Duration,
}

/// Result of a successful [`TaskManager::start_task`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskHandle {
    /// Provider-specific task reference.
    pub task_ref: String,
    /// When the provider started the task.
    pub started_at: DateTime<Utc>,
}

/// One line of execution output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEvent {
    /// When the line was emitted.
    pub timestamp: DateTime<Utc>,
    /// The line, without trailing newline.
    pub message: String,
}

/// Launches and kills the compute that runs an execution.
#[async_trait]
pub trait TaskManager: Send + Sync {
    /// Provision compute for `spec` on behalf of `subject`.
    async fn start_task(&self, subject: &str, spec: &TaskSpec) -> Result<TaskHandle, ProviderError>;

    /// Stop the task of an execution.
    ///
    /// Returns [`ProviderError::TaskNotFound`] when nothing is running for it.
    async fn kill_task(&self, execution_id: &str) -> Result<(), ProviderError>;
}

/// Reads the output of an execution.
#[async_trait]
pub trait LogManager: Send + Sync {
    /// Log lines collected so far, oldest first.
    async fn fetch_logs(&self, execution_id: &str) -> Result<Vec<LogEvent>, ProviderError>;
}

/// Issues live-tail URLs scoped to one execution, subject and client.
#[async_trait]
pub trait WebSocketManager: Send + Sync {
    /// Mint a URL that streams the logs of `execution_id`.
    async fn generate_url(
        &self,
        execution_id: &str,
        subject: &str,
        client_addr: &str,
    ) -> Result<String, ProviderError>;
}
