//! Docker-backed task manager with hardening defaults.
//!
//! Every execution gets its own container named `<prefix>-<execution id>`. The
//! container runs the command through `/bin/sh -c`, with no capabilities, no
//! privilege escalation, a read-only root filesystem and the configured
//! memory, CPU, pid and network limits. Secret values are resolved here, at
//! launch, and injected as environment variables; they never pass through the
//! execution core.
//!
//! A waiter task per container enforces the timeout and reports the exit as a
//! [`TaskEvent`].
//!
//! Exited containers are kept: [`LogManager::fetch_logs`] reads output from
//! the container itself, so removing it would lose the logs. Only a container
//! that fails to start is removed here. Every container carries the
//! `io.runvoy.execution-id` label, so operators prune with
//! `docker container prune --filter label=io.runvoy.execution-id`.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bollard::container::{
    Config as ContainerConfig, CreateContainerOptions, KillContainerOptions, LogOutput,
    LogsOptions, RemoveContainerOptions, StartContainerOptions, WaitContainerOptions,
};
use bollard::errors::Error as BollardError;
use bollard::image::CreateImageOptions;
use bollard::models::HostConfig;
use bollard::Docker;
use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tokio_stream::StreamExt;
use tracing::{debug, info, warn};

use super::{LogEvent, LogManager, ProviderError, TaskHandle, TaskManager, TaskSpec};
use crate::catalog::secrets::secret_env_keys;
use crate::config::DockerConfig;
use crate::execution::TaskEvent;
use crate::store::SecretRepository;

const LABEL_EXECUTION: &str = "io.runvoy.execution-id";
const LABEL_SUBJECT: &str = "io.runvoy.subject";

/// Runs executions as local Docker containers.
#[derive(Clone)]
pub struct DockerTaskManager {
    docker: Docker,
    secrets: Arc<dyn SecretRepository>,
    config: DockerConfig,
    events: mpsc::Sender<TaskEvent>,
}

impl std::fmt::Debug for DockerTaskManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DockerTaskManager")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl DockerTaskManager {
    /// Connect to the local Docker daemon.
    ///
    /// Exit events are sent to `events`.
    ///
    /// # Errors
    ///
    /// Returns an error when the daemon cannot be reached or the resource
    /// limits are invalid.
    pub async fn connect(
        config: DockerConfig,
        secrets: Arc<dyn SecretRepository>,
        events: mpsc::Sender<TaskEvent>,
    ) -> Result<Self, ProviderError> {
        nano_cpus(config.cpu_cores)?;
        let docker = Docker::connect_with_local_defaults()?;
        docker.ping().await?;
        info!(network = %config.network_mode, "docker task manager connected");
        Ok(Self {
            docker,
            secrets,
            config,
            events,
        })
    }

    /// Returns true if the Docker daemon answers a ping.
    pub async fn docker_available() -> bool {
        match Docker::connect_with_local_defaults() {
            Ok(docker) => docker.ping().await.is_ok(),
            Err(_) => false,
        }
    }

    fn container_name(&self, execution_id: &str) -> String {
        format!("{}-{execution_id}", self.config.container_prefix)
    }

    async fn secret_env(&self, names: &[String]) -> Result<BTreeMap<String, String>, ProviderError> {
        let keys = secret_env_keys(names).map_err(|err| ProviderError::InvalidTask(err.to_string()))?;
        let mut env = BTreeMap::new();
        for (key, name) in keys {
            let secret = self
                .secrets
                .get_secret(&name)
                .await
                .map_err(|e| ProviderError::Secret {
                    name: name.clone(),
                    reason: e.to_string(),
                })?
                .ok_or_else(|| ProviderError::Secret {
                    name: name.clone(),
                    reason: "not found".to_owned(),
                })?;
            env.insert(key, secret.value);
        }
        Ok(env)
    }

    async fn ensure_image(&self, image: &str) -> Result<(), ProviderError> {
        match self.docker.inspect_image(image).await {
            Ok(_) => return Ok(()),
            Err(BollardError::DockerResponseServerError {
                status_code: 404, ..
            }) if self.config.pull_missing => {}
            Err(err) => return Err(err.into()),
        }

        info!(image, "pulling image");
        let options = CreateImageOptions {
            from_image: image,
            ..Default::default()
        };
        let mut progress = std::pin::pin!(self.docker.create_image(Some(options), None, None));
        while let Some(step) = progress.next().await {
            step?;
        }
        Ok(())
    }

    async fn remove_quietly(&self, name: &str) {
        let options = RemoveContainerOptions {
            force: true,
            ..Default::default()
        };
        if let Err(err) = self.docker.remove_container(name, Some(options)).await {
            debug!(container = name, error = %err, "container cleanup failed");
        }
    }
}

#[async_trait]
impl TaskManager for DockerTaskManager {
    async fn start_task(&self, subject: &str, spec: &TaskSpec) -> Result<TaskHandle, ProviderError> {
        let mut env = spec.env.clone();
        for (key, value) in self.secret_env(&spec.secrets).await? {
            if env.insert(key.clone(), value).is_some() {
                debug!(execution_id = %spec.execution_id, %key, "secret overrides plain env var");
            }
        }

        self.ensure_image(&spec.image).await?;

        let name = self.container_name(&spec.execution_id);
        let container = build_container_config(spec, subject, &env, &self.config)?;
        let options = CreateContainerOptions {
            name: name.clone(),
            platform: None,
        };
        self.docker.create_container(Some(options), container).await?;

        if let Err(err) = self
            .docker
            .start_container(&name, None::<StartContainerOptions<String>>)
            .await
        {
            self.remove_quietly(&name).await;
            return Err(err.into());
        }
        let started_at = Utc::now();

        info!(
            execution_id = %spec.execution_id,
            container = %name,
            image = %spec.image,
            timeout_secs = spec.timeout.as_secs(),
            "container started"
        );

        tokio::spawn(wait_for_exit(
            self.docker.clone(),
            name.clone(),
            spec.execution_id.clone(),
            spec.timeout,
            self.events.clone(),
        ));

        Ok(TaskHandle {
            task_ref: name,
            started_at,
        })
    }

    async fn kill_task(&self, execution_id: &str) -> Result<(), ProviderError> {
        let name = self.container_name(execution_id);
        let options = KillContainerOptions { signal: "SIGKILL" };
        match self.docker.kill_container(&name, Some(options)).await {
            Ok(()) => {
                info!(execution_id, container = %name, "container killed");
                Ok(())
            }
            // 404: no such container; 409: container is not running.
            Err(BollardError::DockerResponseServerError {
                status_code: 404 | 409,
                ..
            }) => Err(ProviderError::TaskNotFound(execution_id.to_owned())),
            Err(err) => Err(err.into()),
        }
    }
}

#[async_trait]
impl LogManager for DockerTaskManager {
    async fn fetch_logs(&self, execution_id: &str) -> Result<Vec<LogEvent>, ProviderError> {
        let name = self.container_name(execution_id);
        let options = LogsOptions::<String> {
            stdout: true,
            stderr: true,
            timestamps: true,
            ..Default::default()
        };

        let mut events = Vec::new();
        let mut stream = std::pin::pin!(self.docker.logs(&name, Some(options)));
        while let Some(chunk) = stream.next().await {
            let output = match chunk {
                Ok(output) => output,
                Err(BollardError::DockerResponseServerError {
                    status_code: 404, ..
                }) => return Err(ProviderError::TaskNotFound(execution_id.to_owned())),
                Err(err) => return Err(err.into()),
            };
            let message = match output {
                LogOutput::StdOut { message }
                | LogOutput::StdErr { message }
                | LogOutput::Console { message } => message,
                LogOutput::StdIn { .. } => continue,
            };
            let text = String::from_utf8_lossy(&message);
            events.extend(text.lines().map(parse_log_line));
        }
        Ok(events)
    }
}

async fn wait_for_exit(
    docker: Docker,
    container: String,
    execution_id: String,
    timeout: Duration,
    events: mpsc::Sender<TaskEvent>,
) {
    let mut waiter =
        std::pin::pin!(docker.wait_container(&container, None::<WaitContainerOptions<String>>));
    let event = match tokio::time::timeout(timeout, waiter.next()).await {
        Ok(Some(Ok(response))) => TaskEvent::exited(&execution_id, response.status_code),
        // bollard reports non-zero exits as a wait error carrying the code.
        Ok(Some(Err(BollardError::DockerContainerWaitError { code, .. }))) => {
            TaskEvent::exited(&execution_id, code)
        }
        Ok(Some(Err(err))) => TaskEvent::lost(&execution_id, format!("wait failed: {err}")),
        Ok(None) => TaskEvent::lost(&execution_id, "wait stream closed".to_owned()),
        Err(_) => {
            warn!(%execution_id, %container, "execution timed out, killing container");
            let kill = KillContainerOptions { signal: "SIGKILL" };
            if let Err(err) = docker.kill_container(&container, Some(kill)).await {
                warn!(%execution_id, error = %err, "failed to kill timed out container");
            }
            TaskEvent::lost(
                &execution_id,
                format!("timed out after {}s", timeout.as_secs()),
            )
        }
    };

    if events.send(event).await.is_err() {
        warn!(%execution_id, "task event receiver dropped");
    }
}

fn build_container_config(
    spec: &TaskSpec,
    subject: &str,
    env: &BTreeMap<String, String>,
    config: &DockerConfig,
) -> Result<ContainerConfig<String>, ProviderError> {
    let memory_limit = i64::from(config.memory_mb)
        .saturating_mul(1024)
        .saturating_mul(1024);

    let mut tmpfs = HashMap::new();
    tmpfs.insert("/tmp".to_owned(), "rw,size=256m".to_owned());

    let host_config = HostConfig {
        network_mode: Some(config.network_mode.clone()),
        readonly_rootfs: Some(true),
        cap_drop: Some(vec!["ALL".to_owned()]),
        security_opt: Some(vec!["no-new-privileges".to_owned()]),
        pids_limit: Some(config.pids_limit),
        memory: Some(memory_limit),
        nano_cpus: Some(nano_cpus(config.cpu_cores)?),
        tmpfs: Some(tmpfs),
        ..Default::default()
    };

    let mut labels = HashMap::new();
    labels.insert(LABEL_EXECUTION.to_owned(), spec.execution_id.clone());
    labels.insert(LABEL_SUBJECT.to_owned(), subject.to_owned());

    Ok(ContainerConfig {
        image: Some(spec.image.clone()),
        cmd: Some(vec![
            "/bin/sh".to_owned(),
            "-c".to_owned(),
            spec.command.clone(),
        ]),
        env: Some(env.iter().map(|(k, v)| format!("{k}={v}")).collect()),
        user: config.user.clone(),
        labels: Some(labels),
        host_config: Some(host_config),
        ..Default::default()
    })
}

fn parse_log_line(line: &str) -> LogEvent {
    if let Some((stamp, rest)) = line.split_once(' ') {
        if let Ok(timestamp) = DateTime::parse_from_rfc3339(stamp) {
            return LogEvent {
                timestamp: timestamp.with_timezone(&Utc),
                message: rest.to_owned(),
            };
        }
    }
    LogEvent {
        timestamp: Utc::now(),
        message: line.to_owned(),
    }
}

fn nano_cpus(cpu_cores: f64) -> Result<i64, ProviderError> {
    if !cpu_cores.is_finite() || cpu_cores <= 0.0 || cpu_cores > 1024.0 {
        return Err(ProviderError::InvalidTask(
            "cpu_cores must be a positive number no greater than 1024".to_owned(),
        ));
    }
    // Bounded above, so the cast cannot truncate.
    #[allow(clippy::cast_possible_truncation)]
    let millis = (cpu_cores * 1000.0).round() as i64;
    if millis == 0 {
        return Err(ProviderError::InvalidTask(
            "cpu_cores rounds to zero".to_owned(),
        ));
    }
    millis
        .checked_mul(1_000_000)
        .ok_or_else(|| ProviderError::InvalidTask("cpu_cores out of range".to_owned()))
}
