//! Wiring from [`Config`] to a ready [`Api`].

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::api::Api;
use crate::authorization::{Enforcer, PolicyEnforcer, PolicyTable};
use crate::catalog::{ImageCatalog, SecretCatalog};
use crate::config::{Config, StorageBackend};
use crate::execution::{spawn_event_loop, ExecutionOrchestrator, TaskEvent};
use crate::identity::UserService;
use crate::providers::docker::DockerTaskManager;
use crate::providers::websocket::SignedUrlIssuer;
use crate::providers::{LogManager, TaskManager, WebSocketManager};
use crate::store::memory::MemoryStore;
use crate::store::sqlite::SqliteStore;
use crate::store::{ExecutionRepository, ImageRepository, SecretRepository, UserRepository};

/// One handle per repository, all backed by the same store.
#[derive(Clone)]
pub struct Stores {
    /// Users and pending claims.
    pub users: Arc<dyn UserRepository>,
    /// Executions.
    pub executions: Arc<dyn ExecutionRepository>,
    /// Registered images.
    pub images: Arc<dyn ImageRepository>,
    /// Secrets.
    pub secrets: Arc<dyn SecretRepository>,
}

impl Stores {
    /// Share one in-memory store across every repository.
    pub fn memory(store: Arc<MemoryStore>) -> Self {
        Self {
            users: store.clone(),
            executions: store.clone(),
            images: store.clone(),
            secrets: store,
        }
    }

    /// Share one SQLite store across every repository.
    pub fn sqlite(store: Arc<SqliteStore>) -> Self {
        Self {
            users: store.clone(),
            executions: store.clone(),
            images: store.clone(),
            secrets: store,
        }
    }
}

/// External collaborators of the execution core.
#[derive(Clone)]
pub struct Collaborators {
    /// Provisions compute.
    pub tasks: Arc<dyn TaskManager>,
    /// Reads execution output.
    pub logs: Arc<dyn LogManager>,
    /// Issues live-tail URLs.
    pub websockets: Arc<dyn WebSocketManager>,
}

/// A fully wired runvoy instance.
pub struct App {
    /// Policy-checked entry points.
    pub api: Api,
    /// Role table and assignments.
    pub enforcer: Arc<PolicyEnforcer>,
    /// Identity service, also used for bootstrap.
    pub users: UserService,
    event_loop: JoinHandle<()>,
}

impl std::fmt::Debug for App {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("App").field("api", &self.api).finish_non_exhaustive()
    }
}

impl App {
    /// Build from configuration: open storage, connect to Docker, start the
    /// task event loop.
    ///
    /// # Errors
    ///
    /// Returns an error if the policy, storage or Docker cannot be set up.
    pub async fn build(config: &Config, base_dir: &Path) -> anyhow::Result<Self> {
        let stores = open_stores(config, base_dir).await?;
        let (events_tx, events_rx) = mpsc::channel(config.execution.event_buffer);

        let docker = Arc::new(
            DockerTaskManager::connect(config.docker.clone(), Arc::clone(&stores.secrets), events_tx)
                .await
                .context("failed to connect to docker")?,
        );
        let issuer = Arc::new(stream_url_issuer(config)?);

        let collaborators = Collaborators {
            tasks: docker.clone(),
            logs: docker,
            websockets: issuer,
        };
        Self::assemble(config, stores, collaborators, events_rx).await
    }

    /// Build from explicit stores and collaborators.
    ///
    /// `events` is drained by a background task that records task exits.
    ///
    /// # Errors
    ///
    /// Returns an error if the policy cannot be loaded or role assignments
    /// cannot be read.
    pub async fn assemble(
        config: &Config,
        stores: Stores,
        collaborators: Collaborators,
        events: mpsc::Receiver<TaskEvent>,
    ) -> anyhow::Result<Self> {
        let table = load_policy(config)?;
        let enforcer = Arc::new(PolicyEnforcer::new(&table));

        let users = UserService::new(
            Arc::clone(&stores.users),
            Arc::clone(&enforcer),
            claim_ttl(config),
        );
        users
            .load_role_assignments()
            .await
            .context("failed to load role assignments")?;

        let orchestrator = Arc::new(
            ExecutionOrchestrator::new(
                Arc::clone(&stores.executions),
                collaborators.tasks,
                collaborators.logs,
                collaborators.websockets,
            )
            .with_timeouts(
                Duration::from_secs(config.execution.default_timeout_secs),
                Duration::from_secs(config.execution.max_timeout_secs),
            ),
        );
        let event_loop = spawn_event_loop(Arc::clone(&orchestrator), events);

        let api = Api::new(
            Arc::clone(&enforcer) as Arc<dyn Enforcer>,
            users.clone(),
            ImageCatalog::new(Arc::clone(&stores.images)),
            SecretCatalog::new(Arc::clone(&stores.secrets)),
            orchestrator,
            Duration::from_secs(config.request.deadline_secs),
        );

        info!("runvoy assembled");
        Ok(Self {
            api,
            enforcer,
            users,
            event_loop,
        })
    }

    /// Stop the task event loop.
    pub fn shutdown(self) {
        self.event_loop.abort();
    }
}

/// Open the configured storage backend.
///
/// # Errors
///
/// Returns an error if the SQLite database cannot be opened.
pub async fn open_stores(config: &Config, base_dir: &Path) -> anyhow::Result<Stores> {
    match config.storage.backend {
        StorageBackend::Memory => {
            warn!("using in-memory storage; state is lost on exit");
            Ok(Stores::memory(Arc::new(MemoryStore::new())))
        }
        StorageBackend::Sqlite => {
            let path = config.database_path(base_dir);
            let store = SqliteStore::open(&path)
                .await
                .with_context(|| format!("failed to open database at {}", path.display()))?;
            Ok(Stores::sqlite(Arc::new(store)))
        }
    }
}

/// The configured policy table, or the built-in one.
///
/// # Errors
///
/// Returns an error if the policy file cannot be read or parsed.
pub fn load_policy(config: &Config) -> anyhow::Result<PolicyTable> {
    let table = match &config.policy.file {
        Some(path) => PolicyTable::load(path)
            .with_context(|| format!("failed to load policy from {}", path.display()))?,
        None => PolicyTable::builtin().context("built-in policy is invalid")?,
    };
    Ok(table)
}

/// Claim-token lifetime from configuration.
pub fn claim_ttl(config: &Config) -> chrono::Duration {
    let hours = i64::try_from(config.auth.claim_ttl_hours).unwrap_or(i64::MAX);
    chrono::Duration::try_hours(hours).unwrap_or(chrono::Duration::MAX)
}

fn stream_url_issuer(config: &Config) -> anyhow::Result<SignedUrlIssuer> {
    let key = match std::env::var(&config.websocket.signing_key_env) {
        Ok(value) if !value.is_empty() => value.into_bytes(),
        _ => {
            warn!(
                env = %config.websocket.signing_key_env,
                "no stream signing key set; using a per-process key"
            );
            rand::random::<[u8; 32]>().to_vec()
        }
    };
    let ttl_secs = i64::try_from(config.websocket.token_ttl_secs).unwrap_or(i64::MAX);
    let ttl = chrono::Duration::try_seconds(ttl_secs).unwrap_or(chrono::Duration::MAX);
    SignedUrlIssuer::new(&config.websocket.base_url, key, ttl)
        .context("invalid websocket configuration")
}
