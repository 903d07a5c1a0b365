//! Boundary facade for a transport layer.
//!
//! [`Api`] composes the enforcer, catalogs, identity service and orchestrator.
//! Every operation:
//!
//! 1. checks the caller's role against the collection path
//!    (`/api/v1/<resource>`) or instance path (`/api/v1/<resource>/<id>`),
//! 2. runs under the configured request deadline.
//!
//! On deadline expiry the in-flight future is dropped and the caller gets
//! [`Error::Unavailable`]; nothing is rolled back, so the outcome is unknown
//! and the caller should re-query status.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, instrument};

use crate::authorization::{Action, Enforcer, ResourceAccessValidator, ResourceKind, Role};
use crate::catalog::{ImageCatalog, ImageInfo, Secret, SecretCatalog, SecretMetadata};
use crate::error::{Error, Result};
use crate::execution::{
    Execution, ExecutionOrchestrator, ExecutionRequest, ExecutionStatusResponse, KillResponse,
    LogsResponse, RunResponse,
};
use crate::identity::{ClaimResponse, CreateUserResponse, LastUsedUpdate, User, UserService};

/// The request took longer than the configured deadline.
#[derive(Debug, thiserror::Error)]
#[error("deadline of {0:?} exceeded; outcome unknown, re-query status")]
pub struct DeadlineExceeded(pub Duration);

/// An authenticated caller for the duration of one request.
#[derive(Debug)]
pub struct Session {
    user: User,
    client_addr: String,
    last_used: LastUsedUpdate,
}

impl Session {
    /// Authenticated user.
    pub fn user(&self) -> &User {
        &self.user
    }

    /// Subject used for policy checks.
    pub fn subject(&self) -> &str {
        &self.user.email
    }

    /// Role of the caller.
    pub fn role(&self) -> Role {
        self.user.role
    }

    /// Address the request came from.
    pub fn client_addr(&self) -> &str {
        &self.client_addr
    }

    /// Complete the request. Waits for the last-used timestamp write.
    pub async fn finish(self) {
        self.last_used.wait().await;
    }
}

/// Parsed `ListExecutions` query parameters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListQuery {
    /// Maximum number of results; 0 means no limit.
    pub limit: usize,
    /// Raw status names, untrimmed; `None` when the parameter was absent.
    pub statuses: Option<Vec<String>>,
}

/// Parse the `limit` and comma-separated `status` query parameters.
///
/// An empty `status` parameter counts as absent.
///
/// # Errors
///
/// Returns [`Error::InvalidRequest`] when `limit` is not a non-negative integer.
pub fn parse_list_query(limit: Option<&str>, status: Option<&str>) -> Result<ListQuery> {
    let limit = match limit.map(str::trim).filter(|raw| !raw.is_empty()) {
        None => 0,
        Some(raw) => {
            let value: i64 = raw
                .parse()
                .map_err(|_| Error::InvalidRequest(format!("limit must be a number, got {raw:?}")))?;
            usize::try_from(value)
                .map_err(|_| Error::InvalidRequest(format!("limit must not be negative, got {value}")))?
        }
    };
    let statuses = status
        .filter(|raw| !raw.trim().is_empty())
        .map(|raw| raw.split(',').map(str::to_owned).collect());
    Ok(ListQuery { limit, statuses })
}

/// Policy-checked, deadline-bounded entry points for every operation.
pub struct Api {
    enforcer: Arc<dyn Enforcer>,
    validator: ResourceAccessValidator,
    users: UserService,
    images: ImageCatalog,
    secrets: SecretCatalog,
    orchestrator: Arc<ExecutionOrchestrator>,
    deadline: Duration,
}

impl std::fmt::Debug for Api {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Api")
            .field("deadline", &self.deadline)
            .finish_non_exhaustive()
    }
}

impl Api {
    /// Compose the facade.
    pub fn new(
        enforcer: Arc<dyn Enforcer>,
        users: UserService,
        images: ImageCatalog,
        secrets: SecretCatalog,
        orchestrator: Arc<ExecutionOrchestrator>,
        deadline: Duration,
    ) -> Self {
        Self {
            validator: ResourceAccessValidator::new(Arc::clone(&enforcer)),
            enforcer,
            users,
            images,
            secrets,
            orchestrator,
            deadline,
        }
    }

    /// The orchestrator behind this facade.
    pub fn orchestrator(&self) -> &Arc<ExecutionOrchestrator> {
        &self.orchestrator
    }

    async fn bounded<T, F>(&self, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        match tokio::time::timeout(self.deadline, fut).await {
            Ok(result) => result,
            Err(_) => Err(Error::unavailable(
                "request deadline",
                DeadlineExceeded(self.deadline),
            )),
        }
    }

    fn authorize(&self, session: &Session, object: &str, action: Action) -> Result<()> {
        let subject = session.subject();
        if self.enforcer.enforce(subject, object, action)? {
            return Ok(());
        }
        debug!(subject, object, action = %action, "request denied");
        Err(Error::forbidden_resource(
            format!("{subject} may not {action} {object}"),
            object,
        ))
    }

    fn authorize_collection(&self, session: &Session, kind: ResourceKind, action: Action) -> Result<()> {
        self.authorize(session, &kind.collection_path(), action)
    }

    fn authorize_instance(
        &self,
        session: &Session,
        kind: ResourceKind,
        id: &str,
        action: Action,
    ) -> Result<()> {
        self.authorize(session, &kind.instance_path(id), action)
    }

    // -- identity ------------------------------------------------------------

    /// Authenticate an API key and open a session.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Unauthorized`] for unknown, revoked or expired keys.
    pub async fn authenticate(&self, api_key: &str, client_addr: &str) -> Result<Session> {
        let (user, last_used) = self.bounded(self.users.authenticate_user(api_key)).await?;
        Ok(Session {
            user,
            client_addr: client_addr.to_owned(),
            last_used,
        })
    }

    /// Reveal a new user's API key once. Needs no session.
    ///
    /// # Errors
    ///
    /// See [`UserService::claim_api_key`].
    pub async fn claim_api_key(&self, token: &str, client_addr: &str) -> Result<ClaimResponse> {
        self.bounded(self.users.claim_api_key(token, client_addr)).await
    }

    /// Create a user.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Forbidden`] without `create` on users, or any error of
    /// [`UserService::create_user`].
    #[instrument(skip_all, fields(subject = %session.subject()))]
    pub async fn create_user(
        &self,
        session: &Session,
        email: &str,
        role: Role,
        expires_at: Option<chrono::DateTime<chrono::Utc>>,
    ) -> Result<CreateUserResponse> {
        self.authorize_collection(session, ResourceKind::Users, Action::Create)?;
        self.bounded(self.users.create_user(session.subject(), email, role, expires_at))
            .await
    }

    /// Revoke a user.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Forbidden`] without `delete` on the user, or
    /// [`Error::NotFound`].
    #[instrument(skip_all, fields(subject = %session.subject()))]
    pub async fn revoke_user(&self, session: &Session, email: &str) -> Result<User> {
        self.authorize_instance(session, ResourceKind::Users, email, Action::Delete)?;
        self.bounded(self.users.revoke_user(email)).await
    }

    /// List users.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Forbidden`] without `read` on users.
    #[instrument(skip_all, fields(subject = %session.subject()))]
    pub async fn list_users(&self, session: &Session) -> Result<Vec<User>> {
        self.authorize_collection(session, ResourceKind::Users, Action::Read)?;
        self.bounded(self.users.list_users()).await
    }

    // -- images --------------------------------------------------------------

    /// Register an image.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Forbidden`] without `create` on images, or any error of
    /// [`ImageCatalog::register_image`].
    #[instrument(skip_all, fields(subject = %session.subject()))]
    pub async fn register_image(
        &self,
        session: &Session,
        reference: &str,
        set_default: bool,
    ) -> Result<ImageInfo> {
        self.authorize_collection(session, ResourceKind::Images, Action::Create)?;
        self.bounded(self.images.register_image(session.subject(), reference, set_default))
            .await
    }

    /// List registered images.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Forbidden`] without `read` on images.
    #[instrument(skip_all, fields(subject = %session.subject()))]
    pub async fn list_images(&self, session: &Session) -> Result<Vec<ImageInfo>> {
        self.authorize_collection(session, ResourceKind::Images, Action::Read)?;
        self.bounded(self.images.list_images()).await
    }

    /// One registered image, by id or reference.
    ///
    /// References and ids name the same image; the policy check always uses
    /// `/api/v1/images/<image_id>`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Forbidden`] without `read` on the image, or [`Error::NotFound`].
    #[instrument(skip_all, fields(subject = %session.subject()))]
    pub async fn get_image(&self, session: &Session, id_or_reference: &str) -> Result<ImageInfo> {
        self.bounded(async {
            let image = self.images.get_image(id_or_reference).await?;
            self.authorize_instance(session, ResourceKind::Images, &image.image_id, Action::Read)?;
            Ok(image)
        })
        .await
    }

    /// Make an image the default.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Forbidden`] without `update` on the image, or [`Error::NotFound`].
    #[instrument(skip_all, fields(subject = %session.subject()))]
    pub async fn set_default_image(&self, session: &Session, id_or_reference: &str) -> Result<ImageInfo> {
        self.bounded(async {
            let image = self.images.get_image(id_or_reference).await?;
            self.authorize_instance(session, ResourceKind::Images, &image.image_id, Action::Update)?;
            self.images.set_default_image(&image.image_id).await
        })
        .await
    }

    /// Remove an image.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Forbidden`] without `delete` on the image, or [`Error::NotFound`].
    #[instrument(skip_all, fields(subject = %session.subject()))]
    pub async fn remove_image(&self, session: &Session, id_or_reference: &str) -> Result<ImageInfo> {
        self.bounded(async {
            let image = self.images.get_image(id_or_reference).await?;
            self.authorize_instance(session, ResourceKind::Images, &image.image_id, Action::Delete)?;
            self.images.remove_image(&image.image_id).await
        })
        .await
    }

    // -- secrets -------------------------------------------------------------

    /// Create a secret.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Forbidden`] without `create` on secrets, or any error of
    /// [`SecretCatalog::create_secret`].
    #[instrument(skip_all, fields(subject = %session.subject()))]
    pub async fn create_secret(
        &self,
        session: &Session,
        name: &str,
        value: &str,
        description: &str,
    ) -> Result<SecretMetadata> {
        self.authorize_collection(session, ResourceKind::Secrets, Action::Create)?;
        self.bounded(self.secrets.create_secret(session.subject(), name, value, description))
            .await
    }

    /// One secret, including its value.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Forbidden`] without `read` on the secret, or [`Error::NotFound`].
    #[instrument(skip_all, fields(subject = %session.subject()))]
    pub async fn get_secret(&self, session: &Session, name: &str) -> Result<Secret> {
        self.authorize_instance(session, ResourceKind::Secrets, name.trim(), Action::Read)?;
        self.bounded(self.secrets.get_secret(name)).await
    }

    /// Secret metadata, without values.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Forbidden`] without `read` on secrets.
    #[instrument(skip_all, fields(subject = %session.subject()))]
    pub async fn list_secrets(&self, session: &Session) -> Result<Vec<SecretMetadata>> {
        self.authorize_collection(session, ResourceKind::Secrets, Action::Read)?;
        self.bounded(self.secrets.list_secrets()).await
    }

    /// Change a secret's value and/or description.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Forbidden`] without `update` on the secret, or [`Error::NotFound`].
    #[instrument(skip_all, fields(subject = %session.subject()))]
    pub async fn update_secret(
        &self,
        session: &Session,
        name: &str,
        value: Option<&str>,
        description: Option<&str>,
    ) -> Result<SecretMetadata> {
        self.authorize_instance(session, ResourceKind::Secrets, name.trim(), Action::Update)?;
        self.bounded(self.secrets.update_secret(session.subject(), name, value, description))
            .await
    }

    /// Delete a secret.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Forbidden`] without `delete` on the secret, or [`Error::NotFound`].
    #[instrument(skip_all, fields(subject = %session.subject()))]
    pub async fn delete_secret(&self, session: &Session, name: &str) -> Result<()> {
        self.authorize_instance(session, ResourceKind::Secrets, name.trim(), Action::Delete)?;
        self.bounded(self.secrets.delete_secret(name)).await
    }

    // -- executions ----------------------------------------------------------

    /// Resolve the image, check `use` on it and every secret, then run.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Forbidden`] without `create` on executions or `use` on a
    /// referenced resource, [`Error::NotFound`] for unknown images or secrets
    /// (no execution is recorded), and any
    /// error of [`ExecutionOrchestrator::run_command`].
    #[instrument(skip_all, fields(subject = %session.subject()))]
    pub async fn run_command(&self, session: &Session, request: &ExecutionRequest) -> Result<RunResponse> {
        self.authorize_collection(session, ResourceKind::Executions, Action::Create)?;
        request.validate()?;
        self.bounded(async {
            let image = self.images.resolve_image(&request.image).await?;
            let grant = self.validator.validate_execution_resource_access(
                session.subject(),
                request,
                Some(&image),
            )?;
            self.secrets.require_secrets(grant.secrets()).await?;
            self.orchestrator
                .run_command(&grant, request, session.client_addr())
                .await
        })
        .await
    }

    /// Status of one execution.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Forbidden`] without `read` on the execution, or [`Error::NotFound`].
    #[instrument(skip_all, fields(subject = %session.subject()))]
    pub async fn get_execution_status(&self, session: &Session, id: &str) -> Result<ExecutionStatusResponse> {
        self.authorize_instance(session, ResourceKind::Executions, id, Action::Read)?;
        self.bounded(self.orchestrator.get_execution_status(id)).await
    }

    /// Kill an execution; `Ok(None)` when it had already finished.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Forbidden`] without `delete` on the execution, or [`Error::NotFound`].
    #[instrument(skip_all, fields(subject = %session.subject()))]
    pub async fn kill_execution(&self, session: &Session, id: &str) -> Result<Option<KillResponse>> {
        self.authorize_instance(session, ResourceKind::Executions, id, Action::Delete)?;
        self.bounded(self.orchestrator.kill_execution(id)).await
    }

    /// List executions from raw `limit` and `status` query parameters.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Forbidden`] without `read` on executions and
    /// [`Error::InvalidRequest`] for a malformed `limit`.
    #[instrument(skip_all, fields(subject = %session.subject()))]
    pub async fn list_executions(
        &self,
        session: &Session,
        limit: Option<&str>,
        status: Option<&str>,
    ) -> Result<Vec<Execution>> {
        self.authorize_collection(session, ResourceKind::Executions, Action::Read)?;
        let query = parse_list_query(limit, status)?;
        self.bounded(
            self.orchestrator
                .list_executions(query.limit, query.statuses.as_deref()),
        )
        .await
    }

    /// Logs of one execution plus a live-tail URL for this caller.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Forbidden`] without `read` on the execution, or [`Error::NotFound`].
    #[instrument(skip_all, fields(subject = %session.subject()))]
    pub async fn get_logs(&self, session: &Session, id: &str) -> Result<LogsResponse> {
        self.authorize_instance(session, ResourceKind::Executions, id, Action::Read)?;
        self.bounded(self.orchestrator.get_logs_by_execution_id(
            id,
            session.subject(),
            session.client_addr(),
        ))
        .await
    }
}
