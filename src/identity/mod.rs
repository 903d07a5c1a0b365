//! Users, API keys and authentication.
//!
//! API keys are never stored in clear once claimed: the user record keeps only
//! the SHA-256 hash. A freshly created user receives a one-time claim token;
//! exchanging it via [`UserService::claim_api_key`] reveals the key exactly once.

use std::sync::{Arc, LazyLock};

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use chrono::{DateTime, Duration, Utc};
use rand::RngCore;
use regex::Regex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::authorization::{PolicyEnforcer, Role};
use crate::error::{Error, Result};
use crate::store::{StoreError, UserRepository};

/// Random bytes in a generated API key.
const API_KEY_BYTES: usize = 32;

/// Random bytes in a claim token.
const CLAIM_TOKEN_BYTES: usize = 16;

static EMAIL: LazyLock<Result<Regex, regex::Error>> =
    LazyLock::new(|| Regex::new(r"^[^@\s]+@[^@\s]+\.[^@\s]+$"));

/// A user account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    /// Email address, the identity key.
    pub email: String,
    /// Assigned role.
    pub role: Role,
    /// SHA-256 hex digest of the API key.
    #[serde(skip_serializing, default)]
    pub api_key_hash: String,
    /// Revoked users can no longer authenticate.
    pub revoked: bool,
    /// Email of the creating admin, if any.
    pub created_by: Option<String>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Last successful authentication.
    pub last_used: Option<DateTime<Utc>>,
    /// Optional account expiry.
    pub expires_at: Option<DateTime<Utc>>,
}

impl User {
    /// Returns `true` if the account has an expiry in the past.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|expires| expires <= now)
    }
}

/// One-time claim record for a newly issued API key.
#[derive(Clone, PartialEq, Eq)]
pub struct PendingApiKey {
    /// Opaque claim token handed to the admin.
    pub token: String,
    /// User the key belongs to.
    pub email: String,
    /// Plaintext key, cleared once claimed.
    pub api_key: String,
    /// Admin that created the user.
    pub created_by: String,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// The token cannot be claimed after this instant.
    pub expires_at: DateTime<Utc>,
    /// Whether the key was already revealed.
    pub claimed: bool,
    /// When the key was revealed.
    pub claimed_at: Option<DateTime<Utc>>,
    /// Client address that revealed the key.
    pub claimed_from: Option<String>,
}

impl std::fmt::Debug for PendingApiKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingApiKey")
            .field("email", &self.email)
            .field("api_key", &"[REDACTED]")
            .field("expires_at", &self.expires_at)
            .field("claimed", &self.claimed)
            .finish_non_exhaustive()
    }
}

/// Result of creating a user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CreateUserResponse {
    /// The stored user.
    pub user: User,
    /// Token that reveals the API key once.
    pub claim_token: String,
    /// Claim deadline.
    pub claim_expires_at: DateTime<Utc>,
}

/// Result of claiming an API key.
#[derive(Clone, PartialEq, Eq, Serialize)]
pub struct ClaimResponse {
    /// Owner of the key.
    pub email: String,
    /// The plaintext API key.
    pub api_key: String,
}

impl std::fmt::Debug for ClaimResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClaimResponse")
            .field("email", &self.email)
            .field("api_key", &"[REDACTED]")
            .finish()
    }
}

/// Background update of a user's last-used timestamp.
///
/// The update starts as soon as authentication succeeds. Callers must
/// [`wait`](Self::wait) on it before finishing the request: the host may
/// suspend the process right after the response is flushed.
#[derive(Debug)]
pub struct LastUsedUpdate {
    handle: Option<JoinHandle<()>>,
}

impl LastUsedUpdate {
    /// A handle with nothing to wait for.
    pub fn none() -> Self {
        Self { handle: None }
    }

    /// Wait for the update to finish. Failures were already logged.
    pub async fn wait(mut self) {
        if let Some(handle) = self.handle.take() {
            if let Err(err) = handle.await {
                warn!(error = %err, "last-used update task failed");
            }
        }
    }
}

/// Generate a random URL-safe API key.
pub fn generate_api_key() -> String {
    random_token(API_KEY_BYTES)
}

/// SHA-256 hex digest used to store and look up API keys.
pub fn hash_api_key(api_key: &str) -> String {
    hex::encode(Sha256::digest(api_key.as_bytes()))
}

fn random_token(len: usize) -> String {
    let mut bytes = vec![0_u8; len];
    rand::thread_rng().fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

fn validate_email(email: &str) -> Result<()> {
    let pattern = EMAIL
        .as_ref()
        .map_err(|err| Error::Internal(format!("email pattern: {err}")))?;
    if pattern.is_match(email) {
        Ok(())
    } else {
        Err(Error::InvalidRequest(format!("invalid email address {email:?}")))
    }
}

/// User management and authentication.
#[derive(Clone)]
pub struct UserService {
    repo: Arc<dyn UserRepository>,
    enforcer: Arc<PolicyEnforcer>,
    claim_ttl: Duration,
}

impl std::fmt::Debug for UserService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UserService")
            .field("claim_ttl", &self.claim_ttl)
            .finish_non_exhaustive()
    }
}

impl UserService {
    /// Build a user service. Role changes are mirrored into `enforcer`.
    pub fn new(
        repo: Arc<dyn UserRepository>,
        enforcer: Arc<PolicyEnforcer>,
        claim_ttl: Duration,
    ) -> Self {
        Self {
            repo,
            enforcer,
            claim_ttl,
        }
    }

    /// Copy the role of every non-revoked user into the enforcer.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Unavailable`] when users cannot be listed.
    pub async fn load_role_assignments(&self) -> Result<usize> {
        let users = self
            .repo
            .list_users()
            .await
            .map_err(|err| Error::unavailable("loading role assignments", err))?;
        let count = self.enforcer.load_assignments(
            users
                .into_iter()
                .filter(|user| !user.revoked)
                .map(|user| (user.email, user.role)),
        )?;
        info!(count, "role assignments loaded");
        Ok(count)
    }

    /// Create a user and a one-time claim token for its API key.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidRequest`] for malformed emails or an expiry in the
    /// past, and [`Error::Conflict`] when the email is taken.
    pub async fn create_user(
        &self,
        creator: &str,
        email: &str,
        role: Role,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<CreateUserResponse> {
        let email = email.trim();
        validate_email(email)?;
        let now = Utc::now();
        if expires_at.is_some_and(|expires| expires <= now) {
            return Err(Error::InvalidRequest("expires_at must be in the future".to_owned()));
        }

        let api_key = generate_api_key();
        let user = User {
            email: email.to_owned(),
            role,
            api_key_hash: hash_api_key(&api_key),
            revoked: false,
            created_by: Some(creator.to_owned()),
            created_at: now,
            last_used: None,
            expires_at,
        };
        self.insert_user(&user).await?;

        let claim_expires_at = now.checked_add_signed(self.claim_ttl).unwrap_or(now);
        let pending = PendingApiKey {
            token: random_token(CLAIM_TOKEN_BYTES),
            email: email.to_owned(),
            api_key,
            created_by: creator.to_owned(),
            created_at: now,
            expires_at: claim_expires_at,
            claimed: false,
            claimed_at: None,
            claimed_from: None,
        };
        self.repo
            .create_pending_api_key(&pending)
            .await
            .map_err(|err| Error::unavailable("storing claim token", err))?;

        self.enforcer.add_role_for_user(email, role)?;
        info!(email, role = %role, creator, "user created");

        Ok(CreateUserResponse {
            user,
            claim_token: pending.token,
            claim_expires_at,
        })
    }

    /// Create the first admin and return its API key directly.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Conflict`] if any user already exists.
    pub async fn bootstrap_admin(&self, email: &str) -> Result<ClaimResponse> {
        let email = email.trim();
        validate_email(email)?;
        let existing = self
            .repo
            .list_users()
            .await
            .map_err(|err| Error::unavailable("listing users", err))?;
        if !existing.is_empty() {
            return Err(Error::Conflict(
                "users already exist; create further users through an admin".to_owned(),
            ));
        }

        let api_key = generate_api_key();
        let user = User {
            email: email.to_owned(),
            role: Role::Admin,
            api_key_hash: hash_api_key(&api_key),
            revoked: false,
            created_by: None,
            created_at: Utc::now(),
            last_used: None,
            expires_at: None,
        };
        self.insert_user(&user).await?;
        self.enforcer.add_role_for_user(email, Role::Admin)?;
        info!(email, "bootstrap admin created");

        Ok(ClaimResponse {
            email: email.to_owned(),
            api_key,
        })
    }

    /// Reveal the API key behind a claim token, once.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] for unknown tokens, [`Error::Conflict`] when
    /// already claimed, and [`Error::Unauthorized`] when expired.
    pub async fn claim_api_key(&self, token: &str, client_addr: &str) -> Result<ClaimResponse> {
        let token = token.trim();
        let pending = self
            .repo
            .get_pending_api_key(token)
            .await
            .map_err(|err| Error::unavailable("loading claim token", err))?
            .ok_or_else(|| Error::not_found("claim token", token))?;

        if pending.claimed {
            return Err(Error::Conflict("API key was already claimed".to_owned()));
        }
        let now = Utc::now();
        if pending.expires_at <= now {
            return Err(Error::Unauthorized("claim token has expired".to_owned()));
        }

        let marked = self
            .repo
            .mark_pending_api_key_claimed(token, now, client_addr)
            .await
            .map_err(|err| Error::unavailable("claiming API key", err))?;
        if !marked {
            return Err(Error::Conflict("API key was already claimed".to_owned()));
        }

        info!(email = %pending.email, client_addr, "API key claimed");
        Ok(ClaimResponse {
            email: pending.email,
            api_key: pending.api_key,
        })
    }

    /// Authenticate an API key.
    ///
    /// On success the last-used timestamp update is started in the background;
    /// the returned [`LastUsedUpdate`] must be awaited before the request ends.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Unauthorized`] for empty, unknown, revoked or expired keys.
    pub async fn authenticate_user(&self, api_key: &str) -> Result<(User, LastUsedUpdate)> {
        let api_key = api_key.trim();
        if api_key.is_empty() {
            return Err(Error::Unauthorized("API key is required".to_owned()));
        }

        let user = self
            .repo
            .get_user_by_api_key_hash(&hash_api_key(api_key))
            .await
            .map_err(|err| Error::unavailable("looking up API key", err))?
            .ok_or_else(|| Error::Unauthorized("invalid API key".to_owned()))?;

        if user.revoked {
            return Err(Error::Unauthorized("API key has been revoked".to_owned()));
        }
        let now = Utc::now();
        if user.is_expired(now) {
            return Err(Error::Unauthorized("user account has expired".to_owned()));
        }

        let repo = Arc::clone(&self.repo);
        let email = user.email.clone();
        let handle = tokio::spawn(async move {
            match repo.update_last_used(&email, now).await {
                Ok(true) => debug!(email, "last used updated"),
                Ok(false) => warn!(email, "last used update matched no user"),
                Err(err) => warn!(email, error = %err, "failed to update last used"),
            }
        });

        Ok((
            user,
            LastUsedUpdate {
                handle: Some(handle),
            },
        ))
    }

    /// Revoke a user. Revoking an already revoked user is a no-op.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] for unknown users.
    pub async fn revoke_user(&self, email: &str) -> Result<User> {
        let email = email.trim();
        let mut user = self
            .repo
            .get_user(email)
            .await
            .map_err(|err| Error::unavailable("loading user", err))?
            .ok_or_else(|| Error::not_found("user", email))?;

        if !user.revoked {
            user.revoked = true;
            let updated = self
                .repo
                .update_user(&user)
                .await
                .map_err(|err| Error::unavailable("revoking user", err))?;
            if !updated {
                return Err(Error::not_found("user", email));
            }
            info!(email, "user revoked");
        }
        self.enforcer.remove_role_for_user(email)?;
        Ok(user)
    }

    /// Every user, ordered by email.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Unavailable`] on repository failure.
    pub async fn list_users(&self) -> Result<Vec<User>> {
        let mut users = self
            .repo
            .list_users()
            .await
            .map_err(|err| Error::unavailable("listing users", err))?;
        users.sort_by(|a, b| a.email.cmp(&b.email));
        Ok(users)
    }

    async fn insert_user(&self, user: &User) -> Result<()> {
        self.repo.create_user(user).await.map_err(|err| match err {
            StoreError::Duplicate(_) => Error::Conflict(format!("user {} already exists", user.email)),
            other => Error::unavailable("creating user", other),
        })
    }
}
