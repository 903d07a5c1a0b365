//! Repository interfaces and their implementations.
//!
//! The core depends only on the traits in this module. Two implementations ship
//! with the crate: [`memory::MemoryStore`] for tests and ephemeral runs, and
//! [`sqlite::SqliteStore`] for persistent deployments.

pub mod memory;
pub mod sqlite;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::catalog::images::ImageInfo;
use crate::catalog::secrets::Secret;
use crate::execution::{Execution, ExecutionStatus};
use crate::identity::{PendingApiKey, User};

/// Errors from repository operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Database operation failed.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// A unique key already exists.
    #[error("duplicate key: {0}")]
    Duplicate(String),

    /// A stored value could not be decoded.
    #[error("invalid {field} value: {value:?}")]
    InvalidValue {
        /// Which field contained the bad value.
        field: &'static str,
        /// The unexpected value.
        value: String,
    },

    /// JSON column encoding failed.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Persistence for users and pending API-key claims.
#[async_trait]
pub trait UserRepository: Send + Sync {
    /// Insert a user; [`StoreError::Duplicate`] if the email exists.
    async fn create_user(&self, user: &User) -> Result<(), StoreError>;
    /// Look up a user by email.
    async fn get_user(&self, email: &str) -> Result<Option<User>, StoreError>;
    /// Look up a user by API-key hash.
    async fn get_user_by_api_key_hash(&self, hash: &str) -> Result<Option<User>, StoreError>;
    /// Replace a user record. Returns `false` when no such user exists.
    async fn update_user(&self, user: &User) -> Result<bool, StoreError>;
    /// Set the last-used timestamp. Returns `false` when no such user exists.
    async fn update_last_used(&self, email: &str, at: DateTime<Utc>) -> Result<bool, StoreError>;
    /// Every user.
    async fn list_users(&self) -> Result<Vec<User>, StoreError>;
    /// Insert a pending claim.
    async fn create_pending_api_key(&self, pending: &PendingApiKey) -> Result<(), StoreError>;
    /// Look up a pending claim by token.
    async fn get_pending_api_key(&self, token: &str) -> Result<Option<PendingApiKey>, StoreError>;
    /// Atomically mark an unclaimed token as claimed and clear its plaintext key.
    ///
    /// Returns `false` if the token is unknown or was already claimed.
    async fn mark_pending_api_key_claimed(
        &self,
        token: &str,
        at: DateTime<Utc>,
        client_addr: &str,
    ) -> Result<bool, StoreError>;
}

/// Persistence for executions.
#[async_trait]
pub trait ExecutionRepository: Send + Sync {
    /// Insert a new execution; [`StoreError::Duplicate`] if the id exists.
    async fn create_execution(&self, execution: &Execution) -> Result<(), StoreError>;
    /// Look up an execution by id.
    async fn get_execution(&self, id: &str) -> Result<Option<Execution>, StoreError>;
    /// Replace an execution record. Returns `false` when no such execution exists.
    async fn update_execution(&self, execution: &Execution) -> Result<bool, StoreError>;
    /// Executions newest first, optionally limited and filtered by status.
    ///
    /// An empty `statuses` slice means no filter.
    async fn list_executions(
        &self,
        limit: Option<usize>,
        statuses: &[ExecutionStatus],
    ) -> Result<Vec<Execution>, StoreError>;
}

/// Persistence for registered images.
#[async_trait]
pub trait ImageRepository: Send + Sync {
    /// Insert an image; [`StoreError::Duplicate`] if reference or id exist.
    async fn register_image(&self, image: &ImageInfo) -> Result<(), StoreError>;
    /// Look up an image by id.
    async fn get_image(&self, image_id: &str) -> Result<Option<ImageInfo>, StoreError>;
    /// Look up an image by its exact raw reference.
    async fn get_image_by_reference(&self, reference: &str)
        -> Result<Option<ImageInfo>, StoreError>;
    /// The image flagged as default.
    async fn get_default_image(&self) -> Result<Option<ImageInfo>, StoreError>;
    /// Flag one image as default and clear every other flag, atomically.
    ///
    /// Returns `false` when no such image exists.
    async fn set_default_image(&self, image_id: &str) -> Result<bool, StoreError>;
    /// Every image, ordered by reference.
    async fn list_images(&self) -> Result<Vec<ImageInfo>, StoreError>;
    /// Delete an image. Returns `false` when no such image exists.
    async fn remove_image(&self, image_id: &str) -> Result<bool, StoreError>;
}

/// Persistence for secrets.
#[async_trait]
pub trait SecretRepository: Send + Sync {
    /// Insert a secret; [`StoreError::Duplicate`] if the name exists.
    async fn create_secret(&self, secret: &Secret) -> Result<(), StoreError>;
    /// Look up a secret by name.
    async fn get_secret(&self, name: &str) -> Result<Option<Secret>, StoreError>;
    /// Every secret, ordered by name.
    async fn list_secrets(&self) -> Result<Vec<Secret>, StoreError>;
    /// Replace a secret. Returns `false` when no such secret exists.
    async fn update_secret(&self, secret: &Secret) -> Result<bool, StoreError>;
    /// Delete a secret. Returns `false` when no such secret exists.
    async fn delete_secret(&self, name: &str) -> Result<bool, StoreError>;
}
