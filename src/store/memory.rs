//! In-memory repositories.
//!
//! State lives for the lifetime of the process. Each collection sits behind its
//! own async [`RwLock`]; every write completes inside a single critical section,
//! so compound operations (default-image swap, claim marking) are atomic.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use super::{ExecutionRepository, ImageRepository, SecretRepository, StoreError, UserRepository};
use crate::catalog::images::ImageInfo;
use crate::catalog::secrets::Secret;
use crate::execution::{Execution, ExecutionStatus};
use crate::identity::{PendingApiKey, User};

/// Process-local implementation of every repository trait.
#[derive(Debug, Default)]
pub struct MemoryStore {
    users: RwLock<HashMap<String, User>>,
    pending_keys: RwLock<HashMap<String, PendingApiKey>>,
    executions: RwLock<HashMap<String, Execution>>,
    images: RwLock<HashMap<String, ImageInfo>>,
    secrets: RwLock<HashMap<String, Secret>>,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl UserRepository for MemoryStore {
    async fn create_user(&self, user: &User) -> Result<(), StoreError> {
        let mut users = self.users.write().await;
        if users.contains_key(&user.email) {
            return Err(StoreError::Duplicate(user.email.clone()));
        }
        users.insert(user.email.clone(), user.clone());
        Ok(())
    }

    async fn get_user(&self, email: &str) -> Result<Option<User>, StoreError> {
        Ok(self.users.read().await.get(email).cloned())
    }

    async fn get_user_by_api_key_hash(&self, hash: &str) -> Result<Option<User>, StoreError> {
        Ok(self
            .users
            .read()
            .await
            .values()
            .find(|user| user.api_key_hash == hash)
            .cloned())
    }

    async fn update_user(&self, user: &User) -> Result<bool, StoreError> {
        let mut users = self.users.write().await;
        match users.get_mut(&user.email) {
            Some(existing) => {
                *existing = user.clone();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn update_last_used(&self, email: &str, at: DateTime<Utc>) -> Result<bool, StoreError> {
        let mut users = self.users.write().await;
        match users.get_mut(email) {
            Some(user) => {
                user.last_used = Some(at);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn list_users(&self) -> Result<Vec<User>, StoreError> {
        Ok(self.users.read().await.values().cloned().collect())
    }

    async fn create_pending_api_key(&self, pending: &PendingApiKey) -> Result<(), StoreError> {
        let mut keys = self.pending_keys.write().await;
        if keys.contains_key(&pending.token) {
            return Err(StoreError::Duplicate(pending.token.clone()));
        }
        keys.insert(pending.token.clone(), pending.clone());
        Ok(())
    }

    async fn get_pending_api_key(&self, token: &str) -> Result<Option<PendingApiKey>, StoreError> {
        Ok(self.pending_keys.read().await.get(token).cloned())
    }

    async fn mark_pending_api_key_claimed(
        &self,
        token: &str,
        at: DateTime<Utc>,
        client_addr: &str,
    ) -> Result<bool, StoreError> {
        let mut keys = self.pending_keys.write().await;
        match keys.get_mut(token) {
            Some(pending) if !pending.claimed => {
                pending.claimed = true;
                pending.claimed_at = Some(at);
                pending.claimed_from = Some(client_addr.to_owned());
                pending.api_key.clear();
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

#[async_trait]
impl ExecutionRepository for MemoryStore {
    async fn create_execution(&self, execution: &Execution) -> Result<(), StoreError> {
        let mut executions = self.executions.write().await;
        if executions.contains_key(&execution.execution_id) {
            return Err(StoreError::Duplicate(execution.execution_id.clone()));
        }
        executions.insert(execution.execution_id.clone(), execution.clone());
        Ok(())
    }

    async fn get_execution(&self, id: &str) -> Result<Option<Execution>, StoreError> {
        Ok(self.executions.read().await.get(id).cloned())
    }

    async fn update_execution(&self, execution: &Execution) -> Result<bool, StoreError> {
        let mut executions = self.executions.write().await;
        match executions.get_mut(&execution.execution_id) {
            Some(existing) => {
                *existing = execution.clone();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn list_executions(
        &self,
        limit: Option<usize>,
        statuses: &[ExecutionStatus],
    ) -> Result<Vec<Execution>, StoreError> {
        let executions = self.executions.read().await;
        let mut matching: Vec<Execution> = executions
            .values()
            .filter(|execution| statuses.is_empty() || statuses.contains(&execution.status))
            .cloned()
            .collect();
        matching.sort_by(|a, b| {
            b.created_at
                .cmp(&a.created_at)
                .then_with(|| b.execution_id.cmp(&a.execution_id))
        });
        if let Some(limit) = limit {
            matching.truncate(limit);
        }
        Ok(matching)
    }
}

#[async_trait]
impl ImageRepository for MemoryStore {
    async fn register_image(&self, image: &ImageInfo) -> Result<(), StoreError> {
        let mut images = self.images.write().await;
        let taken = images.contains_key(&image.image_id)
            || images.values().any(|existing| existing.image == image.image);
        if taken {
            return Err(StoreError::Duplicate(image.image.clone()));
        }
        images.insert(image.image_id.clone(), image.clone());
        Ok(())
    }

    async fn get_image(&self, image_id: &str) -> Result<Option<ImageInfo>, StoreError> {
        Ok(self.images.read().await.get(image_id).cloned())
    }

    async fn get_image_by_reference(
        &self,
        reference: &str,
    ) -> Result<Option<ImageInfo>, StoreError> {
        Ok(self
            .images
            .read()
            .await
            .values()
            .find(|image| image.image == reference)
            .cloned())
    }

    async fn get_default_image(&self) -> Result<Option<ImageInfo>, StoreError> {
        Ok(self
            .images
            .read()
            .await
            .values()
            .find(|image| image.is_default)
            .cloned())
    }

    async fn set_default_image(&self, image_id: &str) -> Result<bool, StoreError> {
        let mut images = self.images.write().await;
        if !images.contains_key(image_id) {
            return Ok(false);
        }
        for (id, image) in images.iter_mut() {
            image.is_default = id == image_id;
        }
        Ok(true)
    }

    async fn list_images(&self) -> Result<Vec<ImageInfo>, StoreError> {
        let mut images: Vec<ImageInfo> = self.images.read().await.values().cloned().collect();
        images.sort_by(|a, b| a.image.cmp(&b.image));
        Ok(images)
    }

    async fn remove_image(&self, image_id: &str) -> Result<bool, StoreError> {
        Ok(self.images.write().await.remove(image_id).is_some())
    }
}

#[async_trait]
impl SecretRepository for MemoryStore {
    async fn create_secret(&self, secret: &Secret) -> Result<(), StoreError> {
        let mut secrets = self.secrets.write().await;
        if secrets.contains_key(&secret.name) {
            return Err(StoreError::Duplicate(secret.name.clone()));
        }
        secrets.insert(secret.name.clone(), secret.clone());
        Ok(())
    }

    async fn get_secret(&self, name: &str) -> Result<Option<Secret>, StoreError> {
        Ok(self.secrets.read().await.get(name).cloned())
    }

    async fn list_secrets(&self) -> Result<Vec<Secret>, StoreError> {
        let mut secrets: Vec<Secret> = self.secrets.read().await.values().cloned().collect();
        secrets.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(secrets)
    }

    async fn update_secret(&self, secret: &Secret) -> Result<bool, StoreError> {
        let mut secrets = self.secrets.write().await;
        match secrets.get_mut(&secret.name) {
            Some(existing) => {
                *existing = secret.clone();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn delete_secret(&self, name: &str) -> Result<bool, StoreError> {
        Ok(self.secrets.write().await.remove(name).is_some())
    }
}
