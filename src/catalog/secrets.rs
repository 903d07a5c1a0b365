//! Named secrets.
//!
//! Executions reference secrets by name; the value is injected by the task
//! provider at launch time and never read by the orchestrator.

use std::collections::BTreeMap;
use std::sync::{Arc, LazyLock};

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{Error, Result};
use crate::store::{SecretRepository, StoreError};

/// Secret names: start alphanumeric, then alphanumerics, `.`, `_` or `-`.
static SECRET_NAME: LazyLock<Result<Regex, regex::Error>> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9][A-Za-z0-9._-]{0,127}$"));

/// Maximum secret value size in bytes.
pub const MAX_SECRET_VALUE_SIZE: usize = 64 * 1024;

/// A named secret including its value.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Secret {
    /// Unique name.
    pub name: String,
    /// Secret value.
    pub value: String,
    /// Free-form description.
    pub description: String,
    /// Users that own the secret.
    pub owners: Vec<String>,
    /// Creator email.
    pub created_by: String,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Email of the last updater.
    pub updated_by: String,
    /// Last update time.
    pub updated_at: DateTime<Utc>,
}

impl std::fmt::Debug for Secret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Secret")
            .field("name", &self.name)
            .field("value", &"[REDACTED]")
            .field("description", &self.description)
            .field("owners", &self.owners)
            .finish_non_exhaustive()
    }
}

/// A secret without its value, as returned by listings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecretMetadata {
    /// Unique name.
    pub name: String,
    /// Free-form description.
    pub description: String,
    /// Users that own the secret.
    pub owners: Vec<String>,
    /// Creator email.
    pub created_by: String,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Last update time.
    pub updated_at: DateTime<Utc>,
}

impl From<Secret> for SecretMetadata {
    fn from(secret: Secret) -> Self {
        Self {
            name: secret.name,
            description: secret.description,
            owners: secret.owners,
            created_by: secret.created_by,
            created_at: secret.created_at,
            updated_at: secret.updated_at,
        }
    }
}

/// Validate a secret name.
///
/// # Errors
///
/// Returns [`Error::InvalidRequest`] when the name is empty or uses characters
/// outside `[A-Za-z0-9._-]`.
pub fn validate_secret_name(name: &str) -> Result<()> {
    let pattern = SECRET_NAME
        .as_ref()
        .map_err(|err| Error::Internal(format!("secret name pattern: {err}")))?;
    if pattern.is_match(name) {
        Ok(())
    } else {
        Err(Error::InvalidRequest(format!(
            "invalid secret name {name:?}: use letters, digits, '.', '_' or '-'"
        )))
    }
}

/// Variables a secret may not replace inside the container.
pub const RESERVED_ENV_KEYS: &[&str] = &[
    "HOME",
    "HOSTNAME",
    "LD_LIBRARY_PATH",
    "LD_PRELOAD",
    "PATH",
    "PWD",
    "SHELL",
    "TERM",
    "USER",
];

/// Environment variable name a secret is exposed under (`db-password` -> `DB_PASSWORD`).
pub fn secret_env_key(name: &str) -> String {
    let mut key: String = name
        .trim()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_uppercase()
            } else {
                '_'
            }
        })
        .collect();
    if key.starts_with(|c: char| c.is_ascii_digit()) {
        key.insert(0, '_');
    }
    key
}

/// Map secret names to the environment keys they are injected under.
///
/// Blank names are skipped and repeated names collapse. The result is keyed
/// by environment variable name.
///
/// # Errors
///
/// Returns [`Error::InvalidRequest`] when a name maps to a reserved variable
/// or when two distinct names map to the same variable.
pub fn secret_env_keys(names: &[String]) -> Result<BTreeMap<String, String>> {
    let mut keys: BTreeMap<String, String> = BTreeMap::new();
    for raw in names {
        let name = raw.trim();
        if name.is_empty() {
            continue;
        }
        let key = secret_env_key(name);
        if RESERVED_ENV_KEYS.contains(&key.as_str()) {
            return Err(Error::InvalidRequest(format!(
                "secret {name:?} would replace the reserved variable {key}"
            )));
        }
        match keys.get(&key) {
            Some(existing) if existing != name => {
                return Err(Error::InvalidRequest(format!(
                    "secrets {existing:?} and {name:?} both map to {key}"
                )));
            }
            Some(_) => {}
            None => {
                keys.insert(key, name.to_owned());
            }
        }
    }
    Ok(keys)
}

fn validate_value(value: &str) -> Result<()> {
    if value.is_empty() {
        return Err(Error::InvalidRequest("secret value must not be empty".to_owned()));
    }
    if value.len() > MAX_SECRET_VALUE_SIZE {
        return Err(Error::InvalidRequest(format!(
            "secret value exceeds {MAX_SECRET_VALUE_SIZE} bytes"
        )));
    }
    Ok(())
}

/// Secret management backed by a [`SecretRepository`].
#[derive(Clone)]
pub struct SecretCatalog {
    repo: Arc<dyn SecretRepository>,
}

impl std::fmt::Debug for SecretCatalog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecretCatalog").finish_non_exhaustive()
    }
}

impl SecretCatalog {
    /// Build a catalog over `repo`.
    pub fn new(repo: Arc<dyn SecretRepository>) -> Self {
        Self { repo }
    }

    /// Create a secret owned by `creator`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidRequest`] for bad names or values and
    /// [`Error::Conflict`] when the name is taken.
    pub async fn create_secret(
        &self,
        creator: &str,
        name: &str,
        value: &str,
        description: &str,
    ) -> Result<SecretMetadata> {
        let name = name.trim();
        validate_secret_name(name)?;
        validate_value(value)?;

        let now = Utc::now();
        let secret = Secret {
            name: name.to_owned(),
            value: value.to_owned(),
            description: description.trim().to_owned(),
            owners: vec![creator.to_owned()],
            created_by: creator.to_owned(),
            created_at: now,
            updated_by: creator.to_owned(),
            updated_at: now,
        };

        self.repo
            .create_secret(&secret)
            .await
            .map_err(|err| match err {
                StoreError::Duplicate(_) => Error::Conflict(format!("secret {name} already exists")),
                other => Error::unavailable("creating secret", other),
            })?;

        info!(secret = name, creator, "secret created");
        Ok(secret.into())
    }

    /// Fetch a secret including its value.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] for unknown names.
    pub async fn get_secret(&self, name: &str) -> Result<Secret> {
        let name = name.trim();
        self.repo
            .get_secret(name)
            .await
            .map_err(|err| Error::unavailable("loading secret", err))?
            .ok_or_else(|| Error::not_found("secret", name))
    }

    /// Confirm every named secret exists.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] naming the first missing secret.
    pub async fn require_secrets(&self, names: &[String]) -> Result<()> {
        for name in names {
            let found = self
                .repo
                .get_secret(name)
                .await
                .map_err(|err| Error::unavailable("loading secret", err))?;
            if found.is_none() {
                return Err(Error::not_found("secret", name.as_str()));
            }
        }
        Ok(())
    }

    /// List every secret without values.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Unavailable`] on repository failure.
    pub async fn list_secrets(&self) -> Result<Vec<SecretMetadata>> {
        let secrets = self
            .repo
            .list_secrets()
            .await
            .map_err(|err| Error::unavailable("listing secrets", err))?;
        Ok(secrets.into_iter().map(SecretMetadata::from).collect())
    }

    /// Update a secret's value and/or description.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidRequest`] when nothing changes or the new value is
    /// invalid, and [`Error::NotFound`] for unknown names.
    pub async fn update_secret(
        &self,
        updater: &str,
        name: &str,
        value: Option<&str>,
        description: Option<&str>,
    ) -> Result<SecretMetadata> {
        if value.is_none() && description.is_none() {
            return Err(Error::InvalidRequest(
                "update requires a new value or description".to_owned(),
            ));
        }
        if let Some(value) = value {
            validate_value(value)?;
        }

        let mut secret = self.get_secret(name).await?;
        if let Some(value) = value {
            secret.value = value.to_owned();
        }
        if let Some(description) = description {
            secret.description = description.trim().to_owned();
        }
        secret.updated_by = updater.to_owned();
        secret.updated_at = Utc::now();

        let updated = self
            .repo
            .update_secret(&secret)
            .await
            .map_err(|err| Error::unavailable("updating secret", err))?;
        if !updated {
            return Err(Error::not_found("secret", &secret.name));
        }

        info!(secret = %secret.name, updater, "secret updated");
        Ok(secret.into())
    }

    /// Delete a secret.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] for unknown names.
    pub async fn delete_secret(&self, name: &str) -> Result<()> {
        let name = name.trim();
        let deleted = self
            .repo
            .delete_secret(name)
            .await
            .map_err(|err| Error::unavailable("deleting secret", err))?;
        if !deleted {
            return Err(Error::not_found("secret", name));
        }
        info!(secret = name, "secret deleted");
        Ok(())
    }
}
