//! SQLite repositories backed by `sqlx`.
//!
//! The schema is applied inline via `include_str!` when the store is opened.

use std::path::Path;
use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::{QueryBuilder, Row, Sqlite, SqlitePool};
use tracing::info;

use super::{ExecutionRepository, ImageRepository, SecretRepository, StoreError, UserRepository};
use crate::authorization::Role;
use crate::catalog::images::ImageInfo;
use crate::catalog::secrets::Secret;
use crate::execution::{Execution, ExecutionStatus};
use crate::identity::{PendingApiKey, User};

const SCHEMA: &str = include_str!("../../migrations/001_runvoy_schema.sql");

/// SQLite implementation of every repository trait.
#[derive(Debug, Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Open (or create) the database at `path` and apply the schema.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be opened or the schema fails to apply.
    pub async fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| StoreError::Database(e.into()))?;
            }
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .pragma("trusted_schema", "OFF")
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await?;

        let store = Self::from_pool(pool).await?;
        info!(path = %path.display(), "sqlite store opened");
        Ok(store)
    }

    /// Open a private in-memory database (single connection).
    ///
    /// # Errors
    ///
    /// Returns an error if the schema fails to apply.
    pub async fn in_memory() -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?.foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;
        Self::from_pool(pool).await
    }

    /// Wrap an existing pool and apply the schema.
    ///
    /// # Errors
    ///
    /// Returns an error if the schema fails to apply.
    pub async fn from_pool(pool: SqlitePool) -> Result<Self, StoreError> {
        sqlx::raw_sql(SCHEMA).execute(&pool).await?;
        Ok(Self { pool })
    }

    /// Underlying connection pool.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

fn ts(value: DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn opt_ts(value: Option<DateTime<Utc>>) -> Option<String> {
    value.map(ts)
}

fn parse_ts(field: &'static str, raw: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|value| value.with_timezone(&Utc))
        .map_err(|_| StoreError::InvalidValue {
            field,
            value: raw.to_owned(),
        })
}

fn parse_opt_ts(field: &'static str, raw: Option<String>) -> Result<Option<DateTime<Utc>>, StoreError> {
    raw.map(|value| parse_ts(field, &value)).transpose()
}

/// Map a unique-constraint violation to [`StoreError::Duplicate`].
fn insert_error(err: sqlx::Error, key: &str) -> StoreError {
    match &err {
        sqlx::Error::Database(db) if db.is_unique_violation() => {
            StoreError::Duplicate(key.to_owned())
        }
        _ => StoreError::Database(err),
    }
}

fn to_i64(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

fn user_from_row(row: &SqliteRow) -> Result<User, StoreError> {
    let role_raw: String = row.try_get("role")?;
    let role = Role::from_str(&role_raw).map_err(|_| StoreError::InvalidValue {
        field: "role",
        value: role_raw.clone(),
    })?;
    let created_at: String = row.try_get("created_at")?;
    Ok(User {
        email: row.try_get("email")?,
        role,
        api_key_hash: row.try_get("api_key_hash")?,
        revoked: row.try_get("revoked")?,
        created_by: row.try_get("created_by")?,
        created_at: parse_ts("created_at", &created_at)?,
        last_used: parse_opt_ts("last_used", row.try_get("last_used")?)?,
        expires_at: parse_opt_ts("expires_at", row.try_get("expires_at")?)?,
    })
}

fn pending_from_row(row: &SqliteRow) -> Result<PendingApiKey, StoreError> {
    let created_at: String = row.try_get("created_at")?;
    let expires_at: String = row.try_get("expires_at")?;
    Ok(PendingApiKey {
        token: row.try_get("token")?,
        email: row.try_get("email")?,
        api_key: row.try_get("api_key")?,
        created_by: row.try_get("created_by")?,
        created_at: parse_ts("created_at", &created_at)?,
        expires_at: parse_ts("expires_at", &expires_at)?,
        claimed: row.try_get("claimed")?,
        claimed_at: parse_opt_ts("claimed_at", row.try_get("claimed_at")?)?,
        claimed_from: row.try_get("claimed_from")?,
    })
}

fn execution_from_row(row: &SqliteRow) -> Result<Execution, StoreError> {
    let status_raw: String = row.try_get("status")?;
    let status = ExecutionStatus::from_str(&status_raw).map_err(|_| StoreError::InvalidValue {
        field: "status",
        value: status_raw.clone(),
    })?;
    let env: String = row.try_get("env")?;
    let secrets: String = row.try_get("secrets")?;
    let created_at: String = row.try_get("created_at")?;
    let timeout: Option<i64> = row.try_get("timeout_seconds")?;
    Ok(Execution {
        execution_id: row.try_get("execution_id")?,
        command: row.try_get("command")?,
        env: serde_json::from_str(&env)?,
        secrets: serde_json::from_str(&secrets)?,
        image_id: row.try_get("image_id")?,
        status,
        created_by: row.try_get("created_by")?,
        created_at: parse_ts("created_at", &created_at)?,
        started_at: parse_opt_ts("started_at", row.try_get("started_at")?)?,
        completed_at: parse_opt_ts("completed_at", row.try_get("completed_at")?)?,
        timeout_seconds: timeout.and_then(|value| u64::try_from(value).ok()),
        task_ref: row.try_get("task_ref")?,
        exit_code: row.try_get("exit_code")?,
        reason: row.try_get("reason")?,
    })
}

fn image_from_row(row: &SqliteRow) -> Result<ImageInfo, StoreError> {
    let created_at: String = row.try_get("created_at")?;
    Ok(ImageInfo {
        image: row.try_get("image")?,
        image_id: row.try_get("image_id")?,
        name: row.try_get("name")?,
        tag: row.try_get("tag")?,
        registry: row.try_get("registry")?,
        is_default: row.try_get("is_default")?,
        created_by: row.try_get("created_by")?,
        created_at: parse_ts("created_at", &created_at)?,
    })
}

fn secret_from_row(row: &SqliteRow) -> Result<Secret, StoreError> {
    let owners: String = row.try_get("owners")?;
    let created_at: String = row.try_get("created_at")?;
    let updated_at: String = row.try_get("updated_at")?;
    Ok(Secret {
        name: row.try_get("name")?,
        value: row.try_get("value")?,
        description: row.try_get("description")?,
        owners: serde_json::from_str(&owners)?,
        created_by: row.try_get("created_by")?,
        created_at: parse_ts("created_at", &created_at)?,
        updated_by: row.try_get("updated_by")?,
        updated_at: parse_ts("updated_at", &updated_at)?,
    })
}

#[async_trait]
impl UserRepository for SqliteStore {
    async fn create_user(&self, user: &User) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO users (email, role, api_key_hash, revoked, created_by, created_at, last_used, expires_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        )
        .bind(&user.email)
        .bind(user.role.as_str())
        .bind(&user.api_key_hash)
        .bind(user.revoked)
        .bind(&user.created_by)
        .bind(ts(user.created_at))
        .bind(opt_ts(user.last_used))
        .bind(opt_ts(user.expires_at))
        .execute(&self.pool)
        .await
        .map_err(|err| insert_error(err, &user.email))?;
        Ok(())
    }

    async fn get_user(&self, email: &str) -> Result<Option<User>, StoreError> {
        sqlx::query("SELECT * FROM users WHERE email = ?1")
            .bind(email)
            .fetch_optional(&self.pool)
            .await?
            .as_ref()
            .map(user_from_row)
            .transpose()
    }

    async fn get_user_by_api_key_hash(&self, hash: &str) -> Result<Option<User>, StoreError> {
        sqlx::query("SELECT * FROM users WHERE api_key_hash = ?1")
            .bind(hash)
            .fetch_optional(&self.pool)
            .await?
            .as_ref()
            .map(user_from_row)
            .transpose()
    }

    async fn update_user(&self, user: &User) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "UPDATE users SET role = ?2, api_key_hash = ?3, revoked = ?4, last_used = ?5, expires_at = ?6 \
             WHERE email = ?1",
        )
        .bind(&user.email)
        .bind(user.role.as_str())
        .bind(&user.api_key_hash)
        .bind(user.revoked)
        .bind(opt_ts(user.last_used))
        .bind(opt_ts(user.expires_at))
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn update_last_used(&self, email: &str, at: DateTime<Utc>) -> Result<bool, StoreError> {
        let result = sqlx::query("UPDATE users SET last_used = ?2 WHERE email = ?1")
            .bind(email)
            .bind(ts(at))
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn list_users(&self) -> Result<Vec<User>, StoreError> {
        sqlx::query("SELECT * FROM users ORDER BY email ASC")
            .fetch_all(&self.pool)
            .await?
            .iter()
            .map(user_from_row)
            .collect()
    }

    async fn create_pending_api_key(&self, pending: &PendingApiKey) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO pending_api_keys (token, email, api_key, created_by, created_at, expires_at, claimed) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        )
        .bind(&pending.token)
        .bind(&pending.email)
        .bind(&pending.api_key)
        .bind(&pending.created_by)
        .bind(ts(pending.created_at))
        .bind(ts(pending.expires_at))
        .bind(pending.claimed)
        .execute(&self.pool)
        .await
        .map_err(|err| insert_error(err, "claim token"))?;
        Ok(())
    }

    async fn get_pending_api_key(&self, token: &str) -> Result<Option<PendingApiKey>, StoreError> {
        sqlx::query("SELECT * FROM pending_api_keys WHERE token = ?1")
            .bind(token)
            .fetch_optional(&self.pool)
            .await?
            .as_ref()
            .map(pending_from_row)
            .transpose()
    }

    async fn mark_pending_api_key_claimed(
        &self,
        token: &str,
        at: DateTime<Utc>,
        client_addr: &str,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "UPDATE pending_api_keys SET claimed = 1, claimed_at = ?2, claimed_from = ?3, api_key = '' \
             WHERE token = ?1 AND claimed = 0",
        )
        .bind(token)
        .bind(ts(at))
        .bind(client_addr)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }
}

#[async_trait]
impl ExecutionRepository for SqliteStore {
    async fn create_execution(&self, execution: &Execution) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO executions (execution_id, command, env, secrets, image_id, status, created_by, \
             created_at, started_at, completed_at, timeout_seconds, task_ref, exit_code, reason) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
        )
        .bind(&execution.execution_id)
        .bind(&execution.command)
        .bind(serde_json::to_string(&execution.env)?)
        .bind(serde_json::to_string(&execution.secrets)?)
        .bind(&execution.image_id)
        .bind(execution.status.as_str())
        .bind(&execution.created_by)
        .bind(ts(execution.created_at))
        .bind(opt_ts(execution.started_at))
        .bind(opt_ts(execution.completed_at))
        .bind(execution.timeout_seconds.map(to_i64))
        .bind(&execution.task_ref)
        .bind(execution.exit_code)
        .bind(&execution.reason)
        .execute(&self.pool)
        .await
        .map_err(|err| insert_error(err, &execution.execution_id))?;
        Ok(())
    }

    async fn get_execution(&self, id: &str) -> Result<Option<Execution>, StoreError> {
        sqlx::query("SELECT * FROM executions WHERE execution_id = ?1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .as_ref()
            .map(execution_from_row)
            .transpose()
    }

    async fn update_execution(&self, execution: &Execution) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "UPDATE executions SET status = ?2, started_at = ?3, completed_at = ?4, task_ref = ?5, \
             exit_code = ?6, reason = ?7 WHERE execution_id = ?1",
        )
        .bind(&execution.execution_id)
        .bind(execution.status.as_str())
        .bind(opt_ts(execution.started_at))
        .bind(opt_ts(execution.completed_at))
        .bind(&execution.task_ref)
        .bind(execution.exit_code)
        .bind(&execution.reason)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn list_executions(
        &self,
        limit: Option<usize>,
        statuses: &[ExecutionStatus],
    ) -> Result<Vec<Execution>, StoreError> {
        let mut query: QueryBuilder<'_, Sqlite> = QueryBuilder::new("SELECT * FROM executions");
        if !statuses.is_empty() {
            query.push(" WHERE status IN (");
            let mut separated = query.separated(", ");
            for status in statuses {
                separated.push_bind(status.as_str());
            }
            separated.push_unseparated(")");
        }
        query.push(" ORDER BY created_at DESC, execution_id DESC");
        if let Some(limit) = limit {
            query.push(" LIMIT ");
            query.push_bind(i64::try_from(limit).unwrap_or(i64::MAX));
        }

        query
            .build()
            .fetch_all(&self.pool)
            .await?
            .iter()
            .map(execution_from_row)
            .collect()
    }
}

#[async_trait]
impl ImageRepository for SqliteStore {
    async fn register_image(&self, image: &ImageInfo) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO images (image_id, image, name, tag, registry, is_default, created_by, created_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        )
        .bind(&image.image_id)
        .bind(&image.image)
        .bind(&image.name)
        .bind(&image.tag)
        .bind(&image.registry)
        .bind(image.is_default)
        .bind(&image.created_by)
        .bind(ts(image.created_at))
        .execute(&self.pool)
        .await
        .map_err(|err| insert_error(err, &image.image))?;
        Ok(())
    }

    async fn get_image(&self, image_id: &str) -> Result<Option<ImageInfo>, StoreError> {
        sqlx::query("SELECT * FROM images WHERE image_id = ?1")
            .bind(image_id)
            .fetch_optional(&self.pool)
            .await?
            .as_ref()
            .map(image_from_row)
            .transpose()
    }

    async fn get_image_by_reference(
        &self,
        reference: &str,
    ) -> Result<Option<ImageInfo>, StoreError> {
        sqlx::query("SELECT * FROM images WHERE image = ?1")
            .bind(reference)
            .fetch_optional(&self.pool)
            .await?
            .as_ref()
            .map(image_from_row)
            .transpose()
    }

    async fn get_default_image(&self) -> Result<Option<ImageInfo>, StoreError> {
        sqlx::query("SELECT * FROM images WHERE is_default = 1 LIMIT 1")
            .fetch_optional(&self.pool)
            .await?
            .as_ref()
            .map(image_from_row)
            .transpose()
    }

    async fn set_default_image(&self, image_id: &str) -> Result<bool, StoreError> {
        let mut tx = self.pool.begin().await?;
        let exists: Option<(i64,)> = sqlx::query_as("SELECT 1 FROM images WHERE image_id = ?1")
            .bind(image_id)
            .fetch_optional(&mut *tx)
            .await?;
        if exists.is_none() {
            tx.rollback().await?;
            return Ok(false);
        }
        sqlx::query("UPDATE images SET is_default = (image_id = ?1)")
            .bind(image_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(true)
    }

    async fn list_images(&self) -> Result<Vec<ImageInfo>, StoreError> {
        sqlx::query("SELECT * FROM images ORDER BY image ASC")
            .fetch_all(&self.pool)
            .await?
            .iter()
            .map(image_from_row)
            .collect()
    }

    async fn remove_image(&self, image_id: &str) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM images WHERE image_id = ?1")
            .bind(image_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}

#[async_trait]
impl SecretRepository for SqliteStore {
    async fn create_secret(&self, secret: &Secret) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO secrets (name, value, description, owners, created_by, created_at, updated_by, updated_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        )
        .bind(&secret.name)
        .bind(&secret.value)
        .bind(&secret.description)
        .bind(serde_json::to_string(&secret.owners)?)
        .bind(&secret.created_by)
        .bind(ts(secret.created_at))
        .bind(&secret.updated_by)
        .bind(ts(secret.updated_at))
        .execute(&self.pool)
        .await
        .map_err(|err| insert_error(err, &secret.name))?;
        Ok(())
    }

    async fn get_secret(&self, name: &str) -> Result<Option<Secret>, StoreError> {
        sqlx::query("SELECT * FROM secrets WHERE name = ?1")
            .bind(name)
            .fetch_optional(&self.pool)
            .await?
            .as_ref()
            .map(secret_from_row)
            .transpose()
    }

    async fn list_secrets(&self) -> Result<Vec<Secret>, StoreError> {
        sqlx::query("SELECT * FROM secrets ORDER BY name ASC")
            .fetch_all(&self.pool)
            .await?
            .iter()
            .map(secret_from_row)
            .collect()
    }

    async fn update_secret(&self, secret: &Secret) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "UPDATE secrets SET value = ?2, description = ?3, owners = ?4, updated_by = ?5, updated_at = ?6 \
             WHERE name = ?1",
        )
        .bind(&secret.name)
        .bind(&secret.value)
        .bind(&secret.description)
        .bind(serde_json::to_string(&secret.owners)?)
        .bind(&secret.updated_by)
        .bind(ts(secret.updated_at))
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn delete_secret(&self, name: &str) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM secrets WHERE name = ?1")
            .bind(name)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}
