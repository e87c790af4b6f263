use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use sqlx::{postgres::PgPoolOptions, PgPool};
use time::OffsetDateTime;
use tracing::debug;
use uuid::Uuid;

use crate::auth::{
    repo_types::User,
    tokens::{Scope, TokenDigest, TokenRecord},
};
use crate::config::DatabaseConfig;
use crate::storage::{Store, StoreError};

const USER_COLUMNS: &str = "id, first_name, last_name, username, email, password_hash, \
                            active, role, version, created_at, updated_at";

/// [`Store`] backed by PostgreSQL. Every call checks a connection out of the
/// pool for the duration of one statement.
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub async fn connect(cfg: &DatabaseConfig) -> anyhow::Result<Self> {
        let url = cfg
            .url
            .as_deref()
            .context("DATABASE_URL is required for the postgres store")?;
        let pool = PgPoolOptions::new()
            .max_connections(cfg.max_connections)
            .acquire_timeout(cfg.timeout)
            .idle_timeout(Duration::from_secs(10 * 60))
            .connect(url)
            .await
            .context("connect to database")?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn classify(e: sqlx::Error) -> StoreError {
    if let sqlx::Error::Database(db) = &e {
        if db.is_unique_violation() {
            return StoreError::DuplicateKey;
        }
    }
    match e {
        sqlx::Error::RowNotFound => StoreError::NotFound,
        other => StoreError::Database(other),
    }
}

#[async_trait]
impl Store for PgStore {
    async fn insert_user(&self, user: &User) -> Result<User, StoreError> {
        let query = format!(
            r#"
            INSERT INTO users (id, first_name, last_name, username, email, password_hash, active, role, version, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            RETURNING {USER_COLUMNS}
            "#
        );
        let row = sqlx::query_as::<_, User>(&query)
            .bind(user.id)
            .bind(&user.first_name)
            .bind(&user.last_name)
            .bind(&user.username)
            .bind(&user.email)
            .bind(user.password.as_hash())
            .bind(user.active)
            .bind(user.role)
            .bind(user.version)
            .bind(user.created_at)
            .bind(user.updated_at)
            .fetch_one(&self.pool)
            .await
            .map_err(classify)?;
        debug!(user_id = %row.id, "user inserted");
        Ok(row)
    }

    async fn get_user_by_email(&self, email: &str) -> Result<User, StoreError> {
        let query = format!("SELECT {USER_COLUMNS} FROM users WHERE email = $1");
        sqlx::query_as::<_, User>(&query)
            .bind(email)
            .fetch_optional(&self.pool)
            .await
            .map_err(classify)?
            .ok_or(StoreError::NotFound)
    }

    async fn get_user_for_token(&self, scope: Scope, digest: &TokenDigest) -> Result<User, StoreError> {
        sqlx::query_as::<_, User>(
            r#"
            SELECT u.id, u.first_name, u.last_name, u.username, u.email, u.password_hash,
                   u.active, u.role, u.version, u.created_at, u.updated_at
            FROM users u
            INNER JOIN tokens t ON u.id = t.user_id
            WHERE t.hash = $1
              AND t.scope = $2
              AND t.expiry > $3
            "#,
        )
        .bind(digest.as_bytes().as_slice())
        .bind(scope.as_str())
        .bind(OffsetDateTime::now_utc())
        .fetch_optional(&self.pool)
        .await
        .map_err(classify)?
        .ok_or(StoreError::NotFound)
    }

    async fn update_user(&self, user: &User) -> Result<User, StoreError> {
        let query = format!(
            r#"
            UPDATE users
            SET first_name = $1, last_name = $2, username = $3, email = $4,
                password_hash = $5, active = $6, role = $7,
                version = version + 1, updated_at = now()
            WHERE id = $8 AND version = $9
            RETURNING {USER_COLUMNS}
            "#
        );
        sqlx::query_as::<_, User>(&query)
            .bind(&user.first_name)
            .bind(&user.last_name)
            .bind(&user.username)
            .bind(&user.email)
            .bind(user.password.as_hash())
            .bind(user.active)
            .bind(user.role)
            .bind(user.id)
            .bind(user.version)
            .fetch_optional(&self.pool)
            .await
            .map_err(classify)?
            .ok_or(StoreError::EditConflict)
    }

    async fn list_users(&self) -> Result<Vec<User>, StoreError> {
        let query = format!("SELECT {USER_COLUMNS} FROM users ORDER BY created_at");
        sqlx::query_as::<_, User>(&query)
            .fetch_all(&self.pool)
            .await
            .map_err(classify)
    }

    async fn delete_user(&self, id: Uuid) -> Result<(), StoreError> {
        let result = sqlx::query("DELETE FROM users WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(classify)?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    async fn insert_token(&self, token: &TokenRecord) -> Result<(), StoreError> {
        let pruned = sqlx::query("DELETE FROM tokens WHERE expiry <= now()")
            .execute(&self.pool)
            .await
            .map_err(classify)?
            .rows_affected();
        if pruned > 0 {
            debug!(pruned, "expired tokens pruned");
        }

        sqlx::query(
            r#"
            INSERT INTO tokens (hash, user_id, expiry, scope)
            VALUES ($1, $2, $3, $4)
            "#,
        )
        .bind(token.digest.as_bytes().as_slice())
        .bind(token.user_id)
        .bind(token.expiry)
        .bind(token.scope.as_str())
        .execute(&self.pool)
        .await
        .map_err(classify)?;
        Ok(())
    }

    async fn delete_all_tokens(&self, scope: Scope, user_id: Uuid) -> Result<u64, StoreError> {
        let result = sqlx::query("DELETE FROM tokens WHERE scope = $1 AND user_id = $2")
            .bind(scope.as_str())
            .bind(user_id)
            .execute(&self.pool)
            .await
            .map_err(classify)?;
        Ok(result.rows_affected())
    }
}
