use async_trait::async_trait;
use thiserror::Error;
use uuid::Uuid;

use crate::auth::{
    repo_types::User,
    tokens::{Scope, TokenDigest, TokenRecord},
};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("record not found")]
    NotFound,
    #[error("duplicate key value")]
    DuplicateKey,
    #[error("edit conflict")]
    EditConflict,
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// Persistence used by the auth pipeline. Implementations must be safe to
/// share across concurrent requests.
#[async_trait]
pub trait Store: Send + Sync {
    /// Fails with [`StoreError::DuplicateKey`] if the email is taken.
    async fn insert_user(&self, user: &User) -> Result<User, StoreError>;

    async fn get_user_by_email(&self, email: &str) -> Result<User, StoreError>;

    /// User owning an unexpired token of `scope` whose digest is `digest`.
    /// Unknown, expired and wrong-scope tokens all yield [`StoreError::NotFound`].
    async fn get_user_for_token(&self, scope: Scope, digest: &TokenDigest) -> Result<User, StoreError>;

    /// Writes `user` if its version is still current and returns the stored
    /// row with the version bumped by one.
    async fn update_user(&self, user: &User) -> Result<User, StoreError>;

    async fn list_users(&self) -> Result<Vec<User>, StoreError>;

    /// Removes the user and, through the foreign key, their tokens.
    async fn delete_user(&self, id: Uuid) -> Result<(), StoreError>;

    /// Also prunes tokens, of any owner, that have already expired.
    async fn insert_token(&self, token: &TokenRecord) -> Result<(), StoreError>;

    /// Removes every token of `scope` owned by `user_id`; returns how many.
    async fn delete_all_tokens(&self, scope: Scope, user_id: Uuid) -> Result<u64, StoreError>;
}
