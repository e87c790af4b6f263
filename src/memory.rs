use std::collections::HashMap;

use async_trait::async_trait;
use time::OffsetDateTime;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::auth::{
    repo_types::User,
    tokens::{Scope, TokenDigest, TokenRecord},
};
use crate::storage::{Store, StoreError};

/// In-process [`Store`] for local development and tests.
#[derive(Default)]
pub struct MemoryStore {
    inner: RwLock<Inner>,
}

#[derive(Default)]
struct Inner {
    users: HashMap<Uuid, User>,
    tokens: Vec<TokenRecord>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn insert_user(&self, user: &User) -> Result<User, StoreError> {
        let mut inner = self.inner.write().await;
        if inner.users.values().any(|u| u.email == user.email) {
            return Err(StoreError::DuplicateKey);
        }
        inner.users.insert(user.id, user.clone());
        Ok(user.clone())
    }

    async fn get_user_by_email(&self, email: &str) -> Result<User, StoreError> {
        let inner = self.inner.read().await;
        inner
            .users
            .values()
            .find(|u| u.email == email)
            .cloned()
            .ok_or(StoreError::NotFound)
    }

    async fn get_user_for_token(&self, scope: Scope, digest: &TokenDigest) -> Result<User, StoreError> {
        let now = OffsetDateTime::now_utc();
        let inner = self.inner.read().await;
        let token = inner
            .tokens
            .iter()
            .find(|t| t.digest == *digest && t.is_valid_for(scope, now))
            .ok_or(StoreError::NotFound)?;
        inner
            .users
            .get(&token.user_id)
            .cloned()
            .ok_or(StoreError::NotFound)
    }

    async fn update_user(&self, user: &User) -> Result<User, StoreError> {
        let mut inner = self.inner.write().await;
        if inner
            .users
            .values()
            .any(|u| u.id != user.id && u.email == user.email)
        {
            return Err(StoreError::DuplicateKey);
        }
        let stored = inner.users.get_mut(&user.id).ok_or(StoreError::EditConflict)?;
        if stored.version != user.version {
            return Err(StoreError::EditConflict);
        }
        let mut updated = user.clone();
        updated.version += 1;
        updated.updated_at = OffsetDateTime::now_utc();
        *stored = updated.clone();
        Ok(updated)
    }

    async fn list_users(&self) -> Result<Vec<User>, StoreError> {
        let inner = self.inner.read().await;
        let mut users: Vec<User> = inner.users.values().cloned().collect();
        users.sort_by_key(|u| u.created_at);
        Ok(users)
    }

    async fn delete_user(&self, id: Uuid) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        inner.users.remove(&id).ok_or(StoreError::NotFound)?;
        inner.tokens.retain(|t| t.user_id != id);
        Ok(())
    }

    async fn insert_token(&self, token: &TokenRecord) -> Result<(), StoreError> {
        let now = OffsetDateTime::now_utc();
        let mut inner = self.inner.write().await;
        if !inner.users.contains_key(&token.user_id) {
            // mirrors the foreign key on tokens.user_id
            return Err(StoreError::NotFound);
        }
        inner.tokens.retain(|t| t.expiry > now);
        inner.tokens.push(token.clone());
        Ok(())
    }

    async fn delete_all_tokens(&self, scope: Scope, user_id: Uuid) -> Result<u64, StoreError> {
        let mut inner = self.inner.write().await;
        let before = inner.tokens.len();
        inner
            .tokens
            .retain(|t| !(t.scope == scope && t.user_id == user_id));
        Ok((before - inner.tokens.len()) as u64)
    }
}
