use serde::Serialize;
use sqlx::FromRow;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::auth::password::Password;

/// Privilege ordinal stored as SMALLINT.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, sqlx::Type)]
#[repr(i16)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Standard = 0,
    Admin = 1,
}

/// User record in the database.
#[derive(Debug, Clone, Serialize, FromRow)]
pub struct User {
    pub id: Uuid,
    #[serde(rename = "firstname")]
    pub first_name: String,
    #[serde(rename = "lastname")]
    pub last_name: String,
    pub username: String,
    pub email: String,                // unique, lower-cased
    #[serde(skip_serializing)]
    #[sqlx(rename = "password_hash")]
    pub password: Password,           // Argon2 hash, not exposed in JSON
    pub active: bool,
    pub role: Role,
    #[serde(skip_serializing)]
    pub version: i32,                 // optimistic concurrency marker
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

/// Fields supplied at registration.
#[derive(Debug)]
pub struct NewUser {
    pub first_name: String,
    pub last_name: String,
    pub username: String,
    pub email: String,
    pub password: Password,
}

impl User {
    /// Builds a not-yet-activated standard user at version 1.
    pub fn register(new: NewUser) -> Self {
        let now = OffsetDateTime::now_utc();
        Self {
            id: Uuid::new_v4(),
            first_name: new.first_name,
            last_name: new.last_name,
            username: new.username,
            email: new.email,
            password: new.password,
            active: false,
            role: Role::Standard,
            version: 1,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_admin(&self) -> bool {
        self.role == Role::Admin
    }
}
