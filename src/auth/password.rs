use std::fmt;

use argon2::{
    password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString},
    Algorithm, Argon2, Params, Version,
};
use rand::rngs::OsRng;
use thiserror::Error;
use tracing::error;

// Cost parameters are fixed at build time. Release builds target roughly
// 100ms per verification on commodity hardware.
#[cfg(not(test))]
const M_COST_KIB: u32 = 19 * 1024;
#[cfg(not(test))]
const T_COST: u32 = 2;
#[cfg(test)]
const M_COST_KIB: u32 = 1024;
#[cfg(test)]
const T_COST: u32 = 1;
const P_COST: u32 = 1;

#[derive(Debug, Error)]
pub enum PasswordError {
    #[error("password hashing failed: {0}")]
    Hash(String),
    #[error("stored password hash is malformed: {0}")]
    Malformed(String),
    #[error("password worker failed: {0}")]
    Worker(#[from] tokio::task::JoinError),
}

/// Argon2id hash of a user's password in PHC string form.
///
/// Only the derived hash is ever held here; the plaintext lives for the
/// duration of [`Password::set`] or [`Password::matches`] and no longer.
#[derive(Clone, PartialEq, Eq, sqlx::Type)]
#[sqlx(transparent)]
pub struct Password(String);

impl Password {
    /// Hash `plain` with a fresh random salt.
    pub fn set(plain: &str) -> Result<Self, PasswordError> {
        let salt = SaltString::generate(&mut OsRng);
        let hash = hasher()?
            .hash_password(plain.as_bytes(), &salt)
            .map_err(|e| {
                error!(error = %e, "argon2 hash_password error");
                PasswordError::Hash(e.to_string())
            })?
            .to_string();
        Ok(Self(hash))
    }

    /// Wraps an already-encoded hash. Rows loaded from storage decode
    /// through `sqlx::Type` instead.
    #[cfg(test)]
    pub fn from_hash(hash: impl Into<String>) -> Self {
        Self(hash.into())
    }

    pub fn as_hash(&self) -> &str {
        &self.0
    }

    /// `Ok(false)` on an ordinary mismatch. Errors only when the stored
    /// hash cannot be parsed.
    pub fn matches(&self, plain: &str) -> Result<bool, PasswordError> {
        let parsed = PasswordHash::new(&self.0).map_err(|e| {
            error!(error = %e, "argon2 parse hash error");
            PasswordError::Malformed(e.to_string())
        })?;
        // The verifier reads the cost parameters from the PHC string itself.
        match Argon2::default().verify_password(plain.as_bytes(), &parsed) {
            Ok(()) => Ok(true),
            Err(argon2::password_hash::Error::Password) => Ok(false),
            Err(e) => Err(PasswordError::Malformed(e.to_string())),
        }
    }
}

impl fmt::Debug for Password {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Password(<redacted>)")
    }
}

fn hasher() -> Result<Argon2<'static>, PasswordError> {
    let params = Params::new(M_COST_KIB, T_COST, P_COST, None)
        .map_err(|e| PasswordError::Hash(e.to_string()))?;
    Ok(Argon2::new(Algorithm::Argon2id, Version::V0x13, params))
}

/// Runs [`Password::set`] on the blocking pool.
pub async fn hash_blocking(plain: String) -> Result<Password, PasswordError> {
    tokio::task::spawn_blocking(move || Password::set(&plain)).await?
}

/// Runs [`Password::matches`] on the blocking pool.
pub async fn matches_blocking(password: Password, plain: String) -> Result<bool, PasswordError> {
    tokio::task::spawn_blocking(move || password.matches(&plain)).await?
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_and_verify_roundtrip() {
        let password = "Secur3P@ssw0rd!";
        let hash = Password::set(password).expect("hashing should succeed");
        assert!(hash.matches(password).expect("verify should succeed"));
    }

    #[test]
    fn verify_rejects_wrong_password() {
        let hash = Password::set("correct-horse-battery-staple").expect("hashing should succeed");
        assert!(!hash.matches("wrong-password").expect("verify should not error"));
        assert!(!hash.matches("").expect("verify should not error"));
    }

    #[test]
    fn verify_errors_on_malformed_hash() {
        let err = Password::from_hash("not-a-valid-hash")
            .matches("anything")
            .unwrap_err();
        assert!(matches!(err, PasswordError::Malformed(_)));
    }

    #[test]
    fn same_password_gets_distinct_salts() {
        let a = Password::set("secret123").unwrap();
        let b = Password::set("secret123").unwrap();
        assert_ne!(a.as_hash(), b.as_hash());
        assert!(a.matches("secret123").unwrap());
        assert!(b.matches("secret123").unwrap());
    }

    #[test]
    fn hash_never_exposes_plaintext() {
        let hash = Password::set("hunter2hunter2").unwrap();
        assert!(hash.as_hash().starts_with("$argon2id$"));
        assert!(!hash.as_hash().contains("hunter2hunter2"));
        assert_eq!(format!("{hash:?}"), "Password(<redacted>)");
    }

    #[tokio::test]
    async fn blocking_helpers_agree_with_sync_api() {
        let hash = hash_blocking("s3cret-pass".into()).await.unwrap();
        assert!(matches_blocking(hash.clone(), "s3cret-pass".into()).await.unwrap());
        assert!(!matches_blocking(hash, "other-pass".into()).await.unwrap());
    }
}
