use std::fmt;

use data_encoding::BASE32_NOPAD;
use rand::{rngs::OsRng, RngCore};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use thiserror::Error;
use time::{Duration, OffsetDateTime};
use tracing::debug;
use uuid::Uuid;

/// Number of random bytes behind every token.
const SECRET_LEN: usize = 16;
/// Length of the unpadded base-32 encoding of [`SECRET_LEN`] bytes.
pub const PLAINTEXT_LEN: usize = 26;

/// What a token may be used for.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Scope {
    Activation,
    Authentication,
}

impl Scope {
    pub fn as_str(&self) -> &'static str {
        match self {
            Scope::Activation => "activation",
            Scope::Authentication => "authentication",
        }
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
pub enum TokenError {
    #[error("secure random source unavailable: {0}")]
    Entropy(#[from] rand::Error),
}

/// SHA-256 of a token plaintext. The only form of a token that is stored.
#[derive(Clone, Copy)]
pub struct TokenDigest([u8; 32]);

impl TokenDigest {
    pub fn of(plaintext: &str) -> Self {
        let mut out = [0u8; 32];
        out.copy_from_slice(&Sha256::digest(plaintext.as_bytes()));
        Self(out)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl PartialEq for TokenDigest {
    fn eq(&self, other: &Self) -> bool {
        self.0.ct_eq(&other.0).into()
    }
}

impl Eq for TokenDigest {}

impl fmt::Debug for TokenDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TokenDigest({:02x}{:02x}..)", self.0[0], self.0[1])
    }
}

/// Persisted form of a token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenRecord {
    pub digest: TokenDigest,
    pub user_id: Uuid,
    pub expiry: OffsetDateTime,
    pub scope: Scope,
}

impl TokenRecord {
    pub fn is_valid_for(&self, scope: Scope, now: OffsetDateTime) -> bool {
        self.scope == scope && now < self.expiry
    }
}

/// A freshly minted token. `plaintext` goes back to the caller once and is
/// never stored; `record` is what gets persisted.
pub struct IssuedToken {
    pub plaintext: String,
    pub record: TokenRecord,
}

impl fmt::Debug for IssuedToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IssuedToken")
            .field("plaintext", &"<redacted>")
            .field("record", &self.record)
            .finish()
    }
}

/// Mint a token for `user_id` valid for `ttl` from now.
pub fn generate(user_id: Uuid, ttl: Duration, scope: Scope) -> Result<IssuedToken, TokenError> {
    let mut secret = [0u8; SECRET_LEN];
    OsRng.try_fill_bytes(&mut secret)?;

    let plaintext = BASE32_NOPAD.encode(&secret);
    let record = TokenRecord {
        digest: TokenDigest::of(&plaintext),
        user_id,
        expiry: OffsetDateTime::now_utc() + ttl,
        scope,
    };
    debug!(user_id = %user_id, scope = %scope, expiry = %record.expiry, "token generated");
    Ok(IssuedToken { plaintext, record })
}

/// Cheap shape check run before any lookup.
pub fn is_well_formed(plaintext: &str) -> bool {
    plaintext.len() == PLAINTEXT_LEN
        && plaintext
            .bytes()
            .all(|b| b.is_ascii_uppercase() || (b'2'..=b'7').contains(&b))
}
