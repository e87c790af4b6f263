//! Turns a presented credential into a request [`Principal`].

use std::time::Duration;

use axum::http::HeaderValue;
use tracing::{debug, warn};

use crate::auth::{
    principal::Principal,
    repo_types::User,
    tokens::{self, Scope, TokenDigest},
};
use crate::error::ApiError;
use crate::storage::{Store, StoreError};

#[derive(Debug)]
pub enum VerifyError {
    /// Unknown, expired or wrong-scope token. Deliberately not split further.
    NotFound,
    Store(StoreError),
    Timeout(Duration),
}

/// Digest `plaintext` and look up the owner of a live `scope` token.
///
/// The plaintext is never compared directly; only digests reach the store.
pub async fn verify_token(
    store: &dyn Store,
    plaintext: &str,
    scope: Scope,
    timeout: Duration,
) -> Result<User, VerifyError> {
    if !tokens::is_well_formed(plaintext) {
        return Err(VerifyError::NotFound);
    }
    let digest = TokenDigest::of(plaintext);
    match tokio::time::timeout(timeout, store.get_user_for_token(scope, &digest)).await {
        Ok(Ok(user)) => Ok(user),
        Ok(Err(StoreError::NotFound)) => Err(VerifyError::NotFound),
        Ok(Err(e)) => Err(VerifyError::Store(e)),
        Err(_) => Err(VerifyError::Timeout(timeout)),
    }
}

/// Resolve the `Authorization` header of one request.
///
/// No header is a success yielding [`Principal::Anonymous`]. Nothing here
/// retries.
pub async fn resolve(
    store: &dyn Store,
    header: Option<&HeaderValue>,
    timeout: Duration,
) -> Result<Principal, ApiError> {
    let Some(header) = header else {
        return Ok(Principal::Anonymous);
    };

    let value = header.to_str().map_err(|_| ApiError::InvalidCredentialFormat)?;
    let token = match value.split(' ').collect::<Vec<_>>().as_slice() {
        ["Bearer", token] => *token,
        _ => return Err(ApiError::InvalidCredentialFormat),
    };

    match verify_token(store, token, Scope::Authentication, timeout).await {
        Ok(user) => {
            debug!(user_id = %user.id, "request authenticated");
            Ok(Principal::Identified(user))
        }
        Err(VerifyError::NotFound) => {
            warn!("invalid or expired token");
            Err(ApiError::InvalidOrExpiredToken)
        }
        Err(VerifyError::Store(e)) => Err(ApiError::ResolutionFailed {
            detail: format!("token lookup failed: {e}"),
        }),
        Err(VerifyError::Timeout(limit)) => Err(ApiError::ResolutionFailed {
            detail: format!("token lookup exceeded {}ms", limit.as_millis()),
        }),
    }
}
