//! Registration, activation and login flows.

use lazy_static::lazy_static;
use regex::Regex;
use tracing::{error, info, warn};

use crate::auth::{
    dto::{LoginRequest, RegisterRequest},
    password::{hash_blocking, matches_blocking, Password},
    repo_types::{NewUser, User},
    resolver::{verify_token, VerifyError},
    tokens::{self, IssuedToken, Scope},
};
use crate::error::ApiError;
use crate::mailer::Notification;
use crate::state::AppState;
use crate::storage::StoreError;

const MIN_PASSWORD_LEN: usize = 8;
const MAX_PASSWORD_LEN: usize = 128;
const MAX_NAME_LEN: usize = 64;

pub(crate) fn is_valid_email(email: &str) -> bool {
    lazy_static! {
        static ref EMAIL_RE: Regex = Regex::new(r"^[^@\s]+@[^@\s]+\.[^@\s]+$").unwrap();
    }
    EMAIL_RE.is_match(email)
}

/// Hash verified when the email is unknown, so that both login failures
/// cost one argon2 verification.
fn dummy_password() -> Option<&'static Password> {
    lazy_static! {
        static ref DUMMY: Option<Password> = Password::set("tokengate-dummy-password").ok();
    }
    DUMMY.as_ref()
}

pub(crate) fn normalize_email(email: &str) -> String {
    email.trim().to_lowercase()
}

fn validate_registration(req: &RegisterRequest) -> Result<(), ApiError> {
    if req.username.trim().is_empty() {
        return Err(ApiError::validation("username", "must be provided"));
    }
    if req.username.chars().count() > MAX_NAME_LEN {
        return Err(ApiError::validation("username", "must not be more than 64 characters long"));
    }
    if !is_valid_email(&req.email) {
        return Err(ApiError::validation("email", "must be a valid email address"));
    }
    let len = req.password.chars().count();
    if len < MIN_PASSWORD_LEN {
        return Err(ApiError::validation("password", "must be at least 8 characters long"));
    }
    if len > MAX_PASSWORD_LEN {
        return Err(ApiError::validation("password", "must not be more than 128 characters long"));
    }
    Ok(())
}

/// Mint a token of `scope` for `user` and persist its digest.
async fn issue_token(
    state: &AppState,
    user: &User,
    ttl: time::Duration,
    scope: Scope,
) -> Result<IssuedToken, ApiError> {
    let issued = tokens::generate(user.id, ttl, scope).map_err(ApiError::internal)?;
    state
        .store
        .insert_token(&issued.record)
        .await
        .map_err(ApiError::internal)?;
    Ok(issued)
}

/// Create an inactive user, issue an activation token and hand it to the
/// mailer in the background.
pub async fn register(state: &AppState, mut req: RegisterRequest) -> Result<User, ApiError> {
    req.email = normalize_email(&req.email);
    validate_registration(&req)?;

    let password = hash_blocking(req.password).await.map_err(ApiError::internal)?;
    let user = User::register(NewUser {
        first_name: req.first_name.trim().to_string(),
        last_name: req.last_name.trim().to_string(),
        username: req.username.trim().to_string(),
        email: req.email,
        password,
    });

    let user = match state.store.insert_user(&user).await {
        Ok(u) => u,
        Err(StoreError::DuplicateKey) => {
            warn!(email = %user.email, "email already registered");
            return Err(ApiError::DuplicateEmail);
        }
        Err(e) => return Err(ApiError::internal(e)),
    };

    let ttl = state.config.tokens.activation_ttl;
    let token = match issue_token(state, &user, ttl, Scope::Activation).await {
        Ok(t) => t,
        Err(e) => {
            // without an activation token the account could never be used,
            // and the email would stay taken
            if let Err(rollback) = state.store.delete_user(user.id).await {
                error!(error = %rollback, user_id = %user.id, "rolling back registration failed");
            }
            return Err(e);
        }
    };

    let notification = Notification {
        recipient: user.email.clone(),
        template: "user_welcome",
        user_id: user.id,
        username: user.username.clone(),
        activation_token: token.plaintext,
        token_ttl: ttl,
    };
    let mailer = state.mailer.clone();
    state.tasks.spawn("activation_email", async move {
        if let Err(e) = mailer.send(&notification).await {
            error!(error = %e, user_id = %notification.user_id, "sending activation email failed");
        }
    });

    info!(user_id = %user.id, email = %user.email, "user registered");
    Ok(user)
}

/// Consume an activation token: mark the user active and purge every
/// activation token they hold.
pub async fn activate(state: &AppState, plaintext: &str) -> Result<User, ApiError> {
    let plaintext = plaintext.trim();
    let timeout = state.config.database.timeout;

    let mut user = match verify_token(state.store.as_ref(), plaintext, Scope::Activation, timeout).await {
        Ok(u) => u,
        Err(VerifyError::NotFound) => {
            return Err(ApiError::validation("token", "invalid or expired activation token"));
        }
        Err(VerifyError::Store(e)) => return Err(ApiError::internal(e)),
        Err(VerifyError::Timeout(_)) => return Err(ApiError::internal("activation lookup timed out")),
    };

    user.active = true;
    let user = match state.store.update_user(&user).await {
        Ok(u) => u,
        Err(StoreError::EditConflict) => return Err(ApiError::EditConflict),
        Err(e) => return Err(ApiError::internal(e)),
    };

    let purged = state
        .store
        .delete_all_tokens(Scope::Activation, user.id)
        .await
        .map_err(ApiError::internal)?;

    info!(user_id = %user.id, purged, "user activated");
    Ok(user)
}

/// Check credentials and issue an authentication token.
///
/// The password is verified before the activation flag so that the
/// inactive-account rejection only reaches callers holding the password.
pub async fn login(state: &AppState, mut req: LoginRequest) -> Result<IssuedToken, ApiError> {
    req.email = normalize_email(&req.email);
    if !is_valid_email(&req.email) {
        return Err(ApiError::validation("email", "must be a valid email address"));
    }
    if req.password.is_empty() {
        return Err(ApiError::validation("password", "must be provided"));
    }

    let user = match state.store.get_user_by_email(&req.email).await {
        Ok(u) => u,
        Err(StoreError::NotFound) => {
            if let Some(dummy) = dummy_password() {
                let _ = matches_blocking(dummy.clone(), req.password).await;
            }
            warn!(email = %req.email, "login unknown email");
            return Err(ApiError::InvalidCredentials);
        }
        Err(e) => return Err(ApiError::internal(e)),
    };

    let ok = matches_blocking(user.password.clone(), req.password)
        .await
        .map_err(ApiError::internal)?;
    if !ok {
        warn!(user_id = %user.id, "login invalid password");
        return Err(ApiError::InvalidCredentials);
    }

    if !user.active {
        warn!(user_id = %user.id, "login on inactive account");
        return Err(ApiError::AccountInactive);
    }

    let token = issue_token(state, &user, state.config.tokens.authentication_ttl, Scope::Authentication).await?;
    info!(user_id = %user.id, "user logged in");
    Ok(token)
}
