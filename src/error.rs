use axum::{
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;
use tracing::{error, warn};

const SERVER_ERROR_MESSAGE: &str = "the server encountered a problem and could not process your request";

/// Every rejection the API can produce.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("malformed authorization header, expected 'Bearer <token>'")]
    InvalidCredentialFormat,
    #[error("invalid or missing authentication token")]
    InvalidOrExpiredToken,
    #[error("you must be authenticated to access this resource")]
    AuthenticationRequired,
    #[error("invalid authentication credentials")]
    InvalidCredentials,
    #[error("your user account must be activated to access this resource")]
    AccountInactive,
    #[error("your user account doesn't have the necessary permissions to access this resource")]
    InsufficientRole,
    #[error("a user with this email address already exists")]
    DuplicateEmail,
    #[error("unable to update the record due to an edit conflict, please try again")]
    EditConflict,
    #[error("{field}: {message}")]
    Validation { field: &'static str, message: String },
    /// Backend fault while resolving a credential. `detail` is logged only.
    #[error("credential resolution failed: {detail}")]
    ResolutionFailed { detail: String },
    /// Any other server-side fault. `detail` is logged only.
    #[error("internal error: {detail}")]
    Internal { detail: String },
}

#[derive(Serialize)]
struct ErrorBody {
    error: bool,
    code: &'static str,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    field: Option<&'static str>,
}

impl ApiError {
    pub fn validation(field: &'static str, message: impl Into<String>) -> Self {
        ApiError::Validation {
            field,
            message: message.into(),
        }
    }

    pub fn internal(detail: impl std::fmt::Display) -> Self {
        ApiError::Internal {
            detail: detail.to_string(),
        }
    }

    pub fn error_code(&self) -> &'static str {
        match self {
            ApiError::InvalidCredentialFormat => "invalid_credential_format",
            ApiError::InvalidOrExpiredToken => "invalid_or_expired_token",
            ApiError::AuthenticationRequired => "authentication_required",
            ApiError::InvalidCredentials => "invalid_credentials",
            ApiError::AccountInactive => "account_inactive",
            ApiError::InsufficientRole => "insufficient_role",
            ApiError::DuplicateEmail => "duplicate_email",
            ApiError::EditConflict => "edit_conflict",
            ApiError::Validation { .. } => "validation_failed",
            ApiError::ResolutionFailed { .. } => "resolution_failed",
            ApiError::Internal { .. } => "internal_error",
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            ApiError::InvalidCredentialFormat
            | ApiError::InvalidOrExpiredToken
            | ApiError::AuthenticationRequired
            | ApiError::InvalidCredentials => StatusCode::UNAUTHORIZED,
            ApiError::AccountInactive | ApiError::InsufficientRole => StatusCode::FORBIDDEN,
            ApiError::DuplicateEmail | ApiError::EditConflict => StatusCode::CONFLICT,
            ApiError::Validation { .. } => StatusCode::UNPROCESSABLE_ENTITY,
            ApiError::ResolutionFailed { .. } | ApiError::Internal { .. } => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    fn challenges_bearer(&self) -> bool {
        matches!(
            self,
            ApiError::InvalidCredentialFormat
                | ApiError::InvalidOrExpiredToken
                | ApiError::AuthenticationRequired
        )
    }

    /// Message safe to show the caller.
    fn public_message(&self) -> String {
        match self {
            ApiError::Validation { message, .. } => message.clone(),
            ApiError::ResolutionFailed { .. } | ApiError::Internal { .. } => {
                SERVER_ERROR_MESSAGE.to_string()
            }
            other => other.to_string(),
        }
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(e: anyhow::Error) -> Self {
        ApiError::Internal {
            detail: format!("{e:#}"),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            error!(code = self.error_code(), error = %self, "request failed");
        } else {
            warn!(code = self.error_code(), %status, "request rejected");
        }

        let field = match &self {
            ApiError::Validation { field, .. } => Some(*field),
            _ => None,
        };
        let body = Json(ErrorBody {
            error: true,
            code: self.error_code(),
            message: self.public_message(),
            field,
        });

        let mut response = (status, body).into_response();
        if self.challenges_bearer() {
            response
                .headers_mut()
                .insert(header::WWW_AUTHENTICATE, HeaderValue::from_static("Bearer"));
        }
        response
    }
}
