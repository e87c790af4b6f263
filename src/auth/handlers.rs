use axum::{
    extract::State,
    http::StatusCode,
    routing::post,
    Json, Router,
};
use tracing::instrument;

use crate::{
    auth::{
        dto::{
            ActivateRequest, AuthTokenEnvelope, LoginRequest, RegisterRequest, TokenResponse,
            UserEnvelope,
        },
        services,
    },
    error::ApiError,
    state::AppState,
};

/// Public account routes, mounted at the `Anonymous` access level.
pub fn auth_routes() -> Router<AppState> {
    Router::new()
        .route("/users", post(register))
        .route("/users/activated", post(activate))
        .route("/token/authenticate", post(create_authentication_token))
}

#[instrument(skip(state, payload))]
pub async fn register(
    State(state): State<AppState>,
    Json(payload): Json<RegisterRequest>,
) -> Result<(StatusCode, Json<UserEnvelope>), ApiError> {
    let user = services::register(&state, payload).await?;
    Ok((StatusCode::CREATED, Json(UserEnvelope { user })))
}

#[instrument(skip(state, payload))]
pub async fn activate(
    State(state): State<AppState>,
    Json(payload): Json<ActivateRequest>,
) -> Result<(StatusCode, Json<UserEnvelope>), ApiError> {
    let user = services::activate(&state, &payload.token).await?;
    Ok((StatusCode::ACCEPTED, Json(UserEnvelope { user })))
}

#[instrument(skip(state, payload))]
pub async fn create_authentication_token(
    State(state): State<AppState>,
    Json(payload): Json<LoginRequest>,
) -> Result<(StatusCode, Json<AuthTokenEnvelope>), ApiError> {
    let issued = services::login(&state, payload).await?;
    Ok((
        StatusCode::CREATED,
        Json(AuthTokenEnvelope {
            authentication_token: TokenResponse {
                expiry: issued.record.expiry,
                token: issued.plaintext,
            },
        }),
    ))
}
