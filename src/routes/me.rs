use axum::Json;
use tracing::{error, instrument};

use crate::{
    auth::{context::CurrentPrincipal, principal::Principal, UserEnvelope},
    error::ApiError,
};

/// Mounted behind the `Authenticated` gate, so the principal is identified.
#[instrument(skip_all)]
pub async fn me_route(
    CurrentPrincipal(principal): CurrentPrincipal,
) -> Result<Json<UserEnvelope>, ApiError> {
    match principal {
        Principal::Identified(user) => Ok(Json(UserEnvelope { user })),
        Principal::Anonymous => {
            error!("me route reached without an identified principal");
            Err(ApiError::AuthenticationRequired)
        }
    }
}
