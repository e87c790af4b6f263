use axum::{extract::State, Json};
use tracing::{info, instrument};

use crate::{
    auth::{context::CurrentPrincipal, UsersEnvelope},
    error::ApiError,
    state::AppState,
};

/// Admin listing of every account.
#[instrument(skip_all)]
pub async fn list_users(
    State(state): State<AppState>,
    CurrentPrincipal(principal): CurrentPrincipal,
) -> Result<Json<UsersEnvelope>, ApiError> {
    let users = state.store.list_users().await.map_err(ApiError::internal)?;
    if let Some(admin) = principal.user() {
        info!(admin_id = %admin.id, count = users.len(), "users listed");
    }
    Ok(Json(UsersEnvelope { users }))
}
