use axum::{
    extract::{Request, State},
    http::{header, HeaderValue},
    middleware::Next,
    response::{IntoResponse, Response},
};

use crate::auth::{context::attach_principal, resolver::resolve};
use crate::state::AppState;

/// Outermost auth layer. Resolves the `Authorization` header once and
/// attaches the resulting principal for the gates and handlers below.
pub async fn authenticate(State(state): State<AppState>, mut req: Request, next: Next) -> Response {
    let resolved = resolve(
        state.store.as_ref(),
        req.headers().get(header::AUTHORIZATION),
        state.config.database.timeout,
    )
    .await;

    let mut response = match resolved {
        Ok(principal) => {
            attach_principal(&mut req, principal);
            next.run(req).await
        }
        Err(rejection) => rejection.into_response(),
    };
    response
        .headers_mut()
        .append(header::VARY, HeaderValue::from_static("Authorization"));
    response
}
