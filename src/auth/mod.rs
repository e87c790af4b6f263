use crate::state::AppState;
use axum::Router;

pub mod context;
mod dto;
pub mod gates;
pub mod handlers;
pub mod middleware;
pub mod password;
pub mod principal;
pub mod repo_types;
pub mod resolver;
pub mod services;
pub mod tokens;

pub(crate) use dto::{UserEnvelope, UsersEnvelope};

pub fn router() -> Router<AppState> {
    Router::new().merge(handlers::auth_routes())
}
