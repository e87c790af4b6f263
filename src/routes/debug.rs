use axum::{extract::State, Json};
use serde::Serialize;
use time::OffsetDateTime;

use crate::metrics::MetricsSnapshot;
use crate::state::AppState;

#[derive(Debug, Serialize)]
pub struct DebugVars {
    pub version: &'static str,
    pub timestamp: i64,
    pub background_tasks: usize,
    #[serde(flatten)]
    pub requests: MetricsSnapshot,
}

pub async fn debug_vars(State(state): State<AppState>) -> Json<DebugVars> {
    Json(DebugVars {
        version: env!("CARGO_PKG_VERSION"),
        timestamp: OffsetDateTime::now_utc().unix_timestamp(),
        background_tasks: state.tasks.in_flight(),
        requests: state.metrics.snapshot(),
    })
}
