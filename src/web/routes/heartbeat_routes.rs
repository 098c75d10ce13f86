use axum::{
    Json, Router,
    extract::{Path, State},
    routing::get,
};
use std::sync::Arc;

use crate::db::services::monitor_service::CheckOutcome;
use crate::web::{AppError, AppState};

/// Push endpoint for heartbeat monitors (cron jobs, backup scripts).
pub fn create_heartbeat_router() -> Router<Arc<AppState>> {
    Router::new().route("/{token}", get(ping).post(ping))
}

async fn ping(
    State(app_state): State<Arc<AppState>>,
    Path(token): Path<String>,
) -> Result<Json<serde_json::Value>, AppError> {
    let outcome = app_state.services.monitors.record_heartbeat_ping(&token).await?;
    let recorded = matches!(outcome, CheckOutcome::Recorded { .. });
    Ok(Json(serde_json::json!({ "success": true, "recorded": recorded })))
}
