use axum::{
    Json, Router,
    extract::{Path, State},
    routing::post,
};
use std::sync::Arc;

use crate::web::models::ConfirmResponse;
use crate::web::{AppError, AppState};

pub fn create_firewall_router() -> Router<Arc<AppState>> {
    Router::new().route("/confirm/{token}", post(confirm_rule))
}

async fn confirm_rule(
    State(app_state): State<Arc<AppState>>,
    Path(token): Path<String>,
) -> Result<Json<ConfirmResponse>, AppError> {
    let rule = app_state.services.firewall.confirm(&token).await?;
    Ok(Json(ConfirmResponse {
        confirmed: true,
        rule_id: rule.id,
    }))
}
