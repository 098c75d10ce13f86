use axum::{
    Json, Router,
    extract::{Path, State},
    routing::post,
};
use std::sync::Arc;
use tracing::info;

use crate::db::services::provisioning_service::ServerFacts;
use crate::web::models::ProvisionCallbackResponse;
use crate::web::{AppError, AppState};

pub fn create_provision_router() -> Router<Arc<AppState>> {
    Router::new().route("/callback/{token}", post(provision_callback))
}

/// Called once by the install script. The provisioning token is single use.
async fn provision_callback(
    State(app_state): State<Arc<AppState>>,
    Path(token): Path<String>,
    Json(facts): Json<ServerFacts>,
) -> Result<Json<ProvisionCallbackResponse>, AppError> {
    let registration = app_state.services.provisioning.provision_callback(&token, facts).await?;
    info!(server_id = registration.server_id, status = %registration.status, "Server registered its agent.");
    Ok(Json(ProvisionCallbackResponse {
        success: true,
        agent_token: registration.agent_token,
        server_id: registration.server_id,
        saas_url: app_state.services.config.saas_url.clone(),
    }))
}
