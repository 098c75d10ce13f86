use axum::{
    body::Body as AxumBody,
    extract::State,
    http::{Request, header},
    middleware::Next,
    response::Response,
};
use chrono::Utc;
use std::sync::Arc;
use tracing::warn;

use crate::web::models::AuthenticatedServer;
use crate::web::{AppState, error::AppError};

/// Resolves `Authorization: Bearer <agent_token>` to its server.
pub async fn agent_auth(
    State(state): State<Arc<AppState>>,
    mut req: Request<AxumBody>,
    next: Next,
) -> Result<Response, AppError> {
    let token = req
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|header| header.to_str().ok())
        .and_then(|header| header.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|token| !token.is_empty())
        .ok_or_else(|| AppError::Unauthorized("Missing agent token".to_string()))?
        .to_string();

    let server = state
        .services
        .provisioning
        .authenticate_agent(&token, Utc::now())
        .await
        .map_err(|e| {
            warn!(error = %e, "Agent authentication failed.");
            AppError::from(e)
        })?;

    req.extensions_mut().insert(AuthenticatedServer(server));
    Ok(next.run(req).await)
}
