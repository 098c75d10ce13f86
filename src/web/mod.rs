use axum::{
    Json, Router,
    http::Method,
    middleware as axum_middleware,
    routing::get,
};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::server::core_services::CoreServices;
use crate::version::VERSION;
use crate::web::{middleware::agent_auth, routes::*};

pub use error::AppError;

pub mod error;
pub mod middleware;
pub mod models;
pub mod routes;

#[derive(Clone)]
pub struct AppState {
    pub services: CoreServices,
}

async fn health_check_handler() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok", "version": VERSION }))
}

pub fn create_axum_router(services: CoreServices) -> Router {
    let app_state = Arc::new(AppState { services });

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(vec![Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers(Any);

    Router::new()
        .route("/api/health", get(health_check_handler))
        .nest(
            "/agent",
            agent_routes::create_agent_router()
                .route_layer(axum_middleware::from_fn_with_state(app_state.clone(), agent_auth::agent_auth)),
        )
        .nest("/provision", provision_routes::create_provision_router())
        .nest("/firewall", firewall_routes::create_firewall_router())
        .nest("/heartbeat", heartbeat_routes::create_heartbeat_router())
        .with_state(app_state)
        .layer(TraceLayer::new_for_http())
        .layer(cors)
}
