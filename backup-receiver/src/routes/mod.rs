pub mod admin;
pub mod backup;
pub mod explorer;

use crate::state::AppState;
use axum::extract::DefaultBodyLimit;
use axum::routing::get;
use axum::{Json, Router};
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

pub fn create_router(state: Arc<AppState>) -> Router {
    let json_limit = state.config.max_json_body;

    Router::new()
        .merge(backup::router())
        .merge(explorer::router())
        .nest("/api", admin::router())
        .route("/health", get(health))
        .layer(DefaultBodyLimit::max(json_limit))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}
