use std::sync::Arc;

use axum::{Router, routing::get};
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use crate::{api, config::AppConfig, model::ModelRegistry};

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub registry: Arc<ModelRegistry>,
    /// Unix timestamp the router was built at, reported by `/v1/models`.
    pub started_at: i64,
}

pub fn build_router(config: Arc<AppConfig>, registry: Arc<ModelRegistry>) -> Router {
    let state = AppState {
        started_at: chrono::Utc::now().timestamp(),
        registry,
        config,
    };

    Router::new()
        .route("/health", get(health))
        .nest("/v1", api::routes())
        .with_state(state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

async fn health() -> &'static str {
    "ok"
}
