//! OpenAI-compatible HTTP surface.

pub mod chat;
pub mod completions;
pub mod embeddings;
pub mod sse;
pub mod types;

use axum::{
    Json, Router,
    extract::State,
    routing::{get, post},
};

use crate::{
    api::types::{ModelCard, ModelList},
    server::AppState,
};

/// Routes mounted under `/v1`.
pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/chat/completions", post(chat::handler))
        .route("/completions", post(completions::handler))
        .route("/embeddings", post(embeddings::handler))
        .route("/models", get(models))
}

/// GET /v1/models
async fn models(State(state): State<AppState>) -> Json<ModelList> {
    let metadata = state.registry.metadata();
    Json(ModelList {
        object: "list",
        data: vec![ModelCard {
            id: metadata.name.clone(),
            object: "model",
            created: state.started_at,
            owned_by: "owner",
            device: metadata.device.clone(),
            dtype: metadata.dtype.clone(),
            quantization: metadata.quantization.clone(),
            adapter: metadata.adapter.clone(),
            vocab_size: metadata.vocab_size,
        }],
    })
}
