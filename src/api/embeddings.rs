use axum::{Json, extract::State};

use crate::{
    api::types::{EmbeddingData, EmbeddingsRequest, EmbeddingsResponse, Usage},
    error::ServiceError,
    server::AppState,
};

/// POST /v1/embeddings, one vector per input in request order.
pub async fn handler(
    State(state): State<AppState>,
    Json(request): Json<EmbeddingsRequest>,
) -> Result<Json<EmbeddingsResponse>, ServiceError> {
    let model = request
        .model
        .clone()
        .unwrap_or_else(|| state.config.model_name.clone());
    let inputs = request.input.into_vec();
    if inputs.is_empty() {
        return Err(ServiceError::BadRequest("input must not be empty".into()));
    }

    let batch = state.registry.embed(inputs).await?;
    let data = batch
        .vectors
        .into_iter()
        .enumerate()
        .map(|(index, embedding)| EmbeddingData {
            object: "embedding",
            embedding,
            index: index as u32,
        })
        .collect();

    Ok(Json(EmbeddingsResponse {
        object: "list",
        data,
        model,
        usage: Usage::new(batch.prompt_tokens, 0),
    }))
}
