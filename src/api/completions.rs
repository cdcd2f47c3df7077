use axum::{Json, extract::State};

use crate::{
    api::types::{CompletionChoice, CompletionRequest, CompletionResponse, Usage},
    error::ServiceError,
    model::ChatMessage,
    server::AppState,
};

/// POST /v1/completions
///
/// The prompt goes through the chat template as a single user turn, so the
/// model sees the same framing as in chat.
pub async fn handler(
    State(state): State<AppState>,
    Json(request): Json<CompletionRequest>,
) -> Result<Json<CompletionResponse>, ServiceError> {
    let model = request
        .model
        .clone()
        .unwrap_or_else(|| state.config.model_name.clone());
    let config = request.sampling.resolve(&state.config.generation);

    let output = state
        .registry
        .generate(vec![ChatMessage::user(request.prompt)], config)
        .await?;

    Ok(Json(CompletionResponse {
        id: format!("cmpl-{}", uuid::Uuid::new_v4().simple()),
        object: "text_completion",
        created: chrono::Utc::now().timestamp(),
        model,
        choices: vec![CompletionChoice {
            index: 0,
            text: output.text,
            finish_reason: Some(output.finish_reason.as_str().to_string()),
        }],
        usage: Usage::new(output.prompt_tokens, output.completion_tokens),
    }))
}
