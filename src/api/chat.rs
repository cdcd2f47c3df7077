use axum::{
    Json,
    extract::State,
    response::{IntoResponse, Response},
};

use crate::{
    api::{
        sse::{SSE_DONE, format_sse_data, sse_response},
        types::{
            ChatChoice, ChatChunkChoice, ChatCompletionChunk, ChatCompletionRequest,
            ChatCompletionResponse, DeltaMessage, Usage,
        },
    },
    error::ServiceError,
    model::{ChatMessage, Role},
    server::AppState,
};

/// POST /v1/chat/completions
///
/// With `stream: true` the response is an SSE stream of
/// `chat.completion.chunk` objects: role, content deltas, a `stop` chunk,
/// then `[DONE]`.
pub async fn handler(
    State(state): State<AppState>,
    Json(request): Json<ChatCompletionRequest>,
) -> Result<Response, ServiceError> {
    let model = request
        .model
        .clone()
        .unwrap_or_else(|| state.config.model_name.clone());
    let config = request.sampling.resolve(&state.config.generation);
    let messages = request.messages.into_messages();
    if messages.is_empty() {
        return Err(ServiceError::BadRequest("messages must not be empty".into()));
    }

    if request.stream {
        let rx = state.registry.generate_stream(messages, config)?;
        return Ok(stream_response(model, rx).into_response());
    }

    let output = state.registry.generate(messages, config).await?;
    let response = ChatCompletionResponse {
        id: completion_id(),
        object: "chat.completion",
        created: chrono::Utc::now().timestamp(),
        model,
        choices: vec![ChatChoice {
            index: 0,
            message: ChatMessage::assistant(output.text),
            finish_reason: Some(output.finish_reason.as_str().to_string()),
        }],
        usage: Usage::new(output.prompt_tokens, output.completion_tokens),
    };
    Ok(Json(response).into_response())
}

fn completion_id() -> String {
    format!("chatcmpl-{}", uuid::Uuid::new_v4().simple())
}

/// Shared envelope for every chunk of one streamed completion.
struct ChunkFactory {
    id: String,
    created: i64,
    model: String,
}

impl ChunkFactory {
    fn chunk(&self, delta: DeltaMessage, finish_reason: Option<&str>) -> Option<String> {
        format_sse_data(&ChatCompletionChunk {
            id: self.id.clone(),
            object: "chat.completion.chunk",
            created: self.created,
            model: self.model.clone(),
            choices: vec![ChatChunkChoice {
                index: 0,
                delta,
                finish_reason: finish_reason.map(str::to_string),
            }],
        })
    }
}

fn stream_response(
    model: String,
    mut rx: tokio::sync::mpsc::Receiver<crate::model::StreamEvent>,
) -> impl IntoResponse {
    let factory = ChunkFactory {
        id: completion_id(),
        created: chrono::Utc::now().timestamp(),
        model,
    };

    let stream = async_stream::stream! {
        let role = DeltaMessage { role: Some(Role::Assistant), content: None };
        if let Some(data) = factory.chunk(role, None) {
            yield data;
        }

        while let Some(event) = rx.recv().await {
            match event {
                Ok(fragment) => {
                    let delta = DeltaMessage { role: None, content: Some(fragment) };
                    if let Some(data) = factory.chunk(delta, None) {
                        yield data;
                    }
                }
                Err(err) => {
                    tracing::warn!(error = %err, id = %factory.id, "stream ended by generation error");
                    return;
                }
            }
        }

        if let Some(data) = factory.chunk(DeltaMessage::default(), Some("stop")) {
            yield data;
        }
        yield SSE_DONE.to_string();
    };

    sse_response(stream)
}
