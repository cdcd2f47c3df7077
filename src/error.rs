use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

/// Startup configuration problems. These abort the process before the
/// listener is bound.
#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("only one quantization method can be chosen for inference")]
    ConflictingQuantization,
    #[error("quantization is unavailable on CPU")]
    QuantizationOnCpu,
    #[error("invalid --alpha value '{0}': expected a float or 'auto'")]
    InvalidAlpha(String),
    #[error("invalid listen address: {0}")]
    InvalidAddress(String),
    #[error("path not found: {0}")]
    MissingPath(String),
}

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("invalid request: {0}")]
    BadRequest(String),
    #[error("tokenizer error: {0}")]
    Tokenizer(String),
    #[error("chat template error: {0}")]
    Template(String),
    #[error("model execution failed: {0}")]
    Inference(String),
    #[error("adapter error: {0}")]
    Adapter(String),
    #[error("quantization error: {0}")]
    Quantization(String),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("other: {0}")]
    Other(String),
}

impl From<tch::TchError> for ServiceError {
    fn from(err: tch::TchError) -> Self {
        ServiceError::Inference(err.to_string())
    }
}

impl From<minijinja::Error> for ServiceError {
    fn from(err: minijinja::Error) -> Self {
        ServiceError::Template(err.to_string())
    }
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        let status = match self {
            ServiceError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ServiceError::Tokenizer(_)
            | ServiceError::Template(_)
            | ServiceError::Inference(_)
            | ServiceError::Adapter(_)
            | ServiceError::Quantization(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ServiceError::Config(_) | ServiceError::Io(_) | ServiceError::Other(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };

        if status.is_server_error() {
            tracing::error!(error = %self, "request failed");
        }

        let body = serde_json::json!({
            "error": self.to_string(),
        });

        (status, axum::Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bad_request_maps_to_400() {
        let response = ServiceError::BadRequest("nope".into()).into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn inference_failure_maps_to_500() {
        let response = ServiceError::Inference("boom".into()).into_response();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
