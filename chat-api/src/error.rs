use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use chat_core::ChatError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error(transparent)]
    Chat(#[from] ChatError),

    #[error("Invalid request: {0}")]
    BadRequest(String),

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Not available: {0}")]
    NotAvailable(String),
}

pub type ApiResult<T> = Result<T, ApiError>;

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message, retryable) = match &self {
            ApiError::Chat(e) => {
                let status = match e {
                    ChatError::InvalidMessage
                    | ChatError::NoActiveConversation
                    | ChatError::InvalidParticipants(_) => StatusCode::BAD_REQUEST,
                    ChatError::ParticipantMismatch { .. } => StatusCode::FORBIDDEN,
                    ChatError::NotFound(_) => StatusCode::NOT_FOUND,
                    ChatError::TransportUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
                    ChatError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
                    ChatError::PartialWriteInconsistency { .. } | ChatError::Store(_) => {
                        StatusCode::INTERNAL_SERVER_ERROR
                    }
                };
                let message = match e {
                    ChatError::Store(inner) => {
                        tracing::error!("Store error: {}", inner);
                        "Internal server error".to_string()
                    }
                    other => other.to_string(),
                };
                (status, message, e.is_retryable())
            }
            ApiError::BadRequest(_) => (StatusCode::BAD_REQUEST, self.to_string(), false),
            ApiError::Forbidden(_) => (StatusCode::FORBIDDEN, self.to_string(), false),
            ApiError::NotAvailable(_) => (StatusCode::NOT_FOUND, self.to_string(), false),
        };

        let body = serde_json::json!({
            "error": message,
            "retryable": retryable,
        });

        (status, axum::Json(body)).into_response()
    }
}
