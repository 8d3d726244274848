use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use slotserve_core::lora::LoraError;
use slotserve_core::worker::{SessionError, WorkerError};

#[derive(Debug)]
pub enum ApiError {
    InvalidRequest(String),
    NotFound(String),
    RateLimited(String),
    Unavailable(String),
    Internal(String),
}

#[derive(Serialize)]
pub(crate) struct ErrorResponse {
    error: ErrorBody,
}

#[derive(Serialize)]
struct ErrorBody {
    message: String,
    r#type: &'static str,
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::RateLimited(_) => StatusCode::TOO_MANY_REQUESTS,
            ApiError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// JSON error envelope, also used for errors inside an SSE stream.
    pub(crate) fn body(self) -> ErrorResponse {
        let (error_type, message) = match self {
            ApiError::InvalidRequest(msg) => ("invalid_request_error", msg),
            ApiError::NotFound(msg) => ("not_found_error", msg),
            ApiError::RateLimited(msg) => ("rate_limit_error", msg),
            ApiError::Unavailable(msg) => ("unavailable_error", msg),
            ApiError::Internal(msg) => ("server_error", msg),
        };
        ErrorResponse {
            error: ErrorBody {
                message,
                r#type: error_type,
            },
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::warn!(status = status.as_u16(), error = ?self, "request failed");
        }
        (status, axum::Json(self.body())).into_response()
    }
}

impl From<SessionError> for ApiError {
    fn from(e: SessionError) -> Self {
        match e {
            SessionError::AdmissionRejected(_) => ApiError::RateLimited(e.to_string()),
            SessionError::EmptyPrompt | SessionError::PromptTooLong { .. } => {
                ApiError::InvalidRequest(e.to_string())
            }
            SessionError::ShuttingDown => ApiError::Unavailable(e.to_string()),
            SessionError::Evaluation { .. } | SessionError::AdapterBind { .. } => {
                ApiError::Internal(e.to_string())
            }
        }
    }
}

impl From<LoraError> for ApiError {
    fn from(e: LoraError) -> Self {
        match e {
            LoraError::AdapterLoad(_) => ApiError::Internal(e.to_string()),
            LoraError::InvalidId { .. } | LoraError::InvalidScale { .. } | LoraError::RegistryFull(_) => {
                ApiError::InvalidRequest(e.to_string())
            }
        }
    }
}

impl From<WorkerError> for ApiError {
    fn from(e: WorkerError) -> Self {
        match e {
            WorkerError::Overloaded | WorkerError::ShuttingDown => ApiError::Unavailable(e.to_string()),
            WorkerError::Spawn(_) => ApiError::Internal(e.to_string()),
        }
    }
}
