//! Error taxonomy (SPEC_FULL.md §7), modeled the way the teacher crate modeled
//! `ProviderError` — a single `thiserror` enum with a short machine-readable
//! `code()` and an HTTP status mapping, since errors here cross the HTTP
//! boundary instead of staying inside one process.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    // Input errors (4xx, client-recoverable)
    #[error("invalid JSON body: {0}")]
    InvalidJson(String),
    #[error("messages must not be empty")]
    MissingMessages,
    #[error("invalid role: {0}")]
    InvalidRole(String),
    #[error("invalid message part: {0}")]
    InvalidPart(String),
    #[error("unknown provider: {0}")]
    UnknownProvider(String),
    #[error("unsupported mode: {0}")]
    UnsupportedMode(String),

    // Transient provider errors, surfaced only once the adapter's retry budget is exhausted
    #[error("provider timed out: {0}")]
    ProviderTimeout(String),
    #[error("provider unavailable: {0}")]
    ProviderUnavailable(String),
    #[error("provider rate limited: {0}")]
    ProviderRateLimited(String),

    // Fatal provider errors (5xx)
    #[error("provider authentication failed: {0}")]
    ProviderAuth(String),
    #[error("provider rejected the request: {0}")]
    ProviderInvalidRequest(String),
    #[error("unknown provider error: {0}")]
    ProviderUnknown(String),

    // Tool errors
    #[error("tool call timed out")]
    ToolTimeout,
    #[error("tool invocation failed: {0}")]
    ToolInvocationFailed(String),
    #[error("invalid tool input: {0}")]
    ToolInvalidInput(String),
    #[error("duplicate tool registered: {0}")]
    DuplicateTool(String),

    // Runner errors (5xx)
    #[error("stop condition evaluation failed: {0}")]
    StopConditionError(String),
    #[error("finalizer could not produce usable text: {0}")]
    FinalizerError(String),
}

impl AppError {
    /// Short machine-readable error code, carried in `ChatResponse`/`ext.error`.
    pub fn code(&self) -> &'static str {
        match self {
            AppError::InvalidJson(_) => "invalid_json",
            AppError::MissingMessages => "missing_messages",
            AppError::InvalidRole(_) => "invalid_role",
            AppError::InvalidPart(_) => "invalid_part",
            AppError::UnknownProvider(_) => "unknown_provider",
            AppError::UnsupportedMode(_) => "unsupported_mode",
            AppError::ProviderTimeout(_) => "provider_timeout",
            AppError::ProviderUnavailable(_) => "provider_unavailable",
            AppError::ProviderRateLimited(_) => "provider_rate_limited",
            AppError::ProviderAuth(_) => "provider_auth",
            AppError::ProviderInvalidRequest(_) => "provider_invalid_request",
            AppError::ProviderUnknown(_) => "provider_unknown",
            AppError::ToolTimeout => "tool_timeout",
            AppError::ToolInvocationFailed(_) => "tool_invocation_failed",
            AppError::ToolInvalidInput(_) => "tool_invalid_input",
            AppError::DuplicateTool(_) => "duplicate_tool",
            AppError::StopConditionError(_) => "stop_condition_error",
            AppError::FinalizerError(_) => "finalizer_error",
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            AppError::InvalidJson(_)
            | AppError::MissingMessages
            | AppError::InvalidRole(_)
            | AppError::InvalidPart(_)
            | AppError::UnknownProvider(_)
            | AppError::UnsupportedMode(_) => StatusCode::BAD_REQUEST,
            AppError::ProviderRateLimited(_) => StatusCode::TOO_MANY_REQUESTS,
            AppError::ProviderAuth(_) => StatusCode::UNAUTHORIZED,
            AppError::ProviderInvalidRequest(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = json!({
            "error": {
                "code": self.code(),
                "message": self.to_string(),
            }
        });
        (status, axum::Json(body)).into_response()
    }
}
