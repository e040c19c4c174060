use ai_relay::InferenceFailure;
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use chat_api::ErrorBody;
use thiserror::Error;
use tracing::error;

/// Every way a request can fail, mapped onto one HTTP status each.
///
/// `NotFound` covers both "does not exist" and "belongs to someone else";
/// callers can never tell the two apart.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0}")]
    Validation(String),

    /// Shared by unknown email and wrong password.
    #[error("Invalid email or password")]
    InvalidCredentials,

    #[error("Authentication required")]
    Unauthorized,

    #[error("{0} not found")]
    NotFound(&'static str),

    #[error("{0}")]
    Conflict(String),

    #[error("Too many attempts, try again later")]
    RateLimited,

    #[error(transparent)]
    Inference(#[from] InferenceFailure),

    #[error("storage failure: {0}")]
    Store(String),
}

impl ApiError {
    pub fn validation(msg: impl Into<String>) -> Self {
        ApiError::Validation(msg.into())
    }

    fn code(&self) -> &'static str {
        match self {
            ApiError::Validation(_) => "validation_error",
            ApiError::InvalidCredentials => "invalid_credentials",
            ApiError::Unauthorized => "unauthorized",
            ApiError::NotFound(_) => "not_found",
            ApiError::Conflict(_) => "conflict",
            ApiError::RateLimited => "rate_limited",
            ApiError::Inference(f) if f.timed_out => "inference_timeout",
            ApiError::Inference(_) => "inference_failed",
            ApiError::Store(_) => "server_error",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::Validation(_) | ApiError::InvalidCredentials => StatusCode::BAD_REQUEST,
            ApiError::Unauthorized => StatusCode::UNAUTHORIZED,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Conflict(_) => StatusCode::CONFLICT,
            ApiError::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            ApiError::Inference(f) if f.timed_out => StatusCode::GATEWAY_TIMEOUT,
            ApiError::Inference(_) => StatusCode::BAD_GATEWAY,
            ApiError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<rusqlite::Error> for ApiError {
    fn from(e: rusqlite::Error) -> Self {
        ApiError::Store(e.to_string())
    }
}

impl From<r2d2::Error> for ApiError {
    fn from(e: r2d2::Error) -> Self {
        ApiError::Store(e.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let message = match &self {
            ApiError::Store(detail) => {
                error!(%detail, "storage failure");
                "Server error. Please try again later.".to_string()
            }
            other => other.to_string(),
        };
        let body = ErrorBody {
            error: self.code().into(),
            message,
        };
        (self.status(), Json(body)).into_response()
    }
}
