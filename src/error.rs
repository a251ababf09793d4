use crate::quota_poller::QuotaRefreshError;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;

#[derive(Debug, Clone)]
pub struct AppError {
    pub status: StatusCode,
    pub code: String,
    pub message: String,
    pub error_type: String,
}

impl AppError {
    pub fn new(status: StatusCode, code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            status,
            code: code.into(),
            message: message.into(),
            error_type: "invalid_request_error".to_string(),
        }
    }

    pub fn internal(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, code, message).with_type("server_error")
    }

    pub fn with_type(mut self, error_type: impl Into<String>) -> Self {
        self.error_type = error_type.into();
        self
    }
}

impl From<QuotaRefreshError> for AppError {
    fn from(err: QuotaRefreshError) -> Self {
        let message = err.to_string();
        match err {
            QuotaRefreshError::AuthNotFound(_) => {
                Self::new(StatusCode::NOT_FOUND, "auth_not_found", message)
                    .with_type("not_found_error")
            }
            QuotaRefreshError::UnsupportedProvider(_) => {
                Self::new(StatusCode::BAD_REQUEST, "quota_unsupported_provider", message)
            }
            QuotaRefreshError::RuntimeOnly(_) => {
                Self::new(StatusCode::BAD_REQUEST, "auth_runtime_only", message)
            }
            QuotaRefreshError::Fetch(_) => {
                Self::new(StatusCode::BAD_GATEWAY, "quota_fetch_failed", message)
                    .with_type("upstream_error")
            }
            QuotaRefreshError::Store(_) => Self::internal("store_error", message),
        }
    }
}

#[derive(Debug, Serialize)]
struct ErrorEnvelope {
    error: ErrorBody,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    message: String,
    #[serde(rename = "type")]
    error_type: String,
    code: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorEnvelope {
            error: ErrorBody {
                message: self.message,
                error_type: self.error_type,
                code: self.code,
            },
        };
        (self.status, axum::Json(body)).into_response()
    }
}

pub type AppResult<T> = Result<T, AppError>;
