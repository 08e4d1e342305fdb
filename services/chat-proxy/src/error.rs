//! Client-facing errors
//!
//! Every failure a client can observe maps to one `ApiError`, which renders
//! as the OpenAI `{"error":{"message","type","code"}}` envelope either as a
//! JSON response or as an in-stream error chunk.

use crate::openai::{ErrorBody, ErrorDetail};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ApiError {
    #[error("Invalid request parameters")]
    InvalidRequest,

    #[error("Model {0} not supported")]
    InvalidModel(String),

    #[error("max_tokens {requested} exceeds the {limit} limit of model {model}")]
    InvalidMaxTokens {
        model: String,
        requested: i64,
        limit: u32,
    },

    #[error("Forbidden")]
    Forbidden,

    #[error("Service Unavailable")]
    UpstreamServer,

    #[error("upstream request failed: {0}")]
    Upstream(String),

    #[error("All cookies are temporarily unavailable.")]
    CookiesExhausted,

    #[error("{0}")]
    Internal(String),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::InvalidModel(_) | ApiError::InvalidMaxTokens { .. } => {
                StatusCode::BAD_REQUEST
            }
            ApiError::CookiesExhausted => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::InvalidRequest
            | ApiError::Forbidden
            | ApiError::UpstreamServer
            | ApiError::Upstream(_)
            | ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// OpenAI error `type`.
    pub fn kind(&self) -> &'static str {
        match self {
            ApiError::InvalidRequest => "request_error",
            ApiError::InvalidModel(_) | ApiError::InvalidMaxTokens { .. } => {
                "invalid_request_error"
            }
            ApiError::Forbidden | ApiError::UpstreamServer | ApiError::Upstream(_) => {
                "upstream_error"
            }
            ApiError::CookiesExhausted => "service_unavailable",
            ApiError::Internal(_) => "internal_error",
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            ApiError::InvalidRequest => "request_error",
            ApiError::InvalidModel(_) => "invalid_model",
            ApiError::InvalidMaxTokens { .. } => "invalid_max_tokens",
            ApiError::Forbidden => "forbidden",
            ApiError::UpstreamServer => "server_error",
            ApiError::Upstream(_) => "upstream_error",
            ApiError::CookiesExhausted => "cookies_exhausted",
            ApiError::Internal(_) => "internal_error",
        }
    }

    pub fn body(&self) -> ErrorBody {
        ErrorBody {
            error: ErrorDetail {
                message: self.to_string(),
                kind: self.kind().into(),
                code: self.code().into(),
            },
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status(), axum::Json(self.body())).into_response()
    }
}
