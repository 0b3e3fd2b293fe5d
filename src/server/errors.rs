use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
};
use log::error;
use thiserror::Error;

pub type ApiResult<T> = Result<T, ApiError>;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{resource} not found")]
    NotFound { resource: &'static str },
    #[error("Invalid {0}")]
    Invalid(&'static str),
    #[error("Too many requests")]
    RateLimited,
    #[error("Missing or invalid CSRF token")]
    CsrfRejected,
    #[error("Unknown internal error: {0}")]
    Unknown(String),
}

impl ApiError {
    fn as_status_code(&self) -> StatusCode {
        match self {
            Self::NotFound { resource: _ } => StatusCode::NOT_FOUND,
            Self::Invalid(_) => StatusCode::BAD_REQUEST,
            Self::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            Self::CsrfRejected => StatusCode::FORBIDDEN,
            Self::Unknown(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.as_status_code();

        // Log server errors when they happen
        if status.as_u16() >= 500 {
            error!("Request failed: {}", self);
            return (status, "Internal Server Error".to_string()).into_response();
        }

        (status, self.to_string()).into_response()
    }
}
