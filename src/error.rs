use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

use crate::types::UserId;

#[derive(Error, Debug)]
pub enum AppError {
    #[error("Authentication required")]
    Unauthorized,

    #[error("Invalid credentials")]
    InvalidCredentials,

    #[error("Invalid OAuth state: {0}")]
    InvalidState(String),

    #[error("Token exchange failed: {0}")]
    TokenExchangeError(String),

    #[error("Token refresh failed: {0}")]
    TokenRefreshError(String),

    #[error("No HubSpot access token available for user {0}")]
    MissingAccessToken(UserId),

    #[error("Invalid webhook signature")]
    SignatureInvalid,

    #[error("Provider error: {0}")]
    ProviderError(String),

    #[error("Cache error: {0}")]
    Cache(String),

    #[error("Rate limit exceeded: {0}")]
    RateLimited(String),

    #[error("Circuit open: {0}")]
    CircuitOpen(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Request error: {0}")]
    RequestError(#[from] reqwest::Error),

    #[error("Internal server error")]
    InternalError(#[from] anyhow::Error),
}

impl From<redis::RedisError> for AppError {
    fn from(err: redis::RedisError) -> Self {
        AppError::Cache(err.to_string())
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, error_message) = match &self {
            AppError::Unauthorized | AppError::InvalidCredentials => {
                (StatusCode::UNAUTHORIZED, self.to_string())
            }
            AppError::InvalidState(_) => {
                (StatusCode::BAD_REQUEST, "Invalid OAuth state".to_string())
            }
            AppError::TokenExchangeError(_) | AppError::TokenRefreshError(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Authentication failed".to_string(),
            ),
            AppError::MissingAccessToken(_) => (
                StatusCode::FORBIDDEN,
                "Not authorized with HubSpot".to_string(),
            ),
            AppError::SignatureInvalid => (StatusCode::UNAUTHORIZED, self.to_string()),
            AppError::ProviderError(_) | AppError::RequestError(_) => {
                (StatusCode::BAD_GATEWAY, "Provider error".to_string())
            }
            AppError::RateLimited(_) => (
                StatusCode::TOO_MANY_REQUESTS,
                "Rate limit exceeded. Please try again later.".to_string(),
            ),
            AppError::CircuitOpen(_) => (
                StatusCode::SERVICE_UNAVAILABLE,
                "Service temporarily unavailable".to_string(),
            ),
            AppError::Validation(msg) => (StatusCode::BAD_REQUEST, msg.clone()),
            AppError::Conflict(msg) => (StatusCode::CONFLICT, msg.clone()),
            AppError::Cache(_) | AppError::InternalError(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Internal server error".to_string(),
            ),
        };

        if status.is_server_error() {
            tracing::error!("{}", self);
        }

        let body = Json(json!({
            "error": error_message
        }));

        (status, body).into_response()
    }
}

pub type Result<T> = std::result::Result<T, AppError>;
