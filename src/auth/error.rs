// Authentication and authorization error types

use axum::{
    extract::rejection::JsonRejection,
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use tracing::{debug, error};

use crate::error::ErrorResponse;

/// Authentication and authorization error types
///
/// Every failure the auth pipeline can produce. Lower layers (storage, hashing,
/// signing) carry their internal detail in the variant; that detail is logged
/// but never sent to the client.
#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    // Caller-correctable input problems
    #[error("Validation error: {0}")]
    ValidationError(String),

    // Authentication failures
    #[error("Invalid credentials")]
    InvalidCredentials,
    #[error("Missing authorization header")]
    MissingAuth,
    #[error("Malformed authorization header")]
    MalformedAuth,
    #[error("Invalid token")]
    InvalidToken,
    #[error("Token has expired")]
    TokenExpired,
    #[error("Invalid refresh token")]
    InvalidRefreshToken,
    #[error("Refresh token not found")]
    RefreshTokenNotFound,

    // Authorization failures
    /// Authenticated, but the claims lack the required role or permission
    #[error("Forbidden: requires {required}")]
    Forbidden { required: String },

    #[error("{0} already exists")]
    DuplicateUser(&'static str),
    #[error("{0} not found")]
    NotFound(&'static str),
    #[error("Rate limit exceeded")]
    RateLimited,

    // Internal failures
    #[error("Storage error: {0}")]
    StorageError(String),
    #[error("Password hashing error: {0}")]
    HashingError(String),
    #[error("Token signing error: {0}")]
    SigningError(String),
    #[error("Operation timed out: {0}")]
    Timeout(&'static str),
}

impl AuthError {
    /// Get the HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            AuthError::ValidationError(_) => StatusCode::BAD_REQUEST,
            AuthError::InvalidCredentials
            | AuthError::MissingAuth
            | AuthError::MalformedAuth
            | AuthError::InvalidToken
            | AuthError::TokenExpired
            | AuthError::InvalidRefreshToken
            | AuthError::RefreshTokenNotFound => StatusCode::UNAUTHORIZED,
            AuthError::Forbidden { .. } => StatusCode::FORBIDDEN,
            AuthError::DuplicateUser(_) => StatusCode::CONFLICT,
            AuthError::NotFound(_) => StatusCode::NOT_FOUND,
            AuthError::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            AuthError::Timeout(_) => StatusCode::SERVICE_UNAVAILABLE,
            AuthError::StorageError(_)
            | AuthError::HashingError(_)
            | AuthError::SigningError(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Machine-readable error code sent to clients
    pub fn error_code(&self) -> &'static str {
        match self {
            AuthError::ValidationError(_) => "VALIDATION_ERROR",
            AuthError::InvalidCredentials
            | AuthError::MissingAuth
            | AuthError::MalformedAuth
            | AuthError::InvalidToken
            | AuthError::TokenExpired
            | AuthError::InvalidRefreshToken
            | AuthError::RefreshTokenNotFound => "UNAUTHENTICATED",
            AuthError::Forbidden { .. } => "FORBIDDEN",
            AuthError::DuplicateUser(_) => "CONFLICT",
            AuthError::NotFound(_) => "NOT_FOUND",
            AuthError::RateLimited => "RATE_LIMITED",
            AuthError::Timeout(_) => "TIMEOUT",
            AuthError::StorageError(_)
            | AuthError::HashingError(_)
            | AuthError::SigningError(_) => "INTERNAL_ERROR",
        }
    }

    /// Get a descriptive error message for this error
    /// This message is safe to send to clients (no sensitive data)
    pub fn error_message(&self) -> String {
        match self {
            AuthError::ValidationError(msg) => msg.clone(),
            AuthError::InvalidCredentials => "Invalid username or password".to_string(),
            AuthError::MissingAuth => "Authorization header required".to_string(),
            AuthError::MalformedAuth => "Invalid authorization header format".to_string(),
            // Expired and forged tokens are indistinguishable to the caller
            AuthError::InvalidToken | AuthError::TokenExpired => {
                "Invalid or expired token".to_string()
            }
            AuthError::InvalidRefreshToken | AuthError::RefreshTokenNotFound => {
                "Invalid or expired refresh token".to_string()
            }
            AuthError::Forbidden { .. } => "Insufficient permissions".to_string(),
            AuthError::DuplicateUser(field) => format!("{} already exists", field),
            AuthError::NotFound(resource) => format!("{} not found", resource),
            AuthError::RateLimited => "Rate limit exceeded".to_string(),
            AuthError::Timeout(_) => "Service temporarily unavailable".to_string(),
            AuthError::StorageError(_)
            | AuthError::HashingError(_)
            | AuthError::SigningError(_) => "Internal server error".to_string(),
        }
    }

    /// True for every variant surfaced to clients as "unauthenticated"
    pub fn is_unauthenticated(&self) -> bool {
        self.status_code() == StatusCode::UNAUTHORIZED
    }
}

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        match &self {
            AuthError::StorageError(_)
            | AuthError::HashingError(_)
            | AuthError::SigningError(_) => error!("Auth internal failure: {}", self),
            AuthError::Timeout(op) => error!(operation = *op, "Auth operation timed out"),
            AuthError::Forbidden { required } => debug!(required = %required, "Forbidden"),
            AuthError::RateLimited => debug!("Request rejected by rate limiter"),
            AuthError::ValidationError(msg) => debug!("Validation error: {}", msg),
            other if other.is_unauthenticated() => debug!("Authentication failed: {}", other),
            other => debug!("Auth error: {}", other),
        }

        let status = self.status_code();
        let body = ErrorResponse::new(self.error_code(), self.error_message());

        (status, Json(body)).into_response()
    }
}

impl From<sqlx::Error> for AuthError {
    fn from(err: sqlx::Error) -> Self {
        AuthError::StorageError(err.to_string())
    }
}

impl From<JsonRejection> for AuthError {
    fn from(rejection: JsonRejection) -> Self {
        debug!(detail = %rejection.body_text(), "Rejected request body");
        let message = match rejection {
            JsonRejection::JsonSyntaxError(_) => "Request body is not valid JSON",
            JsonRejection::JsonDataError(_) => {
                "Request body is missing required fields or has invalid values"
            }
            JsonRejection::MissingJsonContentType(_) => {
                "Expected request with `Content-Type: application/json`"
            }
            _ => "Request body could not be read",
        };
        AuthError::ValidationError(message.to_string())
    }
}

impl From<validator::ValidationErrors> for AuthError {
    fn from(errors: validator::ValidationErrors) -> Self {
        AuthError::ValidationError(errors.to_string())
    }
}
