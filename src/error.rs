// Shared error response body for the API

use chrono::Utc;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

/// Consistent error response structure
///
/// Every error the API returns uses this JSON shape, giving clients both a
/// machine-readable `error_code` and a human-readable `message`.
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct ErrorResponse {
    /// Machine-readable error code (e.g., "VALIDATION_ERROR", "UNAUTHENTICATED")
    #[schema(example = "UNAUTHENTICATED")]
    pub error_code: String,

    /// Human-readable error message
    #[schema(example = "Invalid or expired token")]
    pub message: String,

    /// ISO 8601 timestamp of when the error occurred
    pub timestamp: String,
}

impl ErrorResponse {
    pub fn new(error_code: &str, message: impl Into<String>) -> Self {
        Self {
            error_code: error_code.to_string(),
            message: message.into(),
            timestamp: Utc::now().to_rfc3339(),
        }
    }
}
