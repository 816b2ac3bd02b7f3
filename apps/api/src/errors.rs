use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

/// Application-level error type.
/// Implements `IntoResponse` so Axum handlers can return `Result<T, AppError>`.
#[derive(Debug, Error)]
pub enum AppError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Invalid tier: {0}")]
    InvalidTier(String),

    #[error("User already has an active subscription")]
    DuplicateActiveSubscription,

    #[error("Entitlement exhausted")]
    EntitlementExhausted,

    #[error("Insufficient credits")]
    InsufficientCredits,

    #[error("Webhook signature invalid")]
    WebhookSignatureInvalid,

    #[error("Webhook processing failed: {0}")]
    WebhookProcessingFailed(String),

    #[error("Concurrent modification")]
    ConcurrentModification,

    #[error("Store call timed out")]
    StoreTimeout,

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Internal server error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl AppError {
    /// Stable machine-readable code returned in the error body.
    pub fn code(&self) -> &'static str {
        match self {
            AppError::NotFound(_) => "NOT_FOUND",
            AppError::Validation(_) => "VALIDATION_ERROR",
            AppError::InvalidTier(_) => "INVALID_TIER",
            AppError::DuplicateActiveSubscription => "DUPLICATE_ACTIVE_SUBSCRIPTION",
            AppError::EntitlementExhausted => "ENTITLEMENT_EXHAUSTED",
            AppError::InsufficientCredits => "INSUFFICIENT_CREDITS",
            AppError::WebhookSignatureInvalid => "WEBHOOK_SIGNATURE_INVALID",
            AppError::WebhookProcessingFailed(_) => "WEBHOOK_PROCESSING_FAILED",
            AppError::ConcurrentModification => "CONCURRENT_MODIFICATION",
            AppError::StoreTimeout => "STORE_TIMEOUT",
            AppError::Database(_) => "DATABASE_ERROR",
            AppError::Internal(_) => "INTERNAL_ERROR",
        }
    }

    /// Transient failures the caller may retry as-is.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            AppError::ConcurrentModification
                | AppError::StoreTimeout
                | AppError::WebhookProcessingFailed(_)
                | AppError::Database(_)
        )
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, msg.clone()),
            AppError::Validation(msg) => (StatusCode::BAD_REQUEST, msg.clone()),
            AppError::InvalidTier(msg) => (StatusCode::BAD_REQUEST, msg.clone()),
            AppError::DuplicateActiveSubscription => (
                StatusCode::CONFLICT,
                "User already has an active subscription".to_string(),
            ),
            AppError::EntitlementExhausted => (
                StatusCode::PAYMENT_REQUIRED,
                "No analyses remaining. Upgrade your plan or purchase credits".to_string(),
            ),
            AppError::InsufficientCredits => (
                StatusCode::PAYMENT_REQUIRED,
                "No credits remaining. Purchase a credit pack to continue".to_string(),
            ),
            AppError::WebhookSignatureInvalid => (
                StatusCode::BAD_REQUEST,
                "Invalid webhook signature".to_string(),
            ),
            AppError::WebhookProcessingFailed(msg) => {
                tracing::error!("Webhook processing failed: {msg}");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Webhook could not be processed".to_string(),
                )
            }
            AppError::ConcurrentModification => (
                StatusCode::CONFLICT,
                "The resource was modified concurrently, retry the request".to_string(),
            ),
            AppError::StoreTimeout => {
                tracing::warn!("Entitlement store timed out");
                (
                    StatusCode::SERVICE_UNAVAILABLE,
                    "Billing is temporarily unavailable".to_string(),
                )
            }
            AppError::Database(e) => {
                tracing::error!("Database error: {e}");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "A database error occurred".to_string(),
                )
            }
            AppError::Internal(e) => {
                tracing::error!("Internal error: {e:?}");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "An internal server error occurred".to_string(),
                )
            }
        };

        let body = Json(json!({
            "error": {
                "code": self.code(),
                "message": message
            }
        }));

        (status, body).into_response()
    }
}
