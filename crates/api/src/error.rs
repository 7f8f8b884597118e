//! API error type and HTTP status mapping

use axum::{
    http::{header::RETRY_AFTER, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use tierlock_billing::BillingError;

pub type ApiResult<T> = Result<T, ApiError>;

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("Authentication required")]
    Unauthorized,

    #[error("Forbidden")]
    Forbidden,

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Rate limit exceeded")]
    RateLimited { retry_after_seconds: Option<u64> },

    #[error(transparent)]
    Billing(#[from] BillingError),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl ApiError {
    fn status_and_code(&self) -> (StatusCode, &'static str) {
        match self {
            ApiError::Unauthorized => (StatusCode::UNAUTHORIZED, "unauthorized"),
            ApiError::Forbidden => (StatusCode::FORBIDDEN, "forbidden"),
            ApiError::NotFound(_) => (StatusCode::NOT_FOUND, "not_found"),
            ApiError::Validation(_) => (StatusCode::BAD_REQUEST, "validation_error"),
            ApiError::RateLimited { .. } => (StatusCode::TOO_MANY_REQUESTS, "rate_limited"),
            ApiError::Internal(_) => (StatusCode::INTERNAL_SERVER_ERROR, "internal_error"),
            ApiError::Billing(e) => match e {
                BillingError::SignatureInvalid => (StatusCode::BAD_REQUEST, "signature_invalid"),
                BillingError::SessionOwnershipUnverifiable => (StatusCode::FORBIDDEN, "forbidden"),
                BillingError::IndeterminateProduct(_) => {
                    (StatusCode::UNPROCESSABLE_ENTITY, "indeterminate_product")
                }
                BillingError::Proration(_) => (StatusCode::UNPROCESSABLE_ENTITY, "upgrade_rejected"),
                BillingError::ExternalQueryFailed(_) => {
                    (StatusCode::BAD_GATEWAY, "payment_processor_unavailable")
                }
                BillingError::SessionNotFound(_) | BillingError::NotFound(_) => {
                    (StatusCode::NOT_FOUND, "not_found")
                }
                BillingError::SessionNotPaid(_) => (StatusCode::PAYMENT_REQUIRED, "session_not_paid"),
                BillingError::InvalidInput(_) => (StatusCode::BAD_REQUEST, "validation_error"),
                BillingError::Store(s) if s.is_unavailable() => {
                    (StatusCode::SERVICE_UNAVAILABLE, "store_unavailable")
                }
                BillingError::Store(_)
                | BillingError::StoreWriteFailed(_)
                | BillingError::Config(_)
                | BillingError::Serialization(_)
                | BillingError::Internal(_) => {
                    (StatusCode::INTERNAL_SERVER_ERROR, "internal_error")
                }
            },
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code) = self.status_and_code();

        // Internal details stay in the logs
        let message = if status.is_server_error() {
            tracing::error!(error = %self, status = %status, "Request failed");
            match status {
                StatusCode::BAD_GATEWAY => "Payment processor unavailable, try again shortly".into(),
                StatusCode::SERVICE_UNAVAILABLE => "Service temporarily unavailable".into(),
                _ => "Internal server error".into(),
            }
        } else {
            self.to_string()
        };

        let mut body = json!({
            "error": code,
            "message": message,
        });
        if let ApiError::Billing(BillingError::Proration(reason)) = &self {
            body["detail"] = json!(reason);
        }

        let mut response = (status, Json(body)).into_response();
        if let ApiError::RateLimited {
            retry_after_seconds: Some(secs),
        } = self
        {
            if let Ok(value) = HeaderValue::from_str(&secs.to_string()) {
                response.headers_mut().insert(RETRY_AFTER, value);
            }
        }
        response
    }
}
