//! Billing error types

use thiserror::Error;
use tierlock_shared::StoreError;

pub type BillingResult<T> = Result<T, BillingError>;

#[derive(Debug, Error)]
pub enum BillingError {
    /// Webhook payload failed HMAC verification; nothing was read from it
    #[error("Webhook signature invalid")]
    SignatureInvalid,

    /// The session cannot be tied to the calling user
    #[error("Payment session ownership could not be verified")]
    SessionOwnershipUnverifiable,

    /// The paid session does not map to any catalog product
    #[error("Could not determine purchased product: {0}")]
    IndeterminateProduct(String),

    /// Entitlement record write failed after the grant lock was taken
    #[error("Entitlement store write failed: {0}")]
    StoreWriteFailed(String),

    /// The payment processor timed out or returned an error
    #[error("Payment processor query failed: {0}")]
    ExternalQueryFailed(String),

    #[error("Payment session not found: {0}")]
    SessionNotFound(String),

    #[error("Payment session not paid: {0}")]
    SessionNotPaid(String),

    #[error("Upgrade rejected: {0}")]
    Proration(#[from] crate::proration::ProrationError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl BillingError {
    /// Errors that the soft-failing convergence paths turn into "no entitlement found"
    pub fn is_soft(&self) -> bool {
        matches!(
            self,
            BillingError::ExternalQueryFailed(_)
                | BillingError::SessionNotFound(_)
                | BillingError::SessionNotPaid(_)
        )
    }
}

impl From<stripe::StripeError> for BillingError {
    fn from(err: stripe::StripeError) -> Self {
        BillingError::ExternalQueryFailed(err.to_string())
    }
}
