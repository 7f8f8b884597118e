//! Payment processor seam
//!
//! The processor is the source of truth for "was this actually paid". The
//! engine only needs two queries from it, both behind [`PaymentProcessor`] so
//! Stripe can be swapped for a mock in tests.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};

/// Metadata keys written on checkout sessions when they are created
pub mod metadata {
    pub const USER_ID: &str = "user_id";
    pub const PRODUCT_TYPE: &str = "product_type";
    pub const PRODUCT_ID: &str = "product_id";
    /// Older sessions only carried the tier name
    pub const LEGACY_TIER: &str = "tier";
    pub const LEGACY_ADDON: &str = "addon_id";
}

/// Processor-neutral view of a checkout session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentSession {
    pub id: String,
    pub paid: bool,
    pub customer_id: Option<String>,
    pub customer_email: Option<String>,
    pub amount_total_cents: Option<i64>,
    pub currency: Option<String>,
    /// Unix seconds
    pub created: i64,
    pub metadata: HashMap<String, String>,
    pub price_ids: Vec<String>,
    pub client_reference_id: Option<String>,
}

impl PaymentSession {
    /// User id embedded at checkout creation, from metadata or the client reference
    pub fn embedded_user_id(&self) -> Option<Uuid> {
        self.metadata
            .get(metadata::USER_ID)
            .or(self.client_reference_id.as_ref())
            .and_then(|raw| Uuid::parse_str(raw.trim()).ok())
    }

    pub fn email_matches(&self, email: &str) -> bool {
        self.customer_email
            .as_deref()
            .is_some_and(|e| e.trim().eq_ignore_ascii_case(email.trim()))
    }
}

/// Filter for listing a customer's sessions
#[derive(Debug, Clone, Default)]
pub struct SessionQuery {
    pub customer_id: Option<String>,
    pub email: Option<String>,
    pub limit: u64,
}

#[async_trait]
pub trait PaymentProcessor: Send + Sync {
    /// `Ok(None)` when the processor does not know the session
    async fn retrieve_session(&self, session_id: &str) -> BillingResult<Option<PaymentSession>>;

    /// Sessions for a customer, newest first
    async fn list_sessions(&self, query: &SessionQuery) -> BillingResult<Vec<PaymentSession>>;
}

pub type SharedProcessor = Arc<dyn PaymentProcessor>;

/// Run a processor call with a deadline; elapsed maps to `ExternalQueryFailed`
pub async fn bounded<T, F>(timeout: Duration, operation: &str, fut: F) -> BillingResult<T>
where
    F: Future<Output = BillingResult<T>>,
{
    match tokio::time::timeout(timeout, fut).await {
        Ok(result) => result,
        Err(_) => {
            tracing::warn!(
                operation = %operation,
                timeout_ms = timeout.as_millis() as u64,
                "Payment processor call timed out"
            );
            Err(BillingError::ExternalQueryFailed(format!(
                "{} timed out after {:?}",
                operation, timeout
            )))
        }
    }
}

/// Stripe checkout session ids look like `cs_test_...` or `cs_live_...`
pub fn validate_session_id(session_id: &str) -> BillingResult<()> {
    let rest = session_id
        .strip_prefix("cs_test_")
        .or_else(|| session_id.strip_prefix("cs_live_"))
        .ok_or_else(|| BillingError::InvalidInput("Malformed payment session id".into()))?;

    if rest.is_empty()
        || session_id.len() > 255
        || !rest.chars().all(|c| c.is_ascii_alphanumeric())
    {
        return Err(BillingError::InvalidInput(
            "Malformed payment session id".into(),
        ));
    }
    Ok(())
}
