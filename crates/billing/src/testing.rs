//! Test support: an in-memory payment processor and fixture builders

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::catalog::Product;
use crate::error::{BillingError, BillingResult};
use crate::processor::{metadata, PaymentProcessor, PaymentSession, SessionQuery};

/// Processor double holding sessions in memory
#[derive(Default)]
pub struct MockProcessor {
    sessions: Mutex<Vec<PaymentSession>>,
    latency: Mutex<Option<Duration>>,
    failing: AtomicBool,
    calls: AtomicUsize,
}

impl MockProcessor {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn add_session(&self, session: PaymentSession) {
        self.sessions.lock().await.push(session);
    }

    /// Every call sleeps this long before answering
    pub async fn set_latency(&self, latency: Duration) {
        *self.latency.lock().await = Some(latency);
    }

    /// Every call returns `ExternalQueryFailed`
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    async fn before_call(&self) -> BillingResult<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let latency = *self.latency.lock().await;
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
        if self.failing.load(Ordering::SeqCst) {
            return Err(BillingError::ExternalQueryFailed("mock processor failure".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl PaymentProcessor for MockProcessor {
    async fn retrieve_session(&self, session_id: &str) -> BillingResult<Option<PaymentSession>> {
        self.before_call().await?;
        Ok(self
            .sessions
            .lock()
            .await
            .iter()
            .find(|s| s.id == session_id)
            .cloned())
    }

    async fn list_sessions(&self, query: &SessionQuery) -> BillingResult<Vec<PaymentSession>> {
        self.before_call().await?;
        let mut found: Vec<PaymentSession> = self
            .sessions
            .lock()
            .await
            .iter()
            .filter(|s| {
                let by_customer = query.customer_id.is_some() && s.customer_id == query.customer_id;
                let by_email = query.email.as_deref().is_some_and(|e| s.email_matches(e));
                by_customer || by_email
            })
            .cloned()
            .collect();
        found.sort_by(|a, b| b.created.cmp(&a.created));
        if query.limit > 0 {
            found.truncate(query.limit as usize);
        }
        Ok(found)
    }
}

/// A paid checkout session for `product`, owned by `user_id` via metadata
pub fn paid_session(session_id: &str, user_id: Uuid, product: Product) -> PaymentSession {
    let mut meta = HashMap::new();
    meta.insert(metadata::USER_ID.to_string(), user_id.to_string());
    meta.insert(metadata::PRODUCT_TYPE.to_string(), product.product_type().to_string());
    meta.insert(metadata::PRODUCT_ID.to_string(), product.product_id().to_string());

    PaymentSession {
        id: session_id.to_string(),
        paid: true,
        customer_id: None,
        customer_email: None,
        amount_total_cents: Some(product.list_price()),
        currency: Some("usd".into()),
        created: 1_700_000_000,
        metadata: meta,
        price_ids: Vec::new(),
        client_reference_id: None,
    }
}

/// `Stripe-Signature` header value for `payload`
pub fn sign_payload(payload: &str, secret: &str, timestamp: i64) -> String {
    let mut mac = match Hmac::<Sha256>::new_from_slice(secret.as_bytes()) {
        Ok(mac) => mac,
        Err(_) => return String::new(),
    };
    mac.update(format!("{}.{}", timestamp, payload).as_bytes());
    format!(
        "t={},v1={}",
        timestamp,
        hex::encode(mac.finalize().into_bytes())
    )
}
