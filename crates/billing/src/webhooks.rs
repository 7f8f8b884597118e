//! Stripe webhook handling
//!
//! Only a completed checkout grants anything. Subscription lifecycle events are
//! logged and ignored (one-time purchases only), refunds and disputes are
//! recorded for operator follow-up.

use std::collections::HashMap;
use std::sync::Arc;

use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use subtle::ConstantTimeEq;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::audit::{AuditAction, AuditLogEntry};
use crate::convergence::GrantEngine;
use crate::error::{BillingError, BillingResult};
use crate::processor::{metadata, PaymentSession};

type HmacSha256 = Hmac<Sha256>;

/// Signatures older (or further in the future) than this are rejected
pub const SIGNATURE_TOLERANCE_SECS: i64 = 300;

/// The parts of a Stripe event envelope we read
#[derive(Debug, Clone, Deserialize)]
pub struct WebhookEvent {
    pub id: String,
    #[serde(rename = "type")]
    pub type_: String,
    #[serde(default)]
    pub created: i64,
    pub data: WebhookEventData,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WebhookEventData {
    pub object: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct CheckoutSessionObject {
    id: String,
    #[serde(default)]
    payment_status: Option<String>,
    #[serde(default)]
    customer: Option<serde_json::Value>,
    #[serde(default)]
    customer_email: Option<String>,
    #[serde(default)]
    customer_details: Option<CustomerDetails>,
    #[serde(default)]
    amount_total: Option<i64>,
    #[serde(default)]
    currency: Option<String>,
    #[serde(default)]
    created: i64,
    #[serde(default)]
    metadata: Option<HashMap<String, String>>,
    #[serde(default)]
    client_reference_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CustomerDetails {
    #[serde(default)]
    email: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChargeObject {
    id: String,
    #[serde(default)]
    customer: Option<serde_json::Value>,
    #[serde(default)]
    amount_refunded: i64,
    #[serde(default)]
    metadata: Option<HashMap<String, String>>,
}

/// Expandable id fields arrive either as a bare string or an object with an id
fn expandable_id(value: &Option<serde_json::Value>) -> Option<String> {
    match value {
        Some(serde_json::Value::String(id)) => Some(id.clone()),
        Some(serde_json::Value::Object(obj)) => obj
            .get("id")
            .and_then(|id| id.as_str())
            .map(str::to_string),
        _ => None,
    }
}

impl From<CheckoutSessionObject> for PaymentSession {
    fn from(obj: CheckoutSessionObject) -> Self {
        let customer_id = expandable_id(&obj.customer);
        PaymentSession {
            paid: obj.payment_status.as_deref() == Some("paid"),
            customer_id,
            customer_email: obj
                .customer_details
                .and_then(|d| d.email)
                .or(obj.customer_email),
            amount_total_cents: obj.amount_total,
            currency: obj.currency,
            created: obj.created,
            metadata: obj.metadata.unwrap_or_default(),
            price_ids: Vec::new(),
            client_reference_id: obj.client_reference_id,
            id: obj.id,
        }
    }
}

/// What happened to a verified event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WebhookDisposition {
    Granted,
    AlreadyGranted,
    /// Recognised but nothing to grant (unpaid, unverifiable, indeterminate)
    Skipped,
    /// Logged for operators, no entitlement change
    Logged,
    Ignored,
}

/// Verify a `Stripe-Signature` header against the raw payload at time `now`
pub fn verify_signature(
    payload: &str,
    header: &str,
    secret: &str,
    now: i64,
) -> BillingResult<()> {
    let mut timestamp: Option<i64> = None;
    let mut candidates: Vec<&str> = Vec::new();

    for part in header.split(',') {
        if let Some((key, value)) = part.trim().split_once('=') {
            match key {
                "t" => timestamp = value.parse().ok(),
                "v1" => candidates.push(value),
                _ => {}
            }
        }
    }

    let timestamp = timestamp.ok_or_else(|| {
        tracing::warn!("Missing timestamp in signature header");
        BillingError::SignatureInvalid
    })?;
    if candidates.is_empty() {
        tracing::warn!("Missing v1 signature in signature header");
        return Err(BillingError::SignatureInvalid);
    }

    let age = now - timestamp;
    if age.abs() > SIGNATURE_TOLERANCE_SECS {
        tracing::warn!(
            timestamp = timestamp,
            now = now,
            age = age,
            "Webhook timestamp outside tolerance"
        );
        return Err(BillingError::SignatureInvalid);
    }

    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).map_err(|_| {
        tracing::error!("Invalid webhook secret key");
        BillingError::SignatureInvalid
    })?;
    mac.update(format!("{}.{}", timestamp, payload).as_bytes());
    let expected = hex::encode(mac.finalize().into_bytes());

    let matched = candidates.iter().any(|candidate| {
        candidate.len() == expected.len()
            && bool::from(expected.as_bytes().ct_eq(candidate.as_bytes()))
    });
    if !matched {
        tracing::warn!("Webhook signature mismatch");
        return Err(BillingError::SignatureInvalid);
    }
    Ok(())
}

/// Webhook handler for Stripe events
pub struct WebhookHandler {
    engine: Arc<GrantEngine>,
    webhook_secret: String,
}

impl WebhookHandler {
    pub fn new(engine: Arc<GrantEngine>, webhook_secret: impl Into<String>) -> Self {
        Self {
            engine,
            webhook_secret: webhook_secret.into(),
        }
    }

    /// Verify the signature, then parse. Nothing is read from an unverified payload.
    pub fn verify_event(&self, payload: &str, signature: &str) -> BillingResult<WebhookEvent> {
        verify_signature(
            payload,
            signature,
            &self.webhook_secret,
            OffsetDateTime::now_utc().unix_timestamp(),
        )?;

        serde_json::from_str(payload).map_err(|e| {
            tracing::error!(parse_error = %e, "Failed to parse webhook event JSON");
            BillingError::InvalidInput(format!("malformed event: {}", e))
        })
    }

    /// Dispatch a verified event. Errors mean "ask the processor to redeliver".
    pub async fn handle_event(&self, event: WebhookEvent) -> BillingResult<WebhookDisposition> {
        tracing::info!(
            event_id = %event.id,
            event_type = %event.type_,
            "Processing Stripe webhook event"
        );

        let event_type = event.type_.clone();
        match event_type.as_str() {
            "checkout.session.completed" | "checkout.session.async_payment_succeeded" => {
                self.handle_checkout_completed(event).await
            }
            t if t.starts_with("customer.subscription.") => {
                tracing::info!(
                    event_id = %event.id,
                    event_type = %t,
                    "Subscription event ignored - only one-time purchases are sold"
                );
                Ok(WebhookDisposition::Ignored)
            }
            "charge.refunded" | "charge.dispute.created" => self.handle_refund(event).await,
            other => {
                tracing::info!(event_type = %other, "Unhandled Stripe event type");
                Ok(WebhookDisposition::Ignored)
            }
        }
    }

    async fn handle_checkout_completed(
        &self,
        event: WebhookEvent,
    ) -> BillingResult<WebhookDisposition> {
        let object: CheckoutSessionObject = serde_json::from_value(event.data.object)
            .map_err(|e| BillingError::InvalidInput(format!("Expected checkout session: {}", e)))?;
        let session = PaymentSession::from(object);

        match self.engine.grant_pushed(&event.id, session).await {
            Ok(Some(outcome)) if outcome.granted => Ok(WebhookDisposition::Granted),
            Ok(Some(_)) => Ok(WebhookDisposition::AlreadyGranted),
            Ok(None) => Ok(WebhookDisposition::Skipped),
            // Redelivery cannot fix these; reconcile can once the data is corrected
            Err(e @ BillingError::IndeterminateProduct(_))
            | Err(e @ BillingError::SessionOwnershipUnverifiable) => {
                tracing::error!(
                    event_id = %event.id,
                    error = %e,
                    "Checkout event acknowledged without grant"
                );
                Ok(WebhookDisposition::Skipped)
            }
            Err(e) => Err(e),
        }
    }

    async fn handle_refund(&self, event: WebhookEvent) -> BillingResult<WebhookDisposition> {
        let charge: Option<ChargeObject> = serde_json::from_value(event.data.object.clone()).ok();
        let user_id = charge
            .as_ref()
            .and_then(|c| c.metadata.as_ref())
            .and_then(|m| m.get(metadata::USER_ID))
            .and_then(|id| Uuid::parse_str(id).ok());

        tracing::warn!(
            event_id = %event.id,
            event_type = %event.type_,
            charge_id = ?charge.as_ref().map(|c| c.id.as_str()),
            customer_id = ?charge.as_ref().and_then(|c| expandable_id(&c.customer)),
            amount_refunded = charge.as_ref().map(|c| c.amount_refunded).unwrap_or(0),
            user_id = ?user_id,
            "Refund or dispute observed - operator follow-up required, access unchanged"
        );

        if let Some(user_id) = user_id {
            self.engine
                .audit()
                .record(
                    user_id,
                    AuditLogEntry::new(AuditAction::RefundObserved).detail(serde_json::json!({
                        "event_id": event.id,
                        "event_type": event.type_,
                        "charge_id": charge.as_ref().map(|c| c.id.clone()),
                        "amount_refunded": charge.as_ref().map(|c| c.amount_refunded),
                    })),
                )
                .await;
        }

        Ok(WebhookDisposition::Logged)
    }
}
