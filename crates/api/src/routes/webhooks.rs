//! Stripe webhook endpoint
//!
//! The body is taken raw: the signature covers the exact bytes Stripe sent,
//! so it must be verified before anything parses it.

use axum::{extract::State, http::HeaderMap, Json};
use serde_json::{json, Value};
use tierlock_billing::BillingError;

use crate::{error::ApiResult, state::AppState};

const SIGNATURE_HEADER: &str = "stripe-signature";

/// POST /webhooks/stripe
pub async fn stripe_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: String,
) -> ApiResult<Json<Value>> {
    let signature = headers
        .get(SIGNATURE_HEADER)
        .and_then(|h| h.to_str().ok())
        .ok_or_else(|| {
            tracing::warn!("Stripe webhook without signature header");
            BillingError::SignatureInvalid
        })?;

    let event = state.billing.webhooks.verify_event(&body, signature)?;
    let event_id = event.id.clone();
    let event_type = event.type_.clone();

    let disposition = state.billing.webhooks.handle_event(event).await?;
    tracing::info!(
        event_id = %event_id,
        event_type = %event_type,
        disposition = ?disposition,
        "Stripe webhook processed"
    );

    Ok(Json(json!({
        "received": true,
        "disposition": disposition,
    })))
}
