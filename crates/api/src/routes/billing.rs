//! Client-facing billing routes
//!
//! Every handler here runs behind `require_auth`; the user id always comes
//! from the token, never from the request body.

use axum::{
    extract::{Extension, Path, State},
    http::StatusCode,
    Json,
};
use serde::{Deserialize, Serialize};
use tierlock_billing::{proration, EntitlementRecord, GrantOutcome, Tier, UsageDecision};

use crate::{
    auth::AuthUser,
    error::{ApiError, ApiResult},
    state::AppState,
};

#[derive(Debug, Deserialize)]
pub struct SyncRequest {
    pub session_id: String,
}

#[derive(Debug, Serialize)]
pub struct GrantResponse {
    pub granted: bool,
    pub already_granted: bool,
    pub tier: Tier,
    pub entitlement: EntitlementRecord,
}

impl From<GrantOutcome> for GrantResponse {
    fn from(outcome: GrantOutcome) -> Self {
        Self {
            granted: outcome.granted,
            already_granted: outcome.already_granted,
            tier: outcome.tier,
            entitlement: outcome.entitlement,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct UpgradeQuoteRequest {
    pub tier: Tier,
}

async fn enforce_rate_limit(state: &AppState, action: &str, user: &AuthUser, limit: i64) -> ApiResult<()> {
    let subject = format!("{}:{}", action, user.user_id);
    let result = state
        .rate_limiter
        .check(&subject, limit, state.config.rate_limit.window)
        .await;

    if result.allowed {
        return Ok(());
    }
    tracing::warn!(user_id = %user.user_id, action = %action, "Billing rate limit exceeded");
    Err(ApiError::RateLimited {
        retry_after_seconds: result.retry_after_seconds,
    })
}

/// POST /api/v1/billing/sync - grant from the checkout redirect
pub async fn sync_session(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Json(req): Json<SyncRequest>,
) -> ApiResult<Json<GrantResponse>> {
    enforce_rate_limit(
        &state,
        "sync",
        &auth_user,
        state.config.rate_limit.sync_per_window,
    )
    .await?;

    let outcome = state
        .billing
        .engine
        .sync_session(auth_user.user_id, req.session_id.trim())
        .await?;

    Ok(Json(outcome.into()))
}

/// GET /api/v1/billing/reconcile - what a reconcile would do, without side effects
pub async fn diagnose_reconcile(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
) -> ApiResult<Json<tierlock_billing::ReconcileDiagnosis>> {
    enforce_rate_limit(
        &state,
        "reconcile",
        &auth_user,
        state.config.rate_limit.reconcile_per_window,
    )
    .await?;

    let diagnosis = state
        .billing
        .engine
        .diagnose(auth_user.user_id, auth_user.email.as_deref())
        .await?;
    Ok(Json(diagnosis))
}

/// POST /api/v1/billing/reconcile - "I paid but didn't get it"
pub async fn reconcile(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
) -> ApiResult<Json<GrantResponse>> {
    enforce_rate_limit(
        &state,
        "reconcile",
        &auth_user,
        state.config.rate_limit.reconcile_per_window,
    )
    .await?;

    let outcome = state
        .billing
        .engine
        .reconcile(auth_user.user_id, auth_user.email.as_deref())
        .await?;
    Ok(Json(outcome.into()))
}

/// GET /api/v1/billing/entitlement
pub async fn get_entitlement(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
) -> ApiResult<Json<EntitlementRecord>> {
    let record = state
        .billing
        .engine
        .read_with_self_heal(auth_user.user_id, auth_user.email.as_deref())
        .await?;
    Ok(Json(record))
}

/// POST /api/v1/billing/usage/{usage_type}
pub async fn consume_usage(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Path(usage_type): Path<String>,
) -> ApiResult<(StatusCode, Json<UsageDecision>)> {
    let decision = state
        .billing
        .entitlements
        .consume(auth_user.user_id, &usage_type)
        .await?;

    let status = if decision.allowed {
        StatusCode::OK
    } else {
        StatusCode::PAYMENT_REQUIRED
    };
    Ok((status, Json(decision)))
}

/// POST /api/v1/billing/upgrade/quote
pub async fn upgrade_quote(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Json(req): Json<UpgradeQuoteRequest>,
) -> ApiResult<Json<proration::UpgradeQuote>> {
    let record = state
        .billing
        .engine
        .entitlements()
        .read(auth_user.user_id)
        .await?;

    let quote = proration::quote(&record, req.tier).map_err(tierlock_billing::BillingError::from)?;
    Ok(Json(quote))
}
