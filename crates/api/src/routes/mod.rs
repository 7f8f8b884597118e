//! API routes

pub mod billing;
pub mod internal;
pub mod webhooks;

use axum::{
    extract::State,
    http::StatusCode,
    middleware,
    routing::{get, post},
    Json, Router,
};
use serde_json::{json, Value};

use crate::auth::{require_auth, require_internal_secret};
use crate::state::AppState;

pub fn create_router(state: AppState) -> Router {
    let user_routes = Router::new()
        .route("/api/v1/billing/sync", post(billing::sync_session))
        .route(
            "/api/v1/billing/reconcile",
            get(billing::diagnose_reconcile).post(billing::reconcile),
        )
        .route("/api/v1/billing/entitlement", get(billing::get_entitlement))
        .route("/api/v1/billing/usage/{usage_type}", post(billing::consume_usage))
        .route("/api/v1/billing/upgrade/quote", post(billing::upgrade_quote))
        .layer(middleware::from_fn_with_state(state.clone(), require_auth));

    let internal_routes = Router::new()
        .route("/internal/retry-queue", get(internal::inspect_retry_queue))
        .route("/internal/retry-queue/drain", post(internal::drain_retry_queue))
        .route(
            "/internal/retry-queue/dead-letter/{event_id}/retry",
            post(internal::retry_dead_letter),
        )
        .route("/internal/grants/{session_id}", get(internal::get_grant_lock))
        .route(
            "/internal/entitlements/{user_id}/reset",
            post(internal::reset_to_free),
        )
        .route(
            "/internal/entitlements/{user_id}/access",
            post(internal::set_access_flags),
        )
        .route(
            "/internal/entitlements/{user_id}/audit",
            get(internal::get_audit_trail),
        )
        .layer(middleware::from_fn_with_state(
            state.clone(),
            require_internal_secret,
        ));

    Router::new()
        .route("/health", get(health))
        .route("/webhooks/stripe", post(webhooks::stripe_webhook))
        .merge(user_routes)
        .merge(internal_routes)
        .with_state(state)
}

/// Liveness plus a store ping; the store being down degrades, it does not fail
async fn health(State(state): State<AppState>) -> (StatusCode, Json<Value>) {
    match state.store.ping().await {
        Ok(()) => (StatusCode::OK, Json(json!({ "status": "ok", "store": "up" }))),
        Err(e) => {
            tracing::warn!(error = %e, "Health check: store unreachable");
            (
                StatusCode::OK,
                Json(json!({ "status": "degraded", "store": "down" })),
            )
        }
    }
}
