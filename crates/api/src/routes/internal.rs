//! Internal routes for the scheduler and support tooling
//!
//! Guarded by `require_internal_secret`, not user JWTs.

use axum::{
    extract::{Path, Query, State},
    Json,
};
use serde::Deserialize;
use tierlock_billing::{
    AuditLogEntry, DrainReport, EntitlementRecord, GrantLock, RetryQueueItem, RetryQueueSnapshot,
};
use uuid::Uuid;

use crate::{
    error::{ApiError, ApiResult},
    state::AppState,
};

const DEFAULT_INSPECT_LIMIT: usize = 50;
const MAX_INSPECT_LIMIT: usize = 500;

#[derive(Debug, Default, Deserialize)]
pub struct DrainRequest {
    /// Capped at the configured batch size
    pub batch: Option<usize>,
}

#[derive(Debug, Deserialize)]
pub struct LimitQuery {
    pub limit: Option<usize>,
}

impl LimitQuery {
    fn resolved(&self) -> usize {
        self.limit
            .unwrap_or(DEFAULT_INSPECT_LIMIT)
            .clamp(1, MAX_INSPECT_LIMIT)
    }
}

#[derive(Debug, Deserialize)]
pub struct ResetRequest {
    pub reason: String,
}

#[derive(Debug, Deserialize)]
pub struct AccessFlagsRequest {
    #[serde(default)]
    pub revoked: bool,
    #[serde(default)]
    pub frozen: bool,
    pub reason: String,
}

fn require_reason(reason: &str) -> ApiResult<()> {
    if reason.trim().is_empty() {
        return Err(ApiError::Validation("reason is required".into()));
    }
    Ok(())
}

/// POST /internal/retry-queue/drain
pub async fn drain_retry_queue(
    State(state): State<AppState>,
    body: Option<Json<DrainRequest>>,
) -> ApiResult<Json<DrainReport>> {
    let configured = state.config.retry_drain_batch.max(1);
    let batch = body
        .and_then(|Json(req)| req.batch)
        .map_or(configured, |b| b.clamp(1, configured));

    let engine = state.billing.engine.as_ref();
    let report = engine.retry_queue().drain(batch, engine).await?;

    tracing::info!(
        processed = report.processed.len(),
        remaining = report.remaining,
        dead_letter = report.dead_letter,
        "Retry queue drained"
    );
    Ok(Json(report))
}

/// GET /internal/retry-queue
pub async fn inspect_retry_queue(
    State(state): State<AppState>,
    Query(query): Query<LimitQuery>,
) -> ApiResult<Json<RetryQueueSnapshot>> {
    let snapshot = state
        .billing
        .engine
        .retry_queue()
        .inspect(query.resolved())
        .await?;
    Ok(Json(snapshot))
}

/// POST /internal/retry-queue/dead-letter/{event_id}/retry
pub async fn retry_dead_letter(
    State(state): State<AppState>,
    Path(event_id): Path<String>,
) -> ApiResult<Json<RetryQueueItem>> {
    let item = state
        .billing
        .engine
        .retry_queue()
        .requeue_dead_letter(&event_id)
        .await?;
    tracing::info!(event_id = %event_id, user_id = %item.user_id, "Dead-lettered grant requeued by operator");
    Ok(Json(item))
}

/// GET /internal/grants/{session_id}
pub async fn get_grant_lock(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> ApiResult<Json<GrantLock>> {
    state
        .billing
        .engine
        .locks()
        .get_lock_info(&session_id)
        .await?
        .map(Json)
        .ok_or_else(|| ApiError::NotFound(format!("no grant for session {}", session_id)))
}

/// POST /internal/entitlements/{user_id}/reset
pub async fn reset_to_free(
    State(state): State<AppState>,
    Path(user_id): Path<Uuid>,
    Json(req): Json<ResetRequest>,
) -> ApiResult<Json<EntitlementRecord>> {
    require_reason(&req.reason)?;
    let record = state
        .billing
        .entitlements
        .reset_to_free(user_id, &req.reason)
        .await?;
    Ok(Json(record))
}

/// POST /internal/entitlements/{user_id}/access
pub async fn set_access_flags(
    State(state): State<AppState>,
    Path(user_id): Path<Uuid>,
    Json(req): Json<AccessFlagsRequest>,
) -> ApiResult<Json<EntitlementRecord>> {
    require_reason(&req.reason)?;
    let record = state
        .billing
        .entitlements
        .set_access_flags(user_id, req.revoked, req.frozen, &req.reason)
        .await?;
    Ok(Json(record))
}

/// GET /internal/entitlements/{user_id}/audit
pub async fn get_audit_trail(
    State(state): State<AppState>,
    Path(user_id): Path<Uuid>,
    Query(query): Query<LimitQuery>,
) -> ApiResult<Json<Vec<AuditLogEntry>>> {
    let entries = state
        .billing
        .engine
        .audit()
        .recent(user_id, query.resolved())
        .await?;
    Ok(Json(entries))
}
