//! Usage consumption and operator actions on entitlements
//!
//! Usage checks fail open: if the store cannot be read or written, the action
//! is allowed and the miss is logged. Product availability beats strict quota
//! enforcement here.

use serde::Serialize;
use time::OffsetDateTime;
use tierlock_shared::SharedStore;
use uuid::Uuid;

use crate::audit::{AuditAction, AuditLog, AuditLogEntry};
use crate::catalog::{Quota, USAGE_TYPES};
use crate::entitlement::{EntitlementRecord, EntitlementStore, UsageCounter};
use crate::error::{BillingError, BillingResult};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UsageDecision {
    pub allowed: bool,
    pub usage_type: String,
    /// `None` when the store could not be consulted
    pub remaining: Option<Quota>,
    pub fail_open: bool,
}

impl UsageDecision {
    fn open(usage_type: &str) -> Self {
        Self {
            allowed: true,
            usage_type: usage_type.to_string(),
            remaining: None,
            fail_open: true,
        }
    }
}

#[derive(Clone)]
pub struct EntitlementService {
    entitlements: EntitlementStore,
    audit: AuditLog,
}

impl EntitlementService {
    pub fn new(store: SharedStore, audit: AuditLog) -> Self {
        Self {
            entitlements: EntitlementStore::new(store),
            audit,
        }
    }

    /// Spend one unit of `usage_type`
    pub async fn consume(&self, user_id: Uuid, usage_type: &str) -> BillingResult<UsageDecision> {
        if !USAGE_TYPES.contains(&usage_type) {
            return Err(BillingError::InvalidInput(format!(
                "unknown usage type '{}'",
                usage_type
            )));
        }

        let mut record = match self.entitlements.read(user_id).await {
            Ok(record) => record,
            Err(e) => {
                tracing::warn!(
                    user_id = %user_id,
                    usage_type = %usage_type,
                    error = %e,
                    "Usage check failing open - entitlement store unavailable"
                );
                return Ok(UsageDecision::open(usage_type));
            }
        };

        if record.access_revoked || record.access_frozen {
            return Ok(UsageDecision {
                allowed: false,
                usage_type: usage_type.to_string(),
                remaining: Some(Quota::Limited(0)),
                fail_open: false,
            });
        }

        let counter = record
            .usage_counters
            .entry(usage_type.to_string())
            .or_insert_with(|| UsageCounter::fresh(Quota::Limited(0)));
        let remaining = match counter.remaining {
            Quota::Unlimited => Quota::Unlimited,
            Quota::Limited(0) => {
                return Ok(UsageDecision {
                    allowed: false,
                    usage_type: usage_type.to_string(),
                    remaining: Some(Quota::Limited(0)),
                    fail_open: false,
                })
            }
            Quota::Limited(n) => Quota::Limited(n - 1),
        };
        counter.used += 1;
        counter.remaining = remaining;
        let used = counter.used;
        record.updated_at = OffsetDateTime::now_utc();

        if let Err(e) = self.entitlements.write(&record).await {
            tracing::warn!(
                user_id = %user_id,
                usage_type = %usage_type,
                error = %e,
                "Usage write failed - allowing action uncounted"
            );
            return Ok(UsageDecision::open(usage_type));
        }

        self.audit
            .record(
                user_id,
                AuditLogEntry::new(AuditAction::UsageConsumed).detail(serde_json::json!({
                    "usage_type": usage_type,
                    "used": used,
                    "remaining": remaining,
                })),
            )
            .await;

        Ok(UsageDecision {
            allowed: true,
            usage_type: usage_type.to_string(),
            remaining: Some(remaining),
            fail_open: false,
        })
    }

    /// Operator reset; purchase history on the record is discarded
    pub async fn reset_to_free(&self, user_id: Uuid, reason: &str) -> BillingResult<EntitlementRecord> {
        let previous = self.entitlements.find(user_id).await?.map(|r| r.tier);
        let record = self.entitlements.reset_to_free(user_id).await?;

        tracing::warn!(
            user_id = %user_id,
            previous_tier = ?previous,
            reason = %reason,
            "Entitlement reset to free"
        );
        self.audit
            .record(
                user_id,
                AuditLogEntry::new(AuditAction::ResetToFree).detail(serde_json::json!({
                    "previous_tier": previous,
                    "reason": reason,
                })),
            )
            .await;
        Ok(record)
    }

    /// Operator freeze/revoke, typically after a refund or dispute
    pub async fn set_access_flags(
        &self,
        user_id: Uuid,
        revoked: bool,
        frozen: bool,
        reason: &str,
    ) -> BillingResult<EntitlementRecord> {
        let record = self
            .entitlements
            .set_access_flags(user_id, revoked, frozen)
            .await?;

        tracing::warn!(
            user_id = %user_id,
            revoked = revoked,
            frozen = frozen,
            reason = %reason,
            "Entitlement access flags changed"
        );
        self.audit
            .record(
                user_id,
                AuditLogEntry::new(AuditAction::AccessFlagsChanged).detail(serde_json::json!({
                    "revoked": revoked,
                    "frozen": frozen,
                    "reason": reason,
                })),
            )
            .await;
        Ok(record)
    }
}
