//! Per-user audit trail
//!
//! Append-only, capped list of everything that touched a user's entitlement.
//! Entries are evidence for support staff; nothing reads them to make decisions.

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tierlock_shared::SharedStore;
use uuid::Uuid;

use crate::error::BillingResult;
use crate::keys;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    TierGranted,
    TierUpgraded,
    AddonGranted,
    GrantRecovered,
    GrantDeadLettered,
    UsageConsumed,
    ResetToFree,
    AccessFlagsChanged,
    RefundObserved,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditLogEntry {
    #[serde(with = "time::serde::rfc3339")]
    pub at: OffsetDateTime,
    pub action: AuditAction,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default)]
    pub detail: serde_json::Value,
}

impl AuditLogEntry {
    pub fn new(action: AuditAction) -> Self {
        Self {
            at: OffsetDateTime::now_utc(),
            action,
            session_id: None,
            detail: serde_json::Value::Null,
        }
    }

    pub fn session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    pub fn detail(mut self, detail: serde_json::Value) -> Self {
        self.detail = detail;
        self
    }
}

#[derive(Clone)]
pub struct AuditLog {
    store: SharedStore,
    cap: usize,
}

impl AuditLog {
    pub fn new(store: SharedStore, cap: usize) -> Self {
        Self {
            store,
            cap: cap.max(1),
        }
    }

    /// Append an entry and trim the oldest beyond the cap
    pub async fn append(&self, user_id: Uuid, entry: AuditLogEntry) -> BillingResult<()> {
        let key = keys::audit(user_id);
        let json = serde_json::to_string(&entry)?;
        self.store.push_back(&key, &json).await?;
        self.store.trim(&key, -(self.cap as isize), -1).await?;
        Ok(())
    }

    /// Append without failing the caller; audit is never allowed to unwind a grant
    pub async fn record(&self, user_id: Uuid, entry: AuditLogEntry) {
        let action = entry.action;
        if let Err(e) = self.append(user_id, entry).await {
            tracing::warn!(
                user_id = %user_id,
                action = ?action,
                error = %e,
                "Failed to append audit log entry"
            );
        }
    }

    /// Most recent entries, oldest first
    pub async fn recent(&self, user_id: Uuid, limit: usize) -> BillingResult<Vec<AuditLogEntry>> {
        let raw = self
            .store
            .range(&keys::audit(user_id), -(limit.max(1) as isize), -1)
            .await?;
        let mut entries = Vec::with_capacity(raw.len());
        for item in raw {
            match serde_json::from_str(&item) {
                Ok(entry) => entries.push(entry),
                Err(e) => tracing::warn!(user_id = %user_id, error = %e, "Skipping unreadable audit entry"),
            }
        }
        Ok(entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tierlock_shared::MemoryStore;

    #[tokio::test]
    async fn test_audit_is_capped_to_newest_entries() {
        let log = AuditLog::new(Arc::new(MemoryStore::new()), 3);
        let user = Uuid::new_v4();

        for i in 0..5 {
            log.append(
                user,
                AuditLogEntry::new(AuditAction::UsageConsumed).detail(serde_json::json!({ "n": i })),
            )
            .await
            .unwrap();
        }

        let entries = log.recent(user, 10).await.unwrap();
        let ns: Vec<i64> = entries
            .iter()
            .map(|e| e.detail["n"].as_i64().unwrap())
            .collect();
        assert_eq!(ns, vec![2, 3, 4]);
    }

    #[tokio::test]
    async fn test_record_swallows_store_outage() {
        let store = Arc::new(MemoryStore::new());
        store.set_unavailable(true);
        let log = AuditLog::new(store, 10);

        // Must not panic or propagate
        log.record(Uuid::new_v4(), AuditLogEntry::new(AuditAction::TierGranted))
            .await;
    }
}
