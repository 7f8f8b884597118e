//! Grant lock protocol
//!
//! A grant lock is created with set-if-absent under a session-scoped key. The
//! caller that creates it owns the grant for that payment session; everybody
//! else treats the grant as done (or about to be done by the owner) and returns
//! the current entitlement. This makes grants idempotent per session id, no
//! matter how many convergence paths fire for it.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tierlock_shared::SharedStore;
use uuid::Uuid;

use crate::catalog::Product;
use crate::error::{BillingError, BillingResult};
use crate::keys;

/// Default lock lifetime; outlives any realistic webhook redelivery window
pub const DEFAULT_LOCK_TTL: Duration = Duration::from_secs(90 * 24 * 60 * 60);

/// Which convergence path performed a grant
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GrantSource {
    Webhook,
    RedirectSync,
    ManualReconcile,
    SelfHeal,
}

impl GrantSource {
    /// Paths that search for the user's payments may restore a grant whose
    /// lock exists but whose record write never landed
    pub fn recovers_lost_writes(&self) -> bool {
        matches!(self, GrantSource::ManualReconcile | GrantSource::SelfHeal)
    }
}

impl fmt::Display for GrantSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            GrantSource::Webhook => "webhook",
            GrantSource::RedirectSync => "redirect_sync",
            GrantSource::ManualReconcile => "manual_reconcile",
            GrantSource::SelfHeal => "self_heal",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GrantLock {
    pub user_id: Uuid,
    pub product: Product,
    #[serde(with = "time::serde::rfc3339")]
    pub granted_at: OffsetDateTime,
    pub source: GrantSource,
}

#[derive(Clone)]
pub struct GrantLockService {
    store: SharedStore,
    ttl: Duration,
}

impl GrantLockService {
    pub fn new(store: SharedStore, ttl: Duration) -> Self {
        Self { store, ttl }
    }

    /// Claim the right to grant `session_id`. True only for the creator.
    pub async fn try_acquire(
        &self,
        session_id: &str,
        user_id: Uuid,
        product: Product,
        source: GrantSource,
    ) -> BillingResult<bool> {
        let lock = GrantLock {
            user_id,
            product,
            granted_at: OffsetDateTime::now_utc(),
            source,
        };
        let json = serde_json::to_string(&lock)?;

        let acquired = self
            .store
            .set_if_absent(&keys::grant_lock(session_id), &json, Some(self.ttl))
            .await?;

        if acquired {
            tracing::info!(
                session_id = %session_id,
                user_id = %user_id,
                product = %product,
                source = %source,
                "Grant lock acquired"
            );
        } else {
            tracing::info!(
                session_id = %session_id,
                source = %source,
                "Grant lock already held - another path owns this grant"
            );
        }

        Ok(acquired)
    }

    /// Who granted this session and when, without attempting a grant
    pub async fn get_lock_info(&self, session_id: &str) -> BillingResult<Option<GrantLock>> {
        match self.store.get(&keys::grant_lock(session_id)).await? {
            Some(raw) => serde_json::from_str(&raw)
                .map(Some)
                .map_err(BillingError::Serialization),
            None => Ok(None),
        }
    }
}
