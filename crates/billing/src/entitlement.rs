//! Entitlement records and store access
//!
//! One [`EntitlementRecord`] per user. Reads merge the stored features over the
//! catalog defaults for the stored tier, so catalog additions show up without a
//! re-grant. Writes overwrite the whole record; callers read, modify, and write
//! within one logical operation.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tierlock_shared::SharedStore;
use uuid::Uuid;

use crate::catalog::{
    addon_effect, features_for, price_for, Addon, AddonEffect, Capability, FeatureSet, Quota,
    Tier,
};
use crate::error::{BillingError, BillingResult};
use crate::keys;
use crate::proration::carry_over_remaining;

/// Bumped whenever the stored shape changes incompatibly
pub const SCHEMA_VERSION: u32 = 1;

fn current_schema() -> u32 {
    SCHEMA_VERSION
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageCounter {
    pub used: u64,
    pub remaining: Quota,
}

impl UsageCounter {
    pub fn fresh(quota: Quota) -> Self {
        Self {
            used: 0,
            remaining: quota,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PurchaseMeta {
    #[serde(with = "time::serde::rfc3339")]
    pub purchased_at: OffsetDateTime,
    pub payment_session_id: String,
    pub payment_customer_id: Option<String>,
    /// Total paid toward the current tier, including earlier tiers it upgraded from
    pub amount_paid_cents: i64,
    pub is_upgrade: bool,
    pub upgraded_from: Option<Tier>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddonPurchase {
    pub addon: Addon,
    #[serde(with = "time::serde::rfc3339")]
    pub purchased_at: OffsetDateTime,
    pub session_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntitlementRecord {
    #[serde(default = "current_schema")]
    pub schema_version: u32,
    pub user_id: Uuid,
    pub tier: Tier,
    pub features: FeatureSet,
    #[serde(default)]
    pub usage_counters: BTreeMap<String, UsageCounter>,
    #[serde(default)]
    pub purchase_meta: Option<PurchaseMeta>,
    #[serde(default)]
    pub addons: Vec<AddonPurchase>,
    #[serde(default)]
    pub access_revoked: bool,
    #[serde(default)]
    pub access_frozen: bool,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

/// Pick the more generous of two capability values
fn widest(a: Capability, b: Capability) -> Capability {
    match (a, b) {
        (Capability::Flag(x), Capability::Flag(y)) => Capability::Flag(x || y),
        (Capability::Quota(Quota::Unlimited), _) | (_, Capability::Quota(Quota::Unlimited)) => {
            Capability::Quota(Quota::Unlimited)
        }
        (Capability::Quota(Quota::Limited(x)), Capability::Quota(Quota::Limited(y))) => {
            Capability::Quota(Quota::Limited(x.max(y)))
        }
        // Shape changed between catalog versions; the catalog wins
        (catalog, _) => catalog,
    }
}

/// Catalog features for `tier` with every purchased add-on replayed on top
pub fn features_with_addons(tier: Tier, addons: &[AddonPurchase]) -> FeatureSet {
    let mut features = features_for(tier);
    for purchase in addons {
        apply_effect(&mut features, addon_effect(purchase.addon));
    }
    features
}

fn apply_effect(features: &mut FeatureSet, effect: AddonEffect) {
    match effect {
        AddonEffect::Increment { feature, amount } => {
            let current = features
                .get(feature)
                .and_then(Capability::as_quota)
                .unwrap_or(Quota::Limited(0));
            features.insert(feature.to_string(), Capability::Quota(current.increased_by(amount)));
        }
        AddonEffect::Unlock { feature } => {
            features.insert(feature.to_string(), Capability::Flag(true));
        }
    }
}

impl EntitlementRecord {
    pub fn free(user_id: Uuid) -> Self {
        let features = features_for(Tier::Free);
        let mut record = Self {
            schema_version: SCHEMA_VERSION,
            user_id,
            tier: Tier::Free,
            features,
            usage_counters: BTreeMap::new(),
            purchase_meta: None,
            addons: Vec::new(),
            access_revoked: false,
            access_frozen: false,
            updated_at: OffsetDateTime::now_utc(),
        };
        record.ensure_counters();
        record
    }

    /// Merge stored features over catalog defaults for the stored tier
    pub fn merged_with_catalog(mut self) -> Self {
        let mut merged = features_with_addons(self.tier, &self.addons);
        for (name, stored) in std::mem::take(&mut self.features) {
            let value = match merged.get(&name) {
                Some(catalog) => widest(*catalog, stored),
                None => stored,
            };
            merged.insert(name, value);
        }
        self.features = merged;
        self.ensure_counters();
        self
    }

    /// Every quota feature gets a usage counter
    fn ensure_counters(&mut self) {
        for (name, capability) in &self.features {
            if let Some(quota) = capability.as_quota() {
                self.usage_counters
                    .entry(name.clone())
                    .or_insert_with(|| UsageCounter::fresh(quota));
            }
        }
    }

    /// Whether this session already left a mark on the record
    pub fn has_session(&self, session_id: &str) -> bool {
        self.purchase_meta
            .as_ref()
            .is_some_and(|m| m.payment_session_id == session_id)
            || self.addons.iter().any(|a| a.session_id == session_id)
    }

    /// What the user has paid toward their current tier
    pub fn amount_already_paid(&self) -> i64 {
        match &self.purchase_meta {
            Some(meta) if meta.amount_paid_cents > 0 => meta.amount_paid_cents,
            _ => price_for(self.tier),
        }
    }

    pub fn has_feature(&self, feature: &str) -> bool {
        self.features
            .get(feature)
            .is_some_and(Capability::is_enabled)
    }

    /// Raise the tier. Returns false (and leaves the record untouched) if the
    /// requested tier is not above the current one.
    pub fn apply_tier_grant(
        &mut self,
        tier: Tier,
        session_id: &str,
        customer_id: Option<String>,
        amount_paid_cents: i64,
        now: OffsetDateTime,
    ) -> bool {
        if tier <= self.tier {
            return false;
        }

        let previous = self.tier;
        let is_upgrade = previous.is_paid();
        let total_paid = if is_upgrade {
            self.amount_already_paid() + amount_paid_cents
        } else {
            amount_paid_cents
        };

        let features = features_with_addons(tier, &self.addons);
        for (name, capability) in &features {
            if let Some(quota) = capability.as_quota() {
                let used = self.usage_counters.get(name).map(|c| c.used).unwrap_or(0);
                self.usage_counters.insert(
                    name.clone(),
                    UsageCounter {
                        used,
                        remaining: carry_over_remaining(quota, used),
                    },
                );
            }
        }

        self.tier = tier;
        self.features = features;
        self.purchase_meta = Some(PurchaseMeta {
            purchased_at: now,
            payment_session_id: session_id.to_string(),
            payment_customer_id: customer_id.or_else(|| {
                self.purchase_meta
                    .as_ref()
                    .and_then(|m| m.payment_customer_id.clone())
            }),
            amount_paid_cents: total_paid,
            is_upgrade,
            upgraded_from: is_upgrade.then_some(previous),
        });
        self.updated_at = now;
        true
    }

    /// Record an add-on purchase and apply its effect
    pub fn apply_addon(&mut self, addon: Addon, session_id: &str, now: OffsetDateTime) {
        let effect = addon_effect(addon);
        apply_effect(&mut self.features, effect);
        if let AddonEffect::Increment { feature, amount } = effect {
            let counter = self
                .usage_counters
                .entry(feature.to_string())
                .or_insert_with(|| UsageCounter::fresh(Quota::Limited(0)));
            counter.remaining = counter.remaining.increased_by(amount);
        }
        self.addons.push(AddonPurchase {
            addon,
            purchased_at: now,
            session_id: session_id.to_string(),
        });
        self.updated_at = now;
    }
}

/// Read/write access to entitlement records
#[derive(Clone)]
pub struct EntitlementStore {
    store: SharedStore,
}

impl EntitlementStore {
    pub fn new(store: SharedStore) -> Self {
        Self { store }
    }

    /// Stored record, without creating one
    pub async fn find(&self, user_id: Uuid) -> BillingResult<Option<EntitlementRecord>> {
        let Some(raw) = self.store.get(&keys::entitlement(user_id)).await? else {
            return Ok(None);
        };
        let record: EntitlementRecord = serde_json::from_str(&raw).map_err(|e| {
            tracing::error!(user_id = %user_id, error = %e, "Stored entitlement record is unreadable");
            BillingError::Serialization(e)
        })?;
        if record.schema_version > SCHEMA_VERSION {
            tracing::warn!(
                user_id = %user_id,
                stored_version = record.schema_version,
                "Entitlement record written by a newer schema"
            );
        }
        Ok(Some(record.merged_with_catalog()))
    }

    /// Current record; a free default is created on first read
    pub async fn read(&self, user_id: Uuid) -> BillingResult<EntitlementRecord> {
        if let Some(record) = self.find(user_id).await? {
            return Ok(record);
        }

        let record = EntitlementRecord::free(user_id);
        // set-if-absent so a concurrent grant is never clobbered by the default
        let json = serde_json::to_string(&record)?;
        if !self
            .store
            .set_if_absent(&keys::entitlement(user_id), &json, None)
            .await?
        {
            if let Some(existing) = self.find(user_id).await? {
                return Ok(existing);
            }
        }
        Ok(record)
    }

    /// Full-record overwrite
    pub async fn write(&self, record: &EntitlementRecord) -> BillingResult<()> {
        let json = serde_json::to_string(record)?;
        self.store
            .set(&keys::entitlement(record.user_id), &json, None)
            .await
            .map_err(|e| BillingError::StoreWriteFailed(e.to_string()))
    }

    pub async fn reset_to_free(&self, user_id: Uuid) -> BillingResult<EntitlementRecord> {
        let record = EntitlementRecord::free(user_id);
        self.write(&record).await?;
        Ok(record)
    }

    pub async fn set_access_flags(
        &self,
        user_id: Uuid,
        revoked: bool,
        frozen: bool,
    ) -> BillingResult<EntitlementRecord> {
        let mut record = self.read(user_id).await?;
        record.access_revoked = revoked;
        record.access_frozen = frozen;
        record.updated_at = OffsetDateTime::now_utc();
        self.write(&record).await?;
        Ok(record)
    }

    pub async fn remember_customer(&self, user_id: Uuid, customer_id: &str) -> BillingResult<()> {
        self.store
            .set(&keys::customer(user_id), customer_id, None)
            .await?;
        Ok(())
    }

    pub async fn customer_for(&self, user_id: Uuid) -> BillingResult<Option<String>> {
        Ok(self.store.get(&keys::customer(user_id)).await?)
    }
}
