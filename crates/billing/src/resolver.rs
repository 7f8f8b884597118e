//! Product resolution for paid sessions
//!
//! Sessions created by our checkout carry the product in metadata. Older or
//! hand-made sessions may not, so resolution falls back through the configured
//! price-id table, then the amount heuristics, then (only if configured) the
//! highest-tier threshold. Anything left is `IndeterminateProduct`.

use std::fmt;

use serde::Serialize;

use crate::catalog::{price_for, Addon, Product, Tier};
use crate::config::ProductResolverConfig;
use crate::entitlement::EntitlementRecord;
use crate::error::{BillingError, BillingResult};
use crate::processor::{metadata, PaymentSession};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolvedBy {
    Metadata,
    PriceId,
    Amount,
    UpgradeAmount,
    AmountThreshold,
}

impl fmt::Display for ResolvedBy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ResolvedBy::Metadata => "metadata",
            ResolvedBy::PriceId => "price_id",
            ResolvedBy::Amount => "amount",
            ResolvedBy::UpgradeAmount => "upgrade_amount",
            ResolvedBy::AmountThreshold => "amount_threshold",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Resolution {
    pub product: Product,
    pub resolved_by: ResolvedBy,
}

#[derive(Debug, Clone, Default)]
pub struct ProductResolver {
    config: ProductResolverConfig,
}

impl ProductResolver {
    pub fn new(config: ProductResolverConfig) -> Self {
        Self { config }
    }

    /// Work out what `session` bought for a user currently holding `current`
    pub fn resolve(
        &self,
        session: &PaymentSession,
        current: &EntitlementRecord,
    ) -> BillingResult<Resolution> {
        if let Some(product) = from_metadata(session) {
            return Ok(found(product, ResolvedBy::Metadata));
        }

        if let Some(product) = session
            .price_ids
            .iter()
            .find_map(|price| self.config.price_ids.get(price).copied())
        {
            return Ok(found(product, ResolvedBy::PriceId));
        }

        let Some(amount) = session.amount_total_cents.filter(|a| *a > 0) else {
            return Err(self.indeterminate(session, "no metadata, price id or amount"));
        };

        if let Some(tier) = upgrade_target_for_amount(current, amount) {
            return Ok(found(Product::Tier(tier), ResolvedBy::UpgradeAmount));
        }
        if let Some(product) = product_for_list_price(amount) {
            return Ok(found(product, ResolvedBy::Amount));
        }

        if let Some(threshold) = self.config.highest_tier_threshold_cents {
            if amount >= threshold {
                tracing::error!(
                    session_id = %session.id,
                    amount_cents = amount,
                    threshold_cents = threshold,
                    "Granting highest tier from amount threshold - session has no product metadata"
                );
                return Ok(found(Product::Tier(Tier::Ultimate), ResolvedBy::AmountThreshold));
            }
        }

        Err(self.indeterminate(session, "amount matches no catalog price"))
    }

    fn indeterminate(&self, session: &PaymentSession, reason: &str) -> BillingError {
        tracing::error!(
            session_id = %session.id,
            amount_cents = ?session.amount_total_cents,
            price_ids = ?session.price_ids,
            reason = %reason,
            "IndeterminateProduct: paid session could not be mapped to a product"
        );
        BillingError::IndeterminateProduct(format!("session {}: {}", session.id, reason))
    }
}

fn found(product: Product, resolved_by: ResolvedBy) -> Resolution {
    Resolution {
        product,
        resolved_by,
    }
}

fn from_metadata(session: &PaymentSession) -> Option<Product> {
    let meta = &session.metadata;

    if let (Some(kind), Some(id)) = (
        meta.get(metadata::PRODUCT_TYPE),
        meta.get(metadata::PRODUCT_ID),
    ) {
        if let Some(product) = Product::parse(kind, id) {
            return Some(product);
        }
        tracing::warn!(
            session_id = %session.id,
            product_type = %kind,
            product_id = %id,
            "Unknown product in session metadata"
        );
    }

    if let Some(addon) = meta
        .get(metadata::LEGACY_ADDON)
        .and_then(|a| a.parse::<Addon>().ok())
    {
        return Some(Product::Addon(addon));
    }
    meta.get(metadata::LEGACY_TIER)
        .and_then(|t| t.parse::<Tier>().ok())
        .filter(Tier::is_paid)
        .map(Product::Tier)
}

/// A prorated upgrade charge from the user's current tier
fn upgrade_target_for_amount(current: &EntitlementRecord, amount: i64) -> Option<Tier> {
    if !current.tier.is_paid() {
        return None;
    }
    let paid = current.amount_already_paid();
    Tier::ALL
        .into_iter()
        .filter(|t| *t > current.tier)
        .find(|t| price_for(*t) - paid == amount)
}

fn product_for_list_price(amount: i64) -> Option<Product> {
    Tier::ALL
        .into_iter()
        .filter(Tier::is_paid)
        .map(Product::Tier)
        .chain(Addon::ALL.into_iter().map(Product::Addon))
        .find(|p| p.list_price() == amount)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use time::OffsetDateTime;
    use uuid::Uuid;

    fn session(amount: Option<i64>) -> PaymentSession {
        PaymentSession {
            id: "cs_test_r".into(),
            paid: true,
            customer_id: None,
            customer_email: None,
            amount_total_cents: amount,
            currency: Some("usd".into()),
            created: 0,
            metadata: HashMap::new(),
            price_ids: vec![],
            client_reference_id: None,
        }
    }

    fn free() -> EntitlementRecord {
        EntitlementRecord::free(Uuid::new_v4())
    }

    #[test]
    fn test_metadata_wins() {
        let mut s = session(Some(3_900));
        s.metadata.insert("product_type".into(), "tier".into());
        s.metadata.insert("product_id".into(), "pro".into());

        let r = ProductResolver::default().resolve(&s, &free()).unwrap();
        assert_eq!(r.product, Product::Tier(Tier::Pro));
        assert_eq!(r.resolved_by, ResolvedBy::Metadata);
    }

    #[test]
    fn test_legacy_tier_alias() {
        let mut s = session(None);
        s.metadata.insert("tier".into(), "tier3".into());
        let r = ProductResolver::default().resolve(&s, &free()).unwrap();
        assert_eq!(r.product, Product::Tier(Tier::Ultimate));
    }

    #[test]
    fn test_price_id_table() {
        let mut config = ProductResolverConfig::default();
        config
            .price_ids
            .insert("price_abc".into(), Product::Addon(Addon::ApiAccess));
        let mut s = session(Some(1));
        s.price_ids.push("price_abc".into());

        let r = ProductResolver::new(config).resolve(&s, &free()).unwrap();
        assert_eq!(r.product, Product::Addon(Addon::ApiAccess));
        assert_eq!(r.resolved_by, ResolvedBy::PriceId);
    }

    #[test]
    fn test_amount_heuristics() {
        let resolver = ProductResolver::default();
        assert_eq!(
            resolver.resolve(&session(Some(8_900)), &free()).unwrap().product,
            Product::Tier(Tier::Pro)
        );

        let mut starter = free();
        starter.apply_tier_grant(Tier::Starter, "cs_test_1", None, 3_900, OffsetDateTime::now_utc());
        let r = resolver.resolve(&session(Some(5_000)), &starter).unwrap();
        assert_eq!(r.product, Product::Tier(Tier::Pro));
        assert_eq!(r.resolved_by, ResolvedBy::UpgradeAmount);
    }

    #[test]
    fn test_unknown_amount_is_indeterminate_without_threshold() {
        let err = ProductResolver::default()
            .resolve(&session(Some(99_999)), &free())
            .unwrap_err();
        assert!(matches!(err, BillingError::IndeterminateProduct(_)));
    }

    #[test]
    fn test_threshold_safety_net_only_when_configured() {
        let resolver = ProductResolver::new(ProductResolverConfig {
            price_ids: HashMap::new(),
            highest_tier_threshold_cents: Some(12_000),
        });
        let r = resolver.resolve(&session(Some(99_999)), &free()).unwrap();
        assert_eq!(r.product, Product::Tier(Tier::Ultimate));
        assert_eq!(r.resolved_by, ResolvedBy::AmountThreshold);

        assert!(resolver.resolve(&session(Some(777)), &free()).is_err());
    }
}
