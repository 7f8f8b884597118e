//! Upgrade proration
//!
//! One-time purchases only: moving from tier T1 to a higher T2 costs the
//! difference between T2's list price and what was already paid toward T1.

use serde::Serialize;
use thiserror::Error;

use crate::catalog::{price_for, Quota, Tier};
use crate::entitlement::EntitlementRecord;

#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum ProrationError {
    #[error("tier {tier} is already owned")]
    AlreadyOwned { tier: Tier },

    #[error("cannot downgrade from {current} to {requested}")]
    CannotDowngrade { current: Tier, requested: Tier },

    #[error("upgrade to {requested} already covered ({paid_cents} paid, price {price_cents})")]
    AlreadyCovered {
        requested: Tier,
        paid_cents: i64,
        price_cents: i64,
    },
}

/// Price of moving to a higher tier
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UpgradeQuote {
    pub from: Tier,
    pub to: Tier,
    pub list_price_cents: i64,
    pub already_paid_cents: i64,
    pub charge_cents: i64,
    /// False for a first purchase from the free tier
    pub is_upgrade: bool,
}

/// Pure proration math
pub fn upgrade_charge(
    current: Tier,
    already_paid_cents: i64,
    target: Tier,
) -> Result<UpgradeQuote, ProrationError> {
    if target == current {
        return Err(ProrationError::AlreadyOwned { tier: target });
    }
    if target < current {
        return Err(ProrationError::CannotDowngrade {
            current,
            requested: target,
        });
    }

    let list_price = price_for(target);
    let already_paid = if current.is_paid() {
        already_paid_cents.max(0)
    } else {
        0
    };
    let charge = list_price - already_paid;
    if charge <= 0 {
        return Err(ProrationError::AlreadyCovered {
            requested: target,
            paid_cents: already_paid,
            price_cents: list_price,
        });
    }

    Ok(UpgradeQuote {
        from: current,
        to: target,
        list_price_cents: list_price,
        already_paid_cents: already_paid,
        charge_cents: charge,
        is_upgrade: current.is_paid(),
    })
}

/// Quote an upgrade for a user's current entitlement
pub fn quote(record: &EntitlementRecord, target: Tier) -> Result<UpgradeQuote, ProrationError> {
    upgrade_charge(record.tier, record.amount_already_paid(), target)
}

/// Remaining quota after moving to a tier with `new_quota`, keeping lifetime usage.
///
/// Unlimited absorbs any prior usage.
pub fn carry_over_remaining(new_quota: Quota, used: u64) -> Quota {
    match new_quota {
        Quota::Unlimited => Quota::Unlimited,
        Quota::Limited(limit) => Quota::Limited(limit.saturating_sub(used)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::ANALYSES;
    use crate::entitlement::UsageCounter;
    use time::OffsetDateTime;
    use uuid::Uuid;

    #[test]
    fn test_upgrade_charges_difference() {
        let mut record = EntitlementRecord::free(Uuid::new_v4());
        record.apply_tier_grant(Tier::Starter, "cs_test_1", None, 3_900, OffsetDateTime::now_utc());

        let quote = quote(&record, Tier::Pro).unwrap();
        assert_eq!(quote.charge_cents, 5_000);
        assert!(quote.is_upgrade);
    }

    #[test]
    fn test_buying_same_tier_again_is_already_owned() {
        let mut record = EntitlementRecord::free(Uuid::new_v4());
        record.apply_tier_grant(Tier::Starter, "cs_test_1", None, 3_900, OffsetDateTime::now_utc());
        record.apply_tier_grant(Tier::Pro, "cs_test_2", None, 5_000, OffsetDateTime::now_utc());

        assert_eq!(
            quote(&record, Tier::Pro),
            Err(ProrationError::AlreadyOwned { tier: Tier::Pro })
        );
    }

    #[test]
    fn test_downgrade_rejected() {
        assert_eq!(
            upgrade_charge(Tier::Ultimate, 14_900, Tier::Starter),
            Err(ProrationError::CannotDowngrade {
                current: Tier::Ultimate,
                requested: Tier::Starter
            })
        );
    }

    #[test]
    fn test_overpaid_upgrade_is_already_covered() {
        let err = upgrade_charge(Tier::Starter, 9_000, Tier::Pro).unwrap_err();
        assert!(matches!(err, ProrationError::AlreadyCovered { .. }));
    }

    #[test]
    fn test_first_purchase_from_free_is_full_price() {
        let quote = upgrade_charge(Tier::Free, 0, Tier::Starter).unwrap();
        assert_eq!(quote.charge_cents, 3_900);
        assert!(!quote.is_upgrade);
    }

    #[test]
    fn test_carry_over_floors_at_zero() {
        assert_eq!(carry_over_remaining(Quota::Limited(10), 4), Quota::Limited(6));
        assert_eq!(carry_over_remaining(Quota::Limited(3), 7), Quota::Limited(0));
    }

    #[test]
    fn test_unlimited_absorbs_prior_usage() {
        let mut record = EntitlementRecord::free(Uuid::new_v4());
        record.apply_tier_grant(Tier::Starter, "cs_test_1", None, 3_900, OffsetDateTime::now_utc());
        // 1 of 3 used, 2 remaining
        record.usage_counters.insert(
            ANALYSES.into(),
            UsageCounter {
                used: 1,
                remaining: Quota::Limited(2),
            },
        );

        record.apply_tier_grant(Tier::Ultimate, "cs_test_2", None, 11_000, OffsetDateTime::now_utc());
        assert_eq!(record.usage_counters[ANALYSES].remaining, Quota::Unlimited);
        assert_eq!(record.usage_counters[ANALYSES].used, 1);
    }

    #[test]
    fn test_upgrade_preserves_lifetime_usage() {
        let mut record = EntitlementRecord::free(Uuid::new_v4());
        record.apply_tier_grant(Tier::Starter, "cs_test_1", None, 3_900, OffsetDateTime::now_utc());
        record.usage_counters.insert(
            ANALYSES.into(),
            UsageCounter {
                used: 3,
                remaining: Quota::Limited(0),
            },
        );

        record.apply_tier_grant(Tier::Pro, "cs_test_2", None, 5_000, OffsetDateTime::now_utc());
        assert_eq!(record.usage_counters[ANALYSES].remaining, Quota::Limited(7));
    }
}
