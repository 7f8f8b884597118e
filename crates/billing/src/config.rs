//! Billing configuration loaded from the environment

use std::collections::HashMap;
use std::time::Duration;

use crate::catalog::{Addon, Product, Tier};
use crate::error::{BillingError, BillingResult};
use crate::grant_lock::DEFAULT_LOCK_TTL;

/// Stripe credentials and call limits
#[derive(Debug, Clone)]
pub struct StripeConfig {
    pub secret_key: String,
    pub webhook_secret: String,
    /// Deadline for every processor query
    pub api_timeout: Duration,
}

impl StripeConfig {
    pub fn from_env() -> BillingResult<Self> {
        let secret_key = std::env::var("STRIPE_SECRET_KEY")
            .map_err(|_| BillingError::Config("STRIPE_SECRET_KEY not set".into()))?;
        let webhook_secret = std::env::var("STRIPE_WEBHOOK_SECRET")
            .map_err(|_| BillingError::Config("STRIPE_WEBHOOK_SECRET not set".into()))?;

        Ok(Self {
            secret_key,
            webhook_secret,
            api_timeout: Duration::from_secs(env_parse("STRIPE_API_TIMEOUT_SECS", 10)?),
        })
    }
}

/// Lookup tables for turning a paid session into a catalog product
#[derive(Debug, Clone, Default)]
pub struct ProductResolverConfig {
    pub price_ids: HashMap<String, Product>,
    /// Payments at or above this amount with no other signal are treated as the
    /// highest tier. Off unless configured.
    pub highest_tier_threshold_cents: Option<i64>,
}

impl ProductResolverConfig {
    /// `TIER_PRICE_IDS=price_a=starter,price_b=pro` and `ADDON_PRICE_IDS=price_c=api_access`
    pub fn from_env() -> BillingResult<Self> {
        let mut price_ids = HashMap::new();

        if let Ok(raw) = std::env::var("TIER_PRICE_IDS") {
            for (price, name) in parse_pairs(&raw)? {
                let tier: Tier = name.parse().map_err(BillingError::Config)?;
                price_ids.insert(price, Product::Tier(tier));
            }
        }
        if let Ok(raw) = std::env::var("ADDON_PRICE_IDS") {
            for (price, name) in parse_pairs(&raw)? {
                let addon: Addon = name.parse().map_err(BillingError::Config)?;
                price_ids.insert(price, Product::Addon(addon));
            }
        }

        let highest_tier_threshold_cents = match std::env::var("AMOUNT_FALLBACK_THRESHOLD_CENTS") {
            Ok(raw) => Some(raw.trim().parse::<i64>().map_err(|e| {
                BillingError::Config(format!("AMOUNT_FALLBACK_THRESHOLD_CENTS: {}", e))
            })?),
            Err(_) => None,
        };

        Ok(Self {
            price_ids,
            highest_tier_threshold_cents,
        })
    }
}

/// Knobs for the grant engine and retry queue
#[derive(Debug, Clone)]
pub struct GrantConfig {
    pub lock_ttl: Duration,
    pub audit_cap: usize,
    pub self_heal_cooldown: Duration,
    pub processor_timeout: Duration,
    /// Failed attempts allowed before an item is dead-lettered
    pub max_retries: u32,
    /// How many recent sessions a reconcile search inspects
    pub search_limit: u64,
    /// Minimum lock age before reconcile restores a grant missing from the
    /// record, so an in-flight write by the lock winner is not raced
    pub recovery_grace: Duration,
}

impl Default for GrantConfig {
    fn default() -> Self {
        Self {
            lock_ttl: DEFAULT_LOCK_TTL,
            audit_cap: 200,
            self_heal_cooldown: Duration::from_secs(300),
            processor_timeout: Duration::from_secs(10),
            max_retries: 5,
            search_limit: 20,
            recovery_grace: Duration::from_secs(120),
        }
    }
}

impl GrantConfig {
    pub fn from_env() -> BillingResult<Self> {
        let defaults = Self::default();
        Ok(Self {
            lock_ttl: Duration::from_secs(
                env_parse("GRANT_LOCK_TTL_DAYS", 90u64)? * 24 * 60 * 60,
            ),
            audit_cap: env_parse("AUDIT_LOG_CAP", defaults.audit_cap)?,
            self_heal_cooldown: Duration::from_secs(env_parse("SELF_HEAL_COOLDOWN_SECS", 300)?),
            processor_timeout: Duration::from_secs(env_parse("STRIPE_API_TIMEOUT_SECS", 10)?),
            max_retries: defaults.max_retries,
            search_limit: env_parse("RECONCILE_SEARCH_LIMIT", defaults.search_limit)?,
            recovery_grace: Duration::from_secs(env_parse("GRANT_RECOVERY_GRACE_SECS", 120)?),
        })
    }
}

fn env_parse<T>(name: &str, default: T) -> BillingResult<T>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|e| BillingError::Config(format!("{}: {}", name, e))),
        Err(_) => Ok(default),
    }
}

fn parse_pairs(raw: &str) -> BillingResult<Vec<(String, String)>> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|pair| {
            pair.split_once('=')
                .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
                .ok_or_else(|| BillingError::Config(format!("expected price=product, got '{}'", pair)))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_pairs() {
        let pairs = parse_pairs("price_a=starter, price_b = pro ,").unwrap();
        assert_eq!(
            pairs,
            vec![
                ("price_a".to_string(), "starter".to_string()),
                ("price_b".to_string(), "pro".to_string())
            ]
        );
        assert!(parse_pairs("price_a").is_err());
    }

    #[test]
    fn test_defaults() {
        let config = GrantConfig::default();
        assert_eq!(config.max_retries, 5);
        assert_eq!(config.lock_ttl, Duration::from_secs(90 * 86_400));
        assert_eq!(config.recovery_grace, Duration::from_secs(120));
    }
}
