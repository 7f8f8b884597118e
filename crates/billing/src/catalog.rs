//! Tier and add-on catalog
//!
//! Static product data. Everything here is pure: no I/O, no errors.
//! Prices are in cents.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Sentinel stored for unlimited quotas
pub const UNLIMITED: i64 = -1;

// Feature names
pub const ANALYSES: &str = "analyses";
pub const COMPARISONS: &str = "comparisons";
pub const PDF_EXPORT: &str = "pdf_export";
pub const PRIORITY_SUPPORT: &str = "priority_support";
pub const API_ACCESS: &str = "api_access";
pub const CUSTOM_BRANDING: &str = "custom_branding";

/// Features that are metered and carry usage counters
pub const USAGE_TYPES: [&str; 2] = [ANALYSES, COMPARISONS];

/// Purchasable tiers, ordered from lowest to highest
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    #[default]
    Free,
    Starter,
    Pro,
    Ultimate,
}

impl Tier {
    pub const ALL: [Tier; 4] = [Tier::Free, Tier::Starter, Tier::Pro, Tier::Ultimate];

    pub fn as_str(&self) -> &'static str {
        match self {
            Tier::Free => "free",
            Tier::Starter => "starter",
            Tier::Pro => "pro",
            Tier::Ultimate => "ultimate",
        }
    }

    pub fn is_paid(&self) -> bool {
        *self != Tier::Free
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Tier {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "free" => Ok(Tier::Free),
            "starter" | "tier1" => Ok(Tier::Starter),
            "pro" | "tier2" => Ok(Tier::Pro),
            "ultimate" | "tier3" => Ok(Tier::Ultimate),
            other => Err(format!("unknown tier '{}'", other)),
        }
    }
}

/// A usage quota; serialized as an integer where `-1` means unlimited
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "i64", into = "i64")]
pub enum Quota {
    Limited(u64),
    Unlimited,
}

impl Quota {
    pub fn is_unlimited(&self) -> bool {
        matches!(self, Quota::Unlimited)
    }

    /// Add `amount`; unlimited stays unlimited
    pub fn increased_by(self, amount: u64) -> Quota {
        match self {
            Quota::Limited(n) => Quota::Limited(n.saturating_add(amount)),
            Quota::Unlimited => Quota::Unlimited,
        }
    }
}

impl From<i64> for Quota {
    fn from(value: i64) -> Self {
        if value < 0 {
            Quota::Unlimited
        } else {
            Quota::Limited(value as u64)
        }
    }
}

impl From<Quota> for i64 {
    fn from(quota: Quota) -> Self {
        match quota {
            Quota::Limited(n) => i64::try_from(n).unwrap_or(i64::MAX),
            Quota::Unlimited => UNLIMITED,
        }
    }
}

/// Value of a single feature: an on/off flag or a quota
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Capability {
    Flag(bool),
    Quota(Quota),
}

impl Capability {
    pub fn as_quota(&self) -> Option<Quota> {
        match self {
            Capability::Quota(q) => Some(*q),
            Capability::Flag(_) => None,
        }
    }

    pub fn is_enabled(&self) -> bool {
        match self {
            Capability::Flag(on) => *on,
            Capability::Quota(Quota::Limited(n)) => *n > 0,
            Capability::Quota(Quota::Unlimited) => true,
        }
    }
}

pub type FeatureSet = BTreeMap<String, Capability>;

/// Catalog feature set for a tier
pub fn features_for(tier: Tier) -> FeatureSet {
    let (analyses, comparisons, pdf, priority, api, branding) = match tier {
        Tier::Free => (1, 0, false, false, false, false),
        Tier::Starter => (3, 5, true, false, false, false),
        Tier::Pro => (10, 25, true, true, false, false),
        Tier::Ultimate => (UNLIMITED, UNLIMITED, true, true, true, true),
    };

    let mut features = FeatureSet::new();
    features.insert(ANALYSES.into(), Capability::Quota(analyses.into()));
    features.insert(COMPARISONS.into(), Capability::Quota(comparisons.into()));
    features.insert(PDF_EXPORT.into(), Capability::Flag(pdf));
    features.insert(PRIORITY_SUPPORT.into(), Capability::Flag(priority));
    features.insert(API_ACCESS.into(), Capability::Flag(api));
    features.insert(CUSTOM_BRANDING.into(), Capability::Flag(branding));
    features
}

/// Catalog price of a tier in cents
pub fn price_for(tier: Tier) -> i64 {
    match tier {
        Tier::Free => 0,
        Tier::Starter => 3_900,
        Tier::Pro => 8_900,
        Tier::Ultimate => 14_900,
    }
}

/// One-off add-ons purchasable on top of a tier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Addon {
    ExtraAnalyses,
    ExtraComparisons,
    PrioritySupport,
    ApiAccess,
}

impl Addon {
    pub const ALL: [Addon; 4] = [
        Addon::ExtraAnalyses,
        Addon::ExtraComparisons,
        Addon::PrioritySupport,
        Addon::ApiAccess,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Addon::ExtraAnalyses => "extra_analyses",
            Addon::ExtraComparisons => "extra_comparisons",
            Addon::PrioritySupport => "priority_support",
            Addon::ApiAccess => "api_access",
        }
    }

    pub fn price(&self) -> i64 {
        match self {
            Addon::ExtraAnalyses => 1_900,
            Addon::ExtraComparisons => 1_500,
            Addon::PrioritySupport => 2_900,
            Addon::ApiAccess => 4_900,
        }
    }
}

impl fmt::Display for Addon {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Addon {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Addon::ALL
            .into_iter()
            .find(|a| a.as_str() == s.trim())
            .ok_or_else(|| format!("unknown addon '{}'", s))
    }
}

/// What an add-on does to an entitlement
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddonEffect {
    /// Add `amount` to a quota feature; unlimited stays unlimited
    Increment { feature: &'static str, amount: u64 },
    /// Turn a boolean feature on
    Unlock { feature: &'static str },
}

pub fn addon_effect(addon: Addon) -> AddonEffect {
    match addon {
        Addon::ExtraAnalyses => AddonEffect::Increment {
            feature: ANALYSES,
            amount: 5,
        },
        Addon::ExtraComparisons => AddonEffect::Increment {
            feature: COMPARISONS,
            amount: 10,
        },
        Addon::PrioritySupport => AddonEffect::Unlock {
            feature: PRIORITY_SUPPORT,
        },
        Addon::ApiAccess => AddonEffect::Unlock {
            feature: API_ACCESS,
        },
    }
}

/// Anything a payment session can buy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", content = "id", rename_all = "snake_case")]
pub enum Product {
    Tier(Tier),
    Addon(Addon),
}

impl Product {
    pub fn product_type(&self) -> &'static str {
        match self {
            Product::Tier(_) => "tier",
            Product::Addon(_) => "addon",
        }
    }

    pub fn product_id(&self) -> &'static str {
        match self {
            Product::Tier(t) => t.as_str(),
            Product::Addon(a) => a.as_str(),
        }
    }

    pub fn list_price(&self) -> i64 {
        match self {
            Product::Tier(t) => price_for(*t),
            Product::Addon(a) => a.price(),
        }
    }

    /// Rebuild from the `(product_type, product_id)` pair carried in metadata
    pub fn parse(product_type: &str, product_id: &str) -> Option<Product> {
        match product_type.trim() {
            "tier" => product_id.parse().ok().map(Product::Tier),
            "addon" => product_id.parse().ok().map(Product::Addon),
            _ => None,
        }
    }
}

impl fmt::Display for Product {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.product_type(), self.product_id())
    }
}
