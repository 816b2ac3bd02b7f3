//! Tier catalog: immutable table of plan economics.
//!
//! Built once at startup (built-in table or `TIER_CATALOG_PATH` JSON) and
//! shared as `Arc<TierCatalog>`. Nothing mutates it after boot.

use std::collections::HashMap;

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::errors::AppError;

/// Tier ids exempt from the positive-price rule.
pub const FREE_TIER_ID: &str = "free";
pub const CUSTOM_TIER_ID: &str = "custom";

/// A per-period count that may be unlimited. Encoded as an integer on the
/// wire and in config, with `-1` meaning unlimited.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "i32", into = "i32")]
pub enum Quota {
    Limited(i32),
    Unlimited,
}

impl Quota {
    pub fn is_unlimited(&self) -> bool {
        matches!(self, Quota::Unlimited)
    }

    /// Clamps `value` to the quota; unlimited leaves it unchanged.
    pub fn cap(&self, value: i32) -> i32 {
        match self {
            Quota::Limited(max) => value.min(*max),
            Quota::Unlimited => value,
        }
    }
}

impl TryFrom<i32> for Quota {
    type Error = String;

    fn try_from(value: i32) -> Result<Self, Self::Error> {
        match value {
            -1 => Ok(Quota::Unlimited),
            v if v >= 0 => Ok(Quota::Limited(v)),
            v => Err(format!("quota must be >= 0 or -1 for unlimited, got {v}")),
        }
    }
}

impl From<Quota> for i32 {
    fn from(quota: Quota) -> Self {
        match quota {
            Quota::Limited(v) => v,
            Quota::Unlimited => -1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TierKind {
    /// Monthly subscription with an allowance that rolls over.
    Subscription,
    /// One-time purchase; `monthly_allowance` is the number of credits granted.
    CreditPack,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tier {
    pub id: String,
    pub name: String,
    pub kind: TierKind,
    pub monthly_price_cents: i64,
    pub monthly_allowance: Quota,
    pub rollover_cap: Quota,
}

impl Tier {
    pub fn is_subscription(&self) -> bool {
        self.kind == TierKind::Subscription
    }

    fn is_price_exempt(&self) -> bool {
        self.id == FREE_TIER_ID || self.id == CUSTOM_TIER_ID
    }

    fn check(&self) -> Result<(), AppError> {
        if self.id.trim().is_empty() {
            return Err(AppError::InvalidTier("tier id must not be empty".to_string()));
        }
        if !self.is_price_exempt() && self.monthly_price_cents <= 0 {
            return Err(AppError::InvalidTier(format!(
                "tier '{}' must have a positive price",
                self.id
            )));
        }
        if self.kind == TierKind::CreditPack && self.monthly_allowance.is_unlimited() {
            return Err(AppError::InvalidTier(format!(
                "credit pack '{}' must grant a finite number of credits",
                self.id
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct TierCatalog {
    tiers: HashMap<String, Tier>,
}

impl TierCatalog {
    /// Builds a catalog, rejecting duplicate ids and invalid pricing up front.
    pub fn from_tiers(tiers: Vec<Tier>) -> Result<Self, AppError> {
        let mut map = HashMap::with_capacity(tiers.len());
        for tier in tiers {
            tier.check()?;
            if map.contains_key(&tier.id) {
                return Err(AppError::InvalidTier(format!(
                    "duplicate tier id '{}'",
                    tier.id
                )));
            }
            map.insert(tier.id.clone(), tier);
        }
        Ok(Self { tiers: map })
    }

    /// The catalog the product ships with.
    pub fn builtin() -> Self {
        let tiers = vec![
            subscription(FREE_TIER_ID, "Free", 0, Quota::Limited(3), Quota::Limited(0)),
            subscription("flow_starter", "Flow Starter", 1_200, Quota::Limited(15), Quota::Limited(5)),
            subscription("flow_pro", "Flow Pro", 2_900, Quota::Limited(60), Quota::Limited(30)),
            subscription(CUSTOM_TIER_ID, "Custom", 0, Quota::Unlimited, Quota::Unlimited),
            credit_pack("credits_5", "5 Analysis Credits", 500, 5),
            credit_pack("credits_20", "20 Analysis Credits", 1_600, 20),
        ];
        let tiers = tiers.into_iter().map(|t| (t.id.clone(), t)).collect();
        Self { tiers }
    }

    /// Loads the catalog from a JSON file, or the built-in table when no path is set.
    pub fn load(path: Option<&str>) -> anyhow::Result<Self> {
        let Some(path) = path else {
            return Ok(Self::builtin());
        };
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read tier catalog '{path}'"))?;
        let tiers: Vec<Tier> = serde_json::from_str(&raw)
            .with_context(|| format!("Tier catalog '{path}' is not valid JSON"))?;
        Self::from_tiers(tiers).map_err(|e| anyhow::anyhow!("Invalid tier catalog '{path}': {e}"))
    }

    pub fn get_tier(&self, id: &str) -> Option<&Tier> {
        self.tiers.get(id)
    }

    /// Looks up a tier that may be sold, rejecting unknown ids.
    pub fn validate(&self, id: &str) -> Result<&Tier, AppError> {
        let tier = self
            .get_tier(id)
            .ok_or_else(|| AppError::InvalidTier(format!("unknown tier '{id}'")))?;
        tier.check()?;
        Ok(tier)
    }

    /// Like `validate`, but the tier must be a subscription plan.
    pub fn validate_subscription(&self, id: &str) -> Result<&Tier, AppError> {
        let tier = self.validate(id)?;
        if !tier.is_subscription() {
            return Err(AppError::InvalidTier(format!(
                "tier '{id}' is a credit pack, not a subscription"
            )));
        }
        Ok(tier)
    }

    pub fn len(&self) -> usize {
        self.tiers.len()
    }
}

fn subscription(id: &str, name: &str, price: i64, allowance: Quota, rollover: Quota) -> Tier {
    Tier {
        id: id.to_string(),
        name: name.to_string(),
        kind: TierKind::Subscription,
        monthly_price_cents: price,
        monthly_allowance: allowance,
        rollover_cap: rollover,
    }
}

fn credit_pack(id: &str, name: &str, price: i64, credits: i32) -> Tier {
    Tier {
        id: id.to_string(),
        name: name.to_string(),
        kind: TierKind::CreditPack,
        monthly_price_cents: price,
        monthly_allowance: Quota::Limited(credits),
        rollover_cap: Quota::Limited(0),
    }
}
