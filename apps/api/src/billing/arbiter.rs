//! Usage Entitlement Arbiter.
//!
//! The single choke point for paid actions. Subscription allowance is spent
//! before prepaid credits. Every debit is a conditional write in the store,
//! so two concurrent requests can never both spend the last unit.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::billing::credits::CreditLedger;
use crate::billing::store::{with_deadline, Consumption};
use crate::billing::subscriptions::{remaining_allowance, SubscriptionManager};
use crate::billing::tiers::Quota;
use crate::errors::AppError;
use crate::models::subscription::{Subscription, SubscriptionStatus};
use crate::models::usage::UsageSource;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EntitlementSource {
    Subscription,
    Credit,
    None,
}

impl From<UsageSource> for EntitlementSource {
    fn from(source: UsageSource) -> Self {
        match source {
            UsageSource::Subscription => EntitlementSource::Subscription,
            UsageSource::Credit => EntitlementSource::Credit,
        }
    }
}

/// Answer to "may this user perform one analysis?". `remaining` is `-1`
/// on the wire when unlimited.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct EntitlementCheck {
    pub can_use: bool,
    pub source: EntitlementSource,
    pub remaining: Quota,
}

impl EntitlementCheck {
    pub fn denied() -> Self {
        Self {
            can_use: false,
            source: EntitlementSource::None,
            remaining: Quota::Limited(0),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SubscriptionSummary {
    pub id: Uuid,
    pub tier_id: String,
    pub status: SubscriptionStatus,
    pub current_period_start: DateTime<Utc>,
    pub current_period_end: DateTime<Utc>,
    pub monthly_allowance: Option<Quota>,
    pub analyses_used_this_period: i32,
    pub analyses_rollover: i32,
    pub cancel_at_period_end: bool,
}

/// Combined subscription and credit view for a user.
#[derive(Debug, Clone, Serialize)]
pub struct EntitlementStatus {
    pub user_id: Uuid,
    pub subscription: Option<SubscriptionSummary>,
    pub credit_balance: i32,
    pub entitlement: EntitlementCheck,
}

fn quota_from(remaining: Option<i32>) -> Quota {
    match remaining {
        Some(n) => Quota::Limited(n.max(0)),
        None => Quota::Unlimited,
    }
}

#[derive(Clone)]
pub struct EntitlementArbiter {
    subscriptions: SubscriptionManager,
    credits: CreditLedger,
    store_timeout: Duration,
}

impl EntitlementArbiter {
    pub fn new(
        subscriptions: SubscriptionManager,
        credits: CreditLedger,
        store_timeout: Duration,
    ) -> Self {
        Self {
            subscriptions,
            credits,
            store_timeout,
        }
    }

    /// Read-only entitlement check. A store timeout yields a denial rather
    /// than an error.
    pub async fn check(&self, user_id: Uuid) -> Result<EntitlementCheck, AppError> {
        match with_deadline(self.store_timeout, self.evaluate(user_id)).await {
            Err(AppError::StoreTimeout) => {
                warn!(user_id = %user_id, "Entitlement check timed out, denying");
                Ok(EntitlementCheck::denied())
            }
            other => other,
        }
    }

    async fn evaluate(&self, user_id: Uuid) -> Result<EntitlementCheck, AppError> {
        if let Some(sub) = self.subscriptions.active_for_user(user_id).await? {
            if let Some(remaining) = self.subscription_remaining(&sub) {
                if remaining.map_or(true, |r| r > 0) {
                    return Ok(EntitlementCheck {
                        can_use: true,
                        source: EntitlementSource::Subscription,
                        remaining: quota_from(remaining),
                    });
                }
            }
        }

        let balance = self.credits.balance(user_id).await?;
        if balance > 0 {
            return Ok(EntitlementCheck {
                can_use: true,
                source: EntitlementSource::Credit,
                remaining: Quota::Limited(balance),
            });
        }
        Ok(EntitlementCheck::denied())
    }

    /// `Some(None)` for unlimited, `None` when the tier is missing.
    fn subscription_remaining(&self, sub: &Subscription) -> Option<Option<i32>> {
        match self.subscriptions.tier_for(sub) {
            Ok(tier) => Some(remaining_allowance(sub, tier)),
            Err(e) => {
                warn!(subscription_id = %sub.id, error = %e, "Skipping subscription with unknown tier");
                None
            }
        }
    }

    /// Re-checks and debits one unit atomically, subscription first.
    #[instrument(skip(self))]
    pub async fn consume(
        &self,
        user_id: Uuid,
        correlation_id: Uuid,
    ) -> Result<Consumption, AppError> {
        let consumption =
            with_deadline(self.store_timeout, self.debit(user_id, correlation_id)).await?;
        info!(
            usage_event_id = %consumption.event.id,
            source = consumption.event.source.as_str(),
            remaining = ?consumption.remaining,
            "Entitlement consumed"
        );
        Ok(consumption)
    }

    async fn debit(&self, user_id: Uuid, correlation_id: Uuid) -> Result<Consumption, AppError> {
        let active = self.subscriptions.active_for_user(user_id).await?;
        if let Some(sub) = &active {
            if self.subscriptions.tier_for(sub).is_ok() {
                if let Some(consumption) = self
                    .subscriptions
                    .consume_allowance(sub, correlation_id)
                    .await?
                {
                    return Ok(consumption);
                }
            }
        }

        match self.credits.consume(user_id, correlation_id).await {
            Ok(consumption) => Ok(consumption),
            Err(AppError::InsufficientCredits) if active.is_some() => {
                Err(AppError::EntitlementExhausted)
            }
            Err(e) => Err(e),
        }
    }

    pub async fn status(&self, user_id: Uuid) -> Result<EntitlementStatus, AppError> {
        let latest = with_deadline(
            self.store_timeout,
            self.subscriptions.latest_for_user(user_id),
        )
        .await?;
        let credit_balance =
            with_deadline(self.store_timeout, self.credits.balance(user_id)).await?;
        let entitlement = self.check(user_id).await?;

        let subscription = latest.map(|sub| SubscriptionSummary {
            monthly_allowance: self
                .subscriptions
                .tier_for(&sub)
                .ok()
                .map(|tier| tier.monthly_allowance),
            id: sub.id,
            tier_id: sub.tier_id,
            status: sub.status,
            current_period_start: sub.current_period_start,
            current_period_end: sub.current_period_end,
            analyses_used_this_period: sub.analyses_used_this_period,
            analyses_rollover: sub.analyses_rollover,
            cancel_at_period_end: sub.cancel_at_period_end,
        });

        Ok(EntitlementStatus {
            user_id,
            subscription,
            credit_balance,
            entitlement,
        })
    }
}
