use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Subscription status. Closed set; every handler matches it exhaustively.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    Active,
    PastDue,
    Canceled,
    Paused,
}

impl SubscriptionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubscriptionStatus::Active => "active",
            SubscriptionStatus::PastDue => "past_due",
            SubscriptionStatus::Canceled => "canceled",
            SubscriptionStatus::Paused => "paused",
        }
    }

    /// Parses the column value written by `as_str`.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "active" => Some(SubscriptionStatus::Active),
            "past_due" => Some(SubscriptionStatus::PastDue),
            "canceled" => Some(SubscriptionStatus::Canceled),
            "paused" => Some(SubscriptionStatus::Paused),
            _ => None,
        }
    }

    /// Maps a billing-provider status string onto the local set.
    /// Returns `None` for strings the provider is not known to send.
    pub fn from_provider(s: &str) -> Option<Self> {
        match s {
            "active" | "trialing" => Some(SubscriptionStatus::Active),
            "past_due" | "unpaid" | "incomplete" => Some(SubscriptionStatus::PastDue),
            "canceled" | "cancelled" | "incomplete_expired" => Some(SubscriptionStatus::Canceled),
            "paused" => Some(SubscriptionStatus::Paused),
            _ => None,
        }
    }
}

impl std::fmt::Display for SubscriptionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subscription {
    pub id: Uuid,
    pub user_id: Uuid,
    pub tier_id: String,
    pub status: SubscriptionStatus,
    pub current_period_start: DateTime<Utc>,
    pub current_period_end: DateTime<Utc>,
    /// Day of month periods renew on, clamped in short months.
    pub billing_anchor_day: i32,
    pub analyses_used_this_period: i32,
    pub analyses_rollover: i32,
    pub cancel_at_period_end: bool,
    pub canceled_at: Option<DateTime<Utc>>,
    pub external_subscription_ref: String,
    /// Provider timestamp of the newest absolute state applied.
    pub last_event_at: Option<DateTime<Utc>>,
    /// Optimistic-lock counter, bumped by every write.
    pub version: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewSubscription {
    pub user_id: Uuid,
    pub tier_id: String,
    pub external_subscription_ref: String,
    pub current_period_start: DateTime<Utc>,
    pub current_period_end: DateTime<Utc>,
    pub billing_anchor_day: i32,
}

/// Partial update. Absent fields are left untouched.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SubscriptionUpdate {
    pub tier_id: Option<String>,
    pub status: Option<SubscriptionStatus>,
    pub cancel_at_period_end: Option<bool>,
}

impl SubscriptionUpdate {
    pub fn is_empty(&self) -> bool {
        self.tier_id.is_none() && self.status.is_none() && self.cancel_at_period_end.is_none()
    }
}
