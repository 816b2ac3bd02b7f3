use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Funding source debited for one paid action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UsageSource {
    Subscription,
    Credit,
}

impl UsageSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            UsageSource::Subscription => "subscription",
            UsageSource::Credit => "credit",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "subscription" => Some(UsageSource::Subscription),
            "credit" => Some(UsageSource::Credit),
            _ => None,
        }
    }
}

/// Append-only audit row written for every successful debit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageEvent {
    pub id: Uuid,
    pub user_id: Uuid,
    pub source: UsageSource,
    pub amount: i32,
    pub subscription_id: Option<Uuid>,
    pub correlation_id: Uuid,
    pub occurred_at: DateTime<Utc>,
}

/// Usage row to append alongside a debit.
#[derive(Debug, Clone)]
pub struct NewUsageEvent {
    pub user_id: Uuid,
    pub correlation_id: Uuid,
}
