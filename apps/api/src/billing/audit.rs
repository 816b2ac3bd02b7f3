//! Audit trail for subscription and credit mutations.
//!
//! Every state change is emitted on the `billing::audit` target with the
//! actor, the cause, and before/after snapshots.

use std::fmt;

use serde_json::json;
use uuid::Uuid;

use crate::models::subscription::Subscription;

/// Who initiated a state change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Actor {
    /// A direct API call on behalf of the user.
    User(Uuid),
    /// A billing-provider webhook event.
    BillingProvider { event_id: String },
    /// The background renewal sweep.
    Scheduler,
}

impl fmt::Display for Actor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Actor::User(id) => write!(f, "user:{id}"),
            Actor::BillingProvider { event_id } => write!(f, "provider:{event_id}"),
            Actor::Scheduler => f.write_str("scheduler"),
        }
    }
}

fn snapshot(sub: &Subscription) -> serde_json::Value {
    json!({
        "tier_id": sub.tier_id,
        "status": sub.status,
        "current_period_start": sub.current_period_start,
        "current_period_end": sub.current_period_end,
        "analyses_used_this_period": sub.analyses_used_this_period,
        "analyses_rollover": sub.analyses_rollover,
        "cancel_at_period_end": sub.cancel_at_period_end,
        "version": sub.version,
    })
}

pub fn subscription_changed(
    actor: &Actor,
    cause: &str,
    before: Option<&Subscription>,
    after: &Subscription,
) {
    let before = before.map(snapshot).unwrap_or(serde_json::Value::Null);
    tracing::info!(
        target: "billing::audit",
        actor = %actor,
        cause,
        subscription_id = %after.id,
        user_id = %after.user_id,
        before = %before,
        after = %snapshot(after),
        "subscription state changed"
    );
}

pub fn credits_changed(actor: &Actor, cause: &str, user_id: Uuid, before: i32, after: i32) {
    tracing::info!(
        target: "billing::audit",
        actor = %actor,
        cause,
        user_id = %user_id,
        before,
        after,
        "credit balance changed"
    );
}

/// Allowance remaining before and after a debit; `None` when unlimited.
pub fn allowance_changed(
    actor: &Actor,
    cause: &str,
    subscription_id: Uuid,
    before: Option<i32>,
    after: Option<i32>,
) {
    tracing::info!(
        target: "billing::audit",
        actor = %actor,
        cause,
        subscription_id = %subscription_id,
        before = ?before,
        after = ?after,
        "subscription allowance changed"
    );
}
