//! Subscription Lifecycle Manager.
//!
//! Owns creation, tier/status changes, cancellation, and monthly renewal with
//! rollover. Every write goes through `mutate`, a compare-and-swap loop on the
//! subscription's `version`, so concurrent writers (webhooks, the sweep,
//! usage debits) never overwrite each other.

use std::sync::Arc;

use chrono::{DateTime, Datelike, Utc};
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::billing::audit::{self, Actor};
use crate::billing::period::{advance_one_month, calendar_month_containing};
use crate::billing::store::{BillingStore, Consumption, Debit};
use crate::billing::tiers::{Quota, Tier, TierCatalog};
use crate::errors::AppError;
use crate::models::subscription::{
    NewSubscription, Subscription, SubscriptionStatus, SubscriptionUpdate,
};
use crate::models::usage::NewUsageEvent;

const MAX_CAS_ATTEMPTS: usize = 3;
/// Most periods a single sweep pass will advance one overdue subscription.
const MAX_CATCH_UP_PERIODS: usize = 12;

enum Mutation {
    Write,
    Unchanged,
}

/// Absolute subscription state reported by the billing provider.
#[derive(Debug, Clone)]
pub struct ProviderState {
    pub tier_id: Option<String>,
    pub status: SubscriptionStatus,
    pub cancel_at_period_end: Option<bool>,
    /// Provider timestamp of the event carrying this state.
    pub observed_at: DateTime<Utc>,
}

/// Analyses left this period. `None` means unlimited.
pub fn remaining_allowance(sub: &Subscription, tier: &Tier) -> Option<i32> {
    match tier.monthly_allowance {
        Quota::Unlimited => None,
        Quota::Limited(allowance) => {
            Some((allowance + sub.analyses_rollover - sub.analyses_used_this_period).max(0))
        }
    }
}

/// Rollover carried into the next period: unused allowance, capped per tier.
pub fn compute_rollover(tier: &Tier, used: i32, rollover: i32) -> i32 {
    match tier.monthly_allowance {
        Quota::Unlimited => 0,
        Quota::Limited(allowance) => {
            let unused = (allowance + rollover - used).max(0);
            tier.rollover_cap.cap(unused)
        }
    }
}

#[derive(Clone)]
pub struct SubscriptionManager {
    store: Arc<dyn BillingStore>,
    catalog: Arc<TierCatalog>,
}

impl SubscriptionManager {
    pub fn new(store: Arc<dyn BillingStore>, catalog: Arc<TierCatalog>) -> Self {
        Self { store, catalog }
    }

    pub fn tier_for(&self, sub: &Subscription) -> Result<&Tier, AppError> {
        tier_in(&self.catalog, sub)
    }

    pub async fn get(&self, id: Uuid) -> Result<Subscription, AppError> {
        self.store
            .subscription(id)
            .await?
            .ok_or_else(|| AppError::NotFound("Subscription not found".to_string()))
    }

    pub async fn active_for_user(&self, user_id: Uuid) -> Result<Option<Subscription>, AppError> {
        self.store.active_subscription(user_id).await
    }

    pub async fn latest_for_user(&self, user_id: Uuid) -> Result<Option<Subscription>, AppError> {
        self.store.latest_subscription(user_id).await
    }

    async fn by_external_ref(&self, external_ref: &str) -> Result<Subscription, AppError> {
        self.store
            .subscription_by_external_ref(external_ref)
            .await?
            .ok_or_else(|| AppError::NotFound("Subscription not found".to_string()))
    }

    /// Creates an active subscription for the calendar month containing now.
    #[instrument(skip(self, actor), fields(actor = %actor))]
    pub async fn create(
        &self,
        actor: &Actor,
        user_id: Uuid,
        tier_id: &str,
        external_ref: &str,
    ) -> Result<Subscription, AppError> {
        self.catalog.validate_subscription(tier_id)?;
        if external_ref.trim().is_empty() {
            return Err(AppError::Validation(
                "external subscription reference is required".to_string(),
            ));
        }

        let (start, end) = calendar_month_containing(Utc::now())
            .ok_or_else(|| AppError::Internal(anyhow::anyhow!("calendar month out of range")))?;
        let created = self
            .store
            .insert_subscription(NewSubscription {
                user_id,
                tier_id: tier_id.to_string(),
                external_subscription_ref: external_ref.to_string(),
                current_period_start: start,
                current_period_end: end,
                billing_anchor_day: start.day() as i32,
            })
            .await?;

        audit::subscription_changed(actor, "create", None, &created);
        Ok(created)
    }

    /// Partial update. Tier changes keep usage counters; rollover is clamped
    /// to the new tier's cap.
    #[instrument(skip(self, actor, update), fields(actor = %actor))]
    pub async fn update(
        &self,
        actor: &Actor,
        id: Uuid,
        update: SubscriptionUpdate,
    ) -> Result<Subscription, AppError> {
        if update.is_empty() {
            return Err(AppError::Validation("no fields to update".to_string()));
        }
        let new_tier = match &update.tier_id {
            Some(tier_id) => Some(self.catalog.validate_subscription(tier_id)?.clone()),
            None => None,
        };

        let now = Utc::now();
        self.mutate(actor, "update", id, |sub| {
            if sub.status == SubscriptionStatus::Canceled {
                return Err(AppError::Validation(
                    "canceled subscriptions cannot be modified".to_string(),
                ));
            }
            if let Some(tier) = &new_tier {
                sub.tier_id = tier.id.clone();
                sub.analyses_rollover = tier.rollover_cap.cap(sub.analyses_rollover);
            }
            if let Some(flag) = update.cancel_at_period_end {
                sub.cancel_at_period_end = flag;
            }
            if let Some(status) = update.status {
                set_status(sub, status, now);
            }
            Ok(Mutation::Write)
        })
        .await
    }

    /// Immediate cancel ends the subscription now; otherwise it is flagged to
    /// end at the next renewal. Canceling a canceled subscription is a no-op.
    #[instrument(skip(self, actor), fields(actor = %actor))]
    pub async fn cancel(
        &self,
        actor: &Actor,
        id: Uuid,
        immediate: bool,
    ) -> Result<Subscription, AppError> {
        let now = Utc::now();
        self.mutate(actor, "cancel", id, |sub| {
            match sub.status {
                SubscriptionStatus::Canceled => return Ok(Mutation::Unchanged),
                SubscriptionStatus::Active
                | SubscriptionStatus::PastDue
                | SubscriptionStatus::Paused => {}
            }
            if immediate {
                set_status(sub, SubscriptionStatus::Canceled, now);
            } else if sub.cancel_at_period_end {
                return Ok(Mutation::Unchanged);
            } else {
                sub.cancel_at_period_end = true;
            }
            Ok(Mutation::Write)
        })
        .await
    }

    /// Closes the period that starts at `expected_period_start`.
    ///
    /// Rolls unused allowance over (capped by the tier), resets usage, and
    /// advances one anchored calendar month; or finalizes cancellation when
    /// `cancel_at_period_end` is set. If the stored period no longer starts at
    /// `expected_period_start` the period was already renewed and this is a no-op.
    #[instrument(skip(self, actor), fields(actor = %actor))]
    pub async fn renew_period(
        &self,
        actor: &Actor,
        id: Uuid,
        expected_period_start: DateTime<Utc>,
    ) -> Result<Subscription, AppError> {
        let catalog = Arc::clone(&self.catalog);
        let now = Utc::now();
        self.mutate(actor, "renew_period", id, |sub| {
            if sub.current_period_start != expected_period_start {
                info!(subscription_id = %sub.id, "Period already renewed, skipping");
                return Ok(Mutation::Unchanged);
            }
            match sub.status {
                SubscriptionStatus::Canceled | SubscriptionStatus::Paused => {
                    return Ok(Mutation::Unchanged)
                }
                SubscriptionStatus::Active | SubscriptionStatus::PastDue => {}
            }

            if sub.cancel_at_period_end {
                set_status(sub, SubscriptionStatus::Canceled, now);
                return Ok(Mutation::Write);
            }

            let tier = tier_in(&catalog, sub)?;
            roll_period(sub, tier)?;
            // A renewed period is a paid period.
            sub.status = SubscriptionStatus::Active;
            Ok(Mutation::Write)
        })
        .await
    }

    /// Applies a paid invoice. `billed_period_end` is the end of the period
    /// the invoice settled; the period is advanced past it at most once, no
    /// matter whether the sweep or the invoice gets there first.
    ///
    /// The payment also clears `past_due` and stamps `last_event_at`, unless
    /// newer provider state was already applied.
    pub async fn renew_for_invoice(
        &self,
        actor: &Actor,
        external_ref: &str,
        billed_period_end: DateTime<Utc>,
        observed_at: DateTime<Utc>,
    ) -> Result<Subscription, AppError> {
        let sub = self.by_external_ref(external_ref).await?;
        let catalog = Arc::clone(&self.catalog);
        let now = Utc::now();
        self.mutate(actor, "invoice_paid", sub.id, |sub| {
            match sub.status {
                SubscriptionStatus::Canceled | SubscriptionStatus::Paused => {
                    return Ok(Mutation::Unchanged)
                }
                SubscriptionStatus::Active | SubscriptionStatus::PastDue => {}
            }

            let mut changed = false;
            if sub.current_period_start < billed_period_end {
                if sub.cancel_at_period_end {
                    set_status(sub, SubscriptionStatus::Canceled, now);
                    return Ok(Mutation::Write);
                }
                let tier = tier_in(&catalog, sub)?;
                roll_period(sub, tier)?;
                changed = true;
            } else {
                info!(subscription_id = %sub.id, "Invoice period already renewed");
            }

            if is_stale(sub, observed_at) {
                warn!(subscription_id = %sub.id, "Paid invoice is older than applied state");
            } else {
                if sub.status == SubscriptionStatus::PastDue {
                    sub.status = SubscriptionStatus::Active;
                    changed = true;
                }
                if sub.last_event_at != Some(observed_at) {
                    sub.last_event_at = Some(observed_at);
                    changed = true;
                }
            }
            Ok(if changed {
                Mutation::Write
            } else {
                Mutation::Unchanged
            })
        })
        .await
    }

    /// Applies absolute provider state. Older state than what was last applied
    /// is ignored, so out-of-order delivery converges.
    pub async fn apply_provider_state(
        &self,
        actor: &Actor,
        external_ref: &str,
        state: ProviderState,
    ) -> Result<Subscription, AppError> {
        let sub = self.by_external_ref(external_ref).await?;
        let new_tier = match &state.tier_id {
            Some(tier_id) => Some(self.catalog.validate_subscription(tier_id)?.clone()),
            None => None,
        };

        let now = Utc::now();
        self.mutate(actor, "provider_state", sub.id, |sub| {
            if is_stale(sub, state.observed_at) {
                warn!(subscription_id = %sub.id, "Ignoring stale provider state");
                return Ok(Mutation::Unchanged);
            }
            if sub.status == SubscriptionStatus::Canceled {
                return Ok(Mutation::Unchanged);
            }
            if let Some(tier) = &new_tier {
                if tier.id != sub.tier_id {
                    sub.tier_id = tier.id.clone();
                    sub.analyses_rollover = tier.rollover_cap.cap(sub.analyses_rollover);
                }
            }
            if let Some(flag) = state.cancel_at_period_end {
                sub.cancel_at_period_end = flag;
            }
            set_status(sub, state.status, now);
            sub.last_event_at = Some(state.observed_at);
            Ok(Mutation::Write)
        })
        .await
    }

    /// Marks the subscription past due after a failed payment.
    pub async fn mark_past_due(
        &self,
        actor: &Actor,
        external_ref: &str,
        observed_at: DateTime<Utc>,
    ) -> Result<Subscription, AppError> {
        let sub = self.by_external_ref(external_ref).await?;
        self.mutate(actor, "payment_failed", sub.id, |sub| {
            if is_stale(sub, observed_at) {
                return Ok(Mutation::Unchanged);
            }
            match sub.status {
                SubscriptionStatus::Active => {
                    sub.status = SubscriptionStatus::PastDue;
                    sub.last_event_at = Some(observed_at);
                    Ok(Mutation::Write)
                }
                SubscriptionStatus::PastDue
                | SubscriptionStatus::Canceled
                | SubscriptionStatus::Paused => Ok(Mutation::Unchanged),
            }
        })
        .await
    }

    pub async fn cancel_by_external_ref(
        &self,
        actor: &Actor,
        external_ref: &str,
    ) -> Result<Subscription, AppError> {
        let sub = self.by_external_ref(external_ref).await?;
        self.cancel(actor, sub.id, true).await
    }

    /// Debits one analysis from the subscription's allowance if it is still
    /// active with room at write time. `None` when the condition no longer holds.
    pub async fn consume_allowance(
        &self,
        sub: &Subscription,
        correlation_id: Uuid,
    ) -> Result<Option<Consumption>, AppError> {
        let tier = self.tier_for(sub)?;
        let consumed = self
            .store
            .record_consumption(
                Debit::Subscription {
                    subscription_id: sub.id,
                    allowance: tier.monthly_allowance,
                },
                NewUsageEvent {
                    user_id: sub.user_id,
                    correlation_id,
                },
            )
            .await?;
        if let Some(consumption) = &consumed {
            audit::allowance_changed(
                &Actor::User(sub.user_id),
                "consume",
                sub.id,
                consumption.remaining.map(|r| r + 1),
                consumption.remaining,
            );
        }
        Ok(consumed)
    }

    /// Renews every active subscription whose period has ended, catching up
    /// several periods if needed. Returns how many renewals were applied.
    ///
    /// Scans in pages of `batch` with a keyset cursor, so subscriptions whose
    /// renewal keeps failing are stepped over instead of blocking the rest.
    pub async fn renew_due(&self, now: DateTime<Utc>, batch: i64) -> Result<usize, AppError> {
        let mut renewed = 0;
        let mut cursor = None;
        loop {
            let due = self
                .store
                .subscriptions_due_for_renewal(now, cursor, batch)
                .await?;
            let Some(last) = due.last() else {
                break;
            };
            cursor = Some((last.current_period_end, last.id));
            let full_page = due.len() as i64 >= batch;
            for sub in due {
                renewed += self.catch_up(sub, now).await;
            }
            if !full_page {
                break;
            }
        }
        Ok(renewed)
    }

    /// Renews one overdue subscription up to `MAX_CATCH_UP_PERIODS` times.
    async fn catch_up(&self, sub: Subscription, now: DateTime<Utc>) -> usize {
        let mut renewed = 0;
        let mut current = sub;
        for _ in 0..MAX_CATCH_UP_PERIODS {
            if current.status != SubscriptionStatus::Active || current.current_period_end > now {
                break;
            }
            match self
                .renew_period(&Actor::Scheduler, current.id, current.current_period_start)
                .await
            {
                Ok(next) if next.version != current.version => {
                    renewed += 1;
                    current = next;
                }
                Ok(_) => break,
                Err(e) => {
                    warn!(subscription_id = %current.id, error = %e, "Scheduled renewal failed");
                    break;
                }
            }
        }
        renewed
    }

    /// Read-apply-CAS loop. `apply` sees a fresh copy on every attempt.
    async fn mutate<F>(
        &self,
        actor: &Actor,
        cause: &str,
        id: Uuid,
        mut apply: F,
    ) -> Result<Subscription, AppError>
    where
        F: FnMut(&mut Subscription) -> Result<Mutation, AppError> + Send,
    {
        for attempt in 1..=MAX_CAS_ATTEMPTS {
            let current = self.get(id).await?;
            let mut next = current.clone();
            match apply(&mut next)? {
                Mutation::Unchanged => return Ok(current),
                Mutation::Write => {}
            }
            if let Some(saved) = self
                .store
                .compare_and_save_subscription(&next, current.version)
                .await?
            {
                audit::subscription_changed(actor, cause, Some(&current), &saved);
                return Ok(saved);
            }
            tracing::debug!(subscription_id = %id, attempt, "Subscription version conflict, retrying");
        }
        Err(AppError::ConcurrentModification)
    }
}

fn set_status(sub: &mut Subscription, status: SubscriptionStatus, now: DateTime<Utc>) {
    if status == SubscriptionStatus::Canceled && sub.status != SubscriptionStatus::Canceled {
        sub.canceled_at = Some(now);
    }
    sub.status = status;
}

fn tier_in<'a>(catalog: &'a TierCatalog, sub: &Subscription) -> Result<&'a Tier, AppError> {
    catalog.get_tier(&sub.tier_id).ok_or_else(|| {
        AppError::InvalidTier(format!("subscription tier '{}' is not in the catalog", sub.tier_id))
    })
}

/// Closes the current period: carries rollover, resets usage and advances one
/// anchored calendar month. Status is left to the caller.
fn roll_period(sub: &mut Subscription, tier: &Tier) -> Result<(), AppError> {
    let anchor = sub.billing_anchor_day.clamp(1, 31) as u32;
    let next_end = advance_one_month(sub.current_period_end, anchor)
        .ok_or_else(|| AppError::Internal(anyhow::anyhow!("billing period out of range")))?;

    sub.analyses_rollover =
        compute_rollover(tier, sub.analyses_used_this_period, sub.analyses_rollover);
    sub.analyses_used_this_period = 0;
    sub.current_period_start = sub.current_period_end;
    sub.current_period_end = next_end;
    Ok(())
}

fn is_stale(sub: &Subscription, observed_at: DateTime<Utc>) -> bool {
    sub.last_event_at.is_some_and(|last| last > observed_at)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::billing::memory_store::MemoryBillingStore;
    use chrono::TimeZone;

    fn manager() -> (SubscriptionManager, Arc<MemoryBillingStore>) {
        let store = Arc::new(MemoryBillingStore::new());
        let manager =
            SubscriptionManager::new(store.clone(), Arc::new(TierCatalog::builtin()));
        (manager, store)
    }

    fn user_actor(user: Uuid) -> Actor {
        Actor::User(user)
    }

    /// Overwrites counters on a stored subscription, bypassing the manager.
    async fn seed(
        store: &MemoryBillingStore,
        sub: &Subscription,
        edit: impl FnOnce(&mut Subscription),
    ) -> Subscription {
        let mut next = sub.clone();
        edit(&mut next);
        store
            .compare_and_save_subscription(&next, sub.version)
            .await
            .unwrap()
            .unwrap()
    }

    async fn create(manager: &SubscriptionManager, tier: &str) -> Subscription {
        let user = Uuid::new_v4();
        manager
            .create(&user_actor(user), user, tier, &format!("sub_{}", Uuid::new_v4()))
            .await
            .unwrap()
    }

    #[test]
    fn test_scenario_a_pro_rollover() {
        let catalog = TierCatalog::builtin();
        let pro = catalog.get_tier("flow_pro").unwrap();
        // unused = 60 + 10 - 58 = 12, under the cap of 30
        assert_eq!(compute_rollover(pro, 58, 10), 12);
    }

    #[test]
    fn test_scenario_b_starter_rollover() {
        let catalog = TierCatalog::builtin();
        let starter = catalog.get_tier("flow_starter").unwrap();
        // unused = 15 + 3 - 15 = 3, under the cap of 5
        assert_eq!(compute_rollover(starter, 15, 3), 3);
    }

    #[test]
    fn test_rollover_is_capped() {
        let catalog = TierCatalog::builtin();
        let starter = catalog.get_tier("flow_starter").unwrap();
        assert_eq!(compute_rollover(starter, 0, 5), 5);
    }

    #[test]
    fn test_rollover_never_negative_when_overused() {
        let catalog = TierCatalog::builtin();
        let starter = catalog.get_tier("flow_starter").unwrap();
        assert_eq!(compute_rollover(starter, 40, 0), 0);
    }

    #[test]
    fn test_unlimited_tier_has_no_rollover_or_limit() {
        let catalog = TierCatalog::builtin();
        let custom = catalog.get_tier("custom").unwrap();
        assert_eq!(compute_rollover(custom, 500, 0), 0);
    }

    #[tokio::test]
    async fn test_create_anchors_to_calendar_month() {
        let (manager, _) = manager();
        let sub = create(&manager, "flow_pro").await;
        assert_eq!(sub.status, SubscriptionStatus::Active);
        assert_eq!(sub.current_period_start.day(), 1);
        assert_eq!(sub.current_period_end.day(), 1);
        assert!(sub.current_period_start <= Utc::now());
        assert!(sub.current_period_end > Utc::now());
        assert_eq!(sub.billing_anchor_day, 1);
    }

    #[tokio::test]
    async fn test_create_rejects_second_active_subscription() {
        let (manager, _) = manager();
        let user = Uuid::new_v4();
        manager
            .create(&user_actor(user), user, "flow_pro", "sub_a")
            .await
            .unwrap();
        let err = manager
            .create(&user_actor(user), user, "flow_starter", "sub_b")
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::DuplicateActiveSubscription));
    }

    #[tokio::test]
    async fn test_create_rejects_credit_pack_and_unknown_tiers() {
        let (manager, _) = manager();
        let user = Uuid::new_v4();
        for tier in ["credits_5", "flow_unknown"] {
            let err = manager
                .create(&user_actor(user), user, tier, "sub_x")
                .await
                .unwrap_err();
            assert!(matches!(err, AppError::InvalidTier(_)), "tier {tier}");
        }
    }

    #[tokio::test]
    async fn test_renew_scenario_a_resets_usage_and_advances() {
        let (manager, store) = manager();
        let sub = create(&manager, "flow_pro").await;
        let sub = seed(&store, &sub, |s| {
            s.analyses_used_this_period = 58;
            s.analyses_rollover = 10;
        })
        .await;

        let renewed = manager
            .renew_period(&Actor::Scheduler, sub.id, sub.current_period_start)
            .await
            .unwrap();
        assert_eq!(renewed.analyses_rollover, 12);
        assert_eq!(renewed.analyses_used_this_period, 0);
        assert_eq!(renewed.current_period_start, sub.current_period_end);
        assert!(renewed.current_period_end > renewed.current_period_start);
    }

    #[tokio::test]
    async fn test_renew_scenario_b() {
        let (manager, store) = manager();
        let sub = create(&manager, "flow_starter").await;
        let sub = seed(&store, &sub, |s| {
            s.analyses_used_this_period = 15;
            s.analyses_rollover = 3;
        })
        .await;

        let renewed = manager
            .renew_period(&Actor::Scheduler, sub.id, sub.current_period_start)
            .await
            .unwrap();
        assert_eq!(renewed.analyses_rollover, 3);
        assert_eq!(renewed.analyses_used_this_period, 0);
    }

    #[tokio::test]
    async fn test_renew_twice_for_same_period_is_idempotent() {
        let (manager, store) = manager();
        let sub = create(&manager, "flow_pro").await;
        let sub = seed(&store, &sub, |s| s.analyses_used_this_period = 20).await;

        let first = manager
            .renew_period(&Actor::Scheduler, sub.id, sub.current_period_start)
            .await
            .unwrap();
        let second = manager
            .renew_period(&Actor::Scheduler, sub.id, sub.current_period_start)
            .await
            .unwrap();
        assert_eq!(first, second, "second renewal must not change state");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_renewals_advance_once() {
        let (manager, _) = manager();
        let sub = create(&manager, "flow_pro").await;

        let (a, b) = tokio::join!(
            manager.renew_period(&Actor::Scheduler, sub.id, sub.current_period_start),
            manager.renew_period(&Actor::Scheduler, sub.id, sub.current_period_start),
        );
        let (a, b) = (a.unwrap(), b.unwrap());
        assert_eq!(a.current_period_start, sub.current_period_end);
        assert_eq!(b.current_period_start, sub.current_period_end);
        let stored = manager.get(sub.id).await.unwrap();
        assert_eq!(stored.current_period_start, sub.current_period_end);
    }

    #[tokio::test]
    async fn test_scenario_d_cancel_at_period_end_finalizes_on_renewal() {
        let (manager, _) = manager();
        let sub = create(&manager, "flow_pro").await;
        let flagged = manager
            .cancel(&Actor::Scheduler, sub.id, false)
            .await
            .unwrap();
        assert!(flagged.cancel_at_period_end);
        assert_eq!(flagged.status, SubscriptionStatus::Active);

        let ended = manager
            .renew_period(&Actor::Scheduler, sub.id, sub.current_period_start)
            .await
            .unwrap();
        assert_eq!(ended.status, SubscriptionStatus::Canceled);
        assert!(ended.canceled_at.is_some());
        assert_eq!(ended.current_period_start, sub.current_period_start);
    }

    #[tokio::test]
    async fn test_cancel_is_idempotent() {
        let (manager, _) = manager();
        let sub = create(&manager, "flow_starter").await;
        let first = manager
            .cancel(&Actor::Scheduler, sub.id, true)
            .await
            .unwrap();
        let second = manager
            .cancel(&Actor::Scheduler, sub.id, true)
            .await
            .unwrap();
        assert_eq!(first.status, SubscriptionStatus::Canceled);
        assert_eq!(second.status, SubscriptionStatus::Canceled);
        assert_eq!(first.canceled_at, second.canceled_at);
    }

    #[tokio::test]
    async fn test_canceled_user_can_subscribe_again() {
        let (manager, _) = manager();
        let user = Uuid::new_v4();
        let old = manager
            .create(&user_actor(user), user, "flow_starter", "sub_old")
            .await
            .unwrap();
        manager.cancel(&user_actor(user), old.id, true).await.unwrap();
        let new = manager
            .create(&user_actor(user), user, "flow_pro", "sub_new")
            .await
            .unwrap();
        assert_eq!(
            manager.active_for_user(user).await.unwrap().map(|s| s.id),
            Some(new.id)
        );
    }

    #[tokio::test]
    async fn test_tier_change_keeps_usage_and_clamps_rollover() {
        let (manager, store) = manager();
        let sub = create(&manager, "flow_pro").await;
        let sub = seed(&store, &sub, |s| {
            s.analyses_used_this_period = 7;
            s.analyses_rollover = 12;
        })
        .await;

        let updated = manager
            .update(
                &Actor::Scheduler,
                sub.id,
                SubscriptionUpdate {
                    tier_id: Some("flow_starter".into()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(updated.tier_id, "flow_starter");
        assert_eq!(updated.analyses_used_this_period, 7);
        assert_eq!(updated.analyses_rollover, 5);
    }

    #[tokio::test]
    async fn test_empty_update_is_rejected() {
        let (manager, _) = manager();
        let sub = create(&manager, "flow_pro").await;
        let err = manager
            .update(&Actor::Scheduler, sub.id, SubscriptionUpdate::default())
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));
    }

    #[tokio::test]
    async fn test_renewal_on_jan_31_anchor_clamps_to_february() {
        let (manager, store) = manager();
        let sub = create(&manager, "flow_pro").await;
        let jan = Utc.with_ymd_and_hms(2027, 1, 31, 0, 0, 0).unwrap();
        let sub = seed(&store, &sub, |s| {
            s.current_period_start = Utc.with_ymd_and_hms(2026, 12, 31, 0, 0, 0).unwrap();
            s.current_period_end = jan;
            s.billing_anchor_day = 31;
        })
        .await;

        let renewed = manager
            .renew_period(&Actor::Scheduler, sub.id, sub.current_period_start)
            .await
            .unwrap();
        assert_eq!(renewed.current_period_start, jan);
        assert_eq!(
            renewed.current_period_end,
            Utc.with_ymd_and_hms(2027, 2, 28, 0, 0, 0).unwrap()
        );
    }

    #[tokio::test]
    async fn test_stale_provider_state_is_ignored() {
        let (manager, _) = manager();
        let sub = create(&manager, "flow_pro").await;
        let newer = Utc.with_ymd_and_hms(2026, 10, 10, 12, 0, 0).unwrap();
        let older = Utc.with_ymd_and_hms(2026, 10, 10, 11, 0, 0).unwrap();

        manager
            .apply_provider_state(
                &Actor::Scheduler,
                &sub.external_subscription_ref,
                ProviderState {
                    tier_id: Some("flow_starter".into()),
                    status: SubscriptionStatus::Active,
                    cancel_at_period_end: None,
                    observed_at: newer,
                },
            )
            .await
            .unwrap();
        let after = manager
            .apply_provider_state(
                &Actor::Scheduler,
                &sub.external_subscription_ref,
                ProviderState {
                    tier_id: Some("flow_pro".into()),
                    status: SubscriptionStatus::PastDue,
                    cancel_at_period_end: None,
                    observed_at: older,
                },
            )
            .await
            .unwrap();
        assert_eq!(after.tier_id, "flow_starter");
        assert_eq!(after.status, SubscriptionStatus::Active);
    }

    #[tokio::test]
    async fn test_invoice_for_already_renewed_period_is_noop() {
        let (manager, _) = manager();
        let sub = create(&manager, "flow_pro").await;
        let boundary = sub.current_period_end;
        let paid_at = Utc::now();

        let first = manager
            .renew_for_invoice(&Actor::Scheduler, &sub.external_subscription_ref, boundary, paid_at)
            .await
            .unwrap();
        let second = manager
            .renew_for_invoice(&Actor::Scheduler, &sub.external_subscription_ref, boundary, paid_at)
            .await
            .unwrap();
        assert_eq!(first.current_period_start, boundary);
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_paid_invoice_after_scheduled_renewal_clears_past_due() {
        let (manager, _) = manager();
        let sub = create(&manager, "flow_pro").await;
        let boundary = sub.current_period_end;
        let failed_at = Utc.with_ymd_and_hms(2026, 11, 1, 1, 0, 0).unwrap();
        let paid_at = Utc.with_ymd_and_hms(2026, 11, 3, 1, 0, 0).unwrap();

        manager
            .renew_period(&Actor::Scheduler, sub.id, sub.current_period_start)
            .await
            .unwrap();
        manager
            .mark_past_due(&Actor::Scheduler, &sub.external_subscription_ref, failed_at)
            .await
            .unwrap();
        let paid = manager
            .renew_for_invoice(&Actor::Scheduler, &sub.external_subscription_ref, boundary, paid_at)
            .await
            .unwrap();

        assert_eq!(paid.status, SubscriptionStatus::Active);
        assert_eq!(paid.current_period_start, boundary);
        assert_eq!(paid.last_event_at, Some(paid_at));
    }

    #[tokio::test]
    async fn test_older_payment_failure_cannot_undo_paid_invoice() {
        let (manager, _) = manager();
        let sub = create(&manager, "flow_pro").await;
        let paid_at = Utc.with_ymd_and_hms(2026, 11, 3, 1, 0, 0).unwrap();
        let failed_at = Utc.with_ymd_and_hms(2026, 11, 1, 1, 0, 0).unwrap();

        manager
            .renew_for_invoice(
                &Actor::Scheduler,
                &sub.external_subscription_ref,
                sub.current_period_end,
                paid_at,
            )
            .await
            .unwrap();
        let after = manager
            .mark_past_due(&Actor::Scheduler, &sub.external_subscription_ref, failed_at)
            .await
            .unwrap();
        assert_eq!(after.status, SubscriptionStatus::Active);
    }

    #[tokio::test]
    async fn test_older_paid_invoice_still_renews_but_keeps_newer_failure() {
        let (manager, _) = manager();
        let sub = create(&manager, "flow_pro").await;
        let boundary = sub.current_period_end;
        let paid_at = Utc.with_ymd_and_hms(2026, 11, 1, 1, 0, 0).unwrap();
        let failed_at = Utc.with_ymd_and_hms(2026, 11, 3, 1, 0, 0).unwrap();

        manager
            .mark_past_due(&Actor::Scheduler, &sub.external_subscription_ref, failed_at)
            .await
            .unwrap();
        let after = manager
            .renew_for_invoice(&Actor::Scheduler, &sub.external_subscription_ref, boundary, paid_at)
            .await
            .unwrap();
        assert_eq!(after.current_period_start, boundary);
        assert_eq!(after.status, SubscriptionStatus::PastDue);
        assert_eq!(after.last_event_at, Some(failed_at));
    }

    #[tokio::test]
    async fn test_renew_due_steps_past_subscriptions_that_keep_failing() {
        let (manager, store) = manager();
        let jan = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
        let feb = Utc.with_ymd_and_hms(2026, 2, 1, 0, 0, 0).unwrap();
        let mut retired = Vec::new();
        for _ in 0..3 {
            let sub = create(&manager, "flow_pro").await;
            retired.push(
                seed(&store, &sub, |s| {
                    s.tier_id = "flow_retired".into();
                    s.current_period_start = Utc.with_ymd_and_hms(2025, 12, 1, 0, 0, 0).unwrap();
                    s.current_period_end = jan;
                })
                .await,
            );
        }
        let healthy = create(&manager, "flow_pro").await;
        seed(&store, &healthy, |s| {
            s.current_period_start = jan;
            s.current_period_end = feb;
        })
        .await;

        let now = Utc.with_ymd_and_hms(2026, 2, 15, 0, 0, 0).unwrap();
        let renewed = manager.renew_due(now, 1).await.unwrap();
        assert_eq!(renewed, 1);
        assert_eq!(manager.get(healthy.id).await.unwrap().current_period_start, feb);
        for sub in retired {
            assert_eq!(manager.get(sub.id).await.unwrap().current_period_end, jan);
        }
    }

    #[tokio::test]
    async fn test_renew_due_catches_up_overdue_periods() {
        let (manager, store) = manager();
        let sub = create(&manager, "flow_pro").await;
        seed(&store, &sub, |s| {
            s.current_period_start = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
            s.current_period_end = Utc.with_ymd_and_hms(2026, 2, 1, 0, 0, 0).unwrap();
        })
        .await;

        let now = Utc.with_ymd_and_hms(2026, 4, 15, 0, 0, 0).unwrap();
        let renewed = manager.renew_due(now, 100).await.unwrap();
        assert_eq!(renewed, 3);
        let stored = manager.get(sub.id).await.unwrap();
        assert_eq!(
            stored.current_period_start,
            Utc.with_ymd_and_hms(2026, 4, 1, 0, 0, 0).unwrap()
        );
    }

    #[tokio::test]
    async fn test_payment_failure_marks_past_due() {
        let (manager, _) = manager();
        let sub = create(&manager, "flow_pro").await;
        let updated = manager
            .mark_past_due(&Actor::Scheduler, &sub.external_subscription_ref, Utc::now())
            .await
            .unwrap();
        assert_eq!(updated.status, SubscriptionStatus::PastDue);
    }

    #[tokio::test]
    async fn test_remaining_allowance_includes_rollover() {
        let (manager, store) = manager();
        let sub = create(&manager, "flow_starter").await;
        let sub = seed(&store, &sub, |s| {
            s.analyses_used_this_period = 10;
            s.analyses_rollover = 4;
        })
        .await;
        let tier = manager.tier_for(&sub).unwrap();
        assert_eq!(remaining_allowance(&sub, tier), Some(9));
    }
}
