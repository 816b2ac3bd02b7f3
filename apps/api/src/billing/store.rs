//! Persistence seam for the billing engine.
//!
//! Every method is a single atomic unit against the backing store. Callers
//! never read-then-write across two calls to make an entitlement decision:
//! debits are conditional writes, subscription saves are compare-and-swap on
//! `version`, and webhook claims are leases.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::billing::tiers::Quota;
use crate::errors::AppError;
use crate::models::credit::CreditBalance;
use crate::models::subscription::{NewSubscription, Subscription};
use crate::models::usage::{NewUsageEvent, UsageEvent};
use crate::models::webhook::{NewWebhookEvent, WebhookClaim, WebhookEventRecord};

/// Which balance a consumption debits.
#[derive(Debug, Clone, Copy)]
pub enum Debit {
    /// Increment usage only while the subscription is active and
    /// `used < allowance + rollover` still holds at write time.
    Subscription {
        subscription_id: Uuid,
        allowance: Quota,
    },
    /// Decrement the user's credit balance only while it is at least 1.
    Credit,
}

/// A successful debit and what is left in the source it came from.
#[derive(Debug, Clone)]
pub struct Consumption {
    pub event: UsageEvent,
    /// Units left in the debited source afterwards. `None` when unlimited.
    pub remaining: Option<i32>,
}

/// Keyset position in the renewal scan: `(current_period_end, id)` of the
/// last subscription already visited.
pub type RenewalCursor = (DateTime<Utc>, Uuid);

#[async_trait]
pub trait BillingStore: Send + Sync {
    // Subscriptions

    /// Inserts a new active subscription.
    /// Fails with `DuplicateActiveSubscription` if the user already has one.
    async fn insert_subscription(&self, new: NewSubscription) -> Result<Subscription, AppError>;

    async fn subscription(&self, id: Uuid) -> Result<Option<Subscription>, AppError>;

    async fn subscription_by_external_ref(
        &self,
        external_ref: &str,
    ) -> Result<Option<Subscription>, AppError>;

    /// The user's subscription with status `active`, if any.
    async fn active_subscription(&self, user_id: Uuid) -> Result<Option<Subscription>, AppError>;

    /// The user's most recently created subscription regardless of status.
    async fn latest_subscription(&self, user_id: Uuid) -> Result<Option<Subscription>, AppError>;

    /// Writes `subscription` only if the stored row is still at `expected_version`.
    /// Returns the saved row (with bumped version), or `None` on version mismatch.
    /// Fails with `DuplicateActiveSubscription` if the write would give the
    /// user a second active subscription.
    async fn compare_and_save_subscription(
        &self,
        subscription: &Subscription,
        expected_version: i64,
    ) -> Result<Option<Subscription>, AppError>;

    /// Active subscriptions whose period ended at or before `now`, ordered by
    /// `(current_period_end, id)` and starting strictly after `after`.
    async fn subscriptions_due_for_renewal(
        &self,
        now: DateTime<Utc>,
        after: Option<RenewalCursor>,
        limit: i64,
    ) -> Result<Vec<Subscription>, AppError>;

    // Credits and usage

    /// Current balance, `0` when the user never bought credits.
    async fn credit_balance(&self, user_id: Uuid) -> Result<i32, AppError>;

    /// Adds `amount` credits once per `grant_ref`.
    /// Returns `None` when the grant was already applied.
    async fn grant_credits(
        &self,
        user_id: Uuid,
        amount: i32,
        grant_ref: &str,
    ) -> Result<Option<CreditBalance>, AppError>;

    /// Applies `debit` and appends the usage row in one atomic unit.
    /// Returns `None` without side effects when the debit condition fails.
    async fn record_consumption(
        &self,
        debit: Debit,
        usage: NewUsageEvent,
    ) -> Result<Option<Consumption>, AppError>;

    /// Newest first. `page_token` is the id of the last event of the previous page.
    async fn usage_history(
        &self,
        user_id: Uuid,
        limit: i64,
        page_token: Option<Uuid>,
    ) -> Result<Vec<UsageEvent>, AppError>;

    // Webhook events

    /// Inserts the event if unseen, or re-claims an unprocessed one whose
    /// lease expired. The caller gets exclusive rights for `lease`.
    async fn claim_webhook_event(
        &self,
        event: NewWebhookEvent,
        lease: Duration,
        max_retries: i32,
    ) -> Result<WebhookClaim, AppError>;

    /// Marks a claimed event processed. Immutable afterwards.
    async fn complete_webhook_event(&self, external_event_id: &str) -> Result<(), AppError>;

    /// Records a processing failure and releases the lease.
    /// Flags the event for review once `retry_count` reaches `max_retries`.
    async fn fail_webhook_event(
        &self,
        external_event_id: &str,
        error: &str,
        max_retries: i32,
    ) -> Result<WebhookEventRecord, AppError>;

    /// Unprocessed events with retries left and no live lease.
    async fn webhook_events_for_retry(
        &self,
        now: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<WebhookEventRecord>, AppError>;
}

/// Bounds a store round trip so callers fail closed instead of hanging.
pub async fn with_deadline<T, F>(deadline: Duration, fut: F) -> Result<T, AppError>
where
    F: std::future::Future<Output = Result<T, AppError>>,
{
    match tokio::time::timeout(deadline, fut).await {
        Ok(result) => result,
        Err(_) => Err(AppError::StoreTimeout),
    }
}
