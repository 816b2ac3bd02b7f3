//! Process-local `BillingStore`. One mutex guards all state, so every trait
//! method is atomic with respect to every other. Used by tests and by
//! `STORE_BACKEND=memory` local runs.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::billing::store::{BillingStore, Consumption, Debit, RenewalCursor};
use crate::billing::tiers::Quota;
use crate::errors::AppError;
use crate::models::credit::CreditBalance;
use crate::models::subscription::{NewSubscription, Subscription, SubscriptionStatus};
use crate::models::usage::{NewUsageEvent, UsageEvent, UsageSource};
use crate::models::webhook::{NewWebhookEvent, WebhookClaim, WebhookEventRecord};

#[derive(Default)]
struct MemoryState {
    subscriptions: HashMap<Uuid, Subscription>,
    credits: HashMap<Uuid, CreditBalance>,
    grants: HashSet<String>,
    usage: Vec<UsageEvent>,
    webhooks: HashMap<String, WebhookEventRecord>,
}

impl MemoryState {
    fn active_for(&self, user_id: Uuid) -> Option<&Subscription> {
        self.subscriptions
            .values()
            .find(|s| s.user_id == user_id && s.status == SubscriptionStatus::Active)
    }
}

#[derive(Clone, Default)]
pub struct MemoryBillingStore {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryBillingStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn lease_deadline(now: DateTime<Utc>, lease: Duration) -> DateTime<Utc> {
    let lease = chrono::Duration::from_std(lease).unwrap_or_else(|_| chrono::Duration::seconds(60));
    now + lease
}

#[async_trait]
impl BillingStore for MemoryBillingStore {
    async fn insert_subscription(&self, new: NewSubscription) -> Result<Subscription, AppError> {
        let mut state = self.state.lock().await;
        if state.active_for(new.user_id).is_some() {
            return Err(AppError::DuplicateActiveSubscription);
        }
        if state
            .subscriptions
            .values()
            .any(|s| s.external_subscription_ref == new.external_subscription_ref)
        {
            return Err(AppError::Validation(
                "external subscription reference is already linked".to_string(),
            ));
        }

        let now = Utc::now();
        let subscription = Subscription {
            id: Uuid::new_v4(),
            user_id: new.user_id,
            tier_id: new.tier_id,
            status: SubscriptionStatus::Active,
            current_period_start: new.current_period_start,
            current_period_end: new.current_period_end,
            billing_anchor_day: new.billing_anchor_day,
            analyses_used_this_period: 0,
            analyses_rollover: 0,
            cancel_at_period_end: false,
            canceled_at: None,
            external_subscription_ref: new.external_subscription_ref,
            last_event_at: None,
            version: 1,
            created_at: now,
            updated_at: now,
        };
        state
            .subscriptions
            .insert(subscription.id, subscription.clone());
        Ok(subscription)
    }

    async fn subscription(&self, id: Uuid) -> Result<Option<Subscription>, AppError> {
        Ok(self.state.lock().await.subscriptions.get(&id).cloned())
    }

    async fn subscription_by_external_ref(
        &self,
        external_ref: &str,
    ) -> Result<Option<Subscription>, AppError> {
        let state = self.state.lock().await;
        Ok(state
            .subscriptions
            .values()
            .find(|s| s.external_subscription_ref == external_ref)
            .cloned())
    }

    async fn active_subscription(&self, user_id: Uuid) -> Result<Option<Subscription>, AppError> {
        Ok(self.state.lock().await.active_for(user_id).cloned())
    }

    async fn latest_subscription(&self, user_id: Uuid) -> Result<Option<Subscription>, AppError> {
        let state = self.state.lock().await;
        Ok(state
            .subscriptions
            .values()
            .filter(|s| s.user_id == user_id)
            .max_by_key(|s| s.created_at)
            .cloned())
    }

    async fn compare_and_save_subscription(
        &self,
        subscription: &Subscription,
        expected_version: i64,
    ) -> Result<Option<Subscription>, AppError> {
        let mut state = self.state.lock().await;
        match state.subscriptions.get(&subscription.id) {
            Some(current) if current.version == expected_version => {}
            Some(_) => return Ok(None),
            None => return Err(AppError::NotFound("Subscription not found".to_string())),
        }
        if subscription.status == SubscriptionStatus::Active {
            if let Some(other) = state.active_for(subscription.user_id) {
                if other.id != subscription.id {
                    return Err(AppError::DuplicateActiveSubscription);
                }
            }
        }

        let mut saved = subscription.clone();
        saved.version = expected_version + 1;
        saved.updated_at = Utc::now();
        state.subscriptions.insert(saved.id, saved.clone());
        Ok(Some(saved))
    }

    async fn subscriptions_due_for_renewal(
        &self,
        now: DateTime<Utc>,
        after: Option<RenewalCursor>,
        limit: i64,
    ) -> Result<Vec<Subscription>, AppError> {
        let state = self.state.lock().await;
        let mut due: Vec<Subscription> = state
            .subscriptions
            .values()
            .filter(|s| s.status == SubscriptionStatus::Active && s.current_period_end <= now)
            .filter(|s| after.map_or(true, |cursor| (s.current_period_end, s.id) > cursor))
            .cloned()
            .collect();
        due.sort_by_key(|s| (s.current_period_end, s.id));
        due.truncate(limit.max(0) as usize);
        Ok(due)
    }

    async fn credit_balance(&self, user_id: Uuid) -> Result<i32, AppError> {
        let state = self.state.lock().await;
        Ok(state.credits.get(&user_id).map(|c| c.balance).unwrap_or(0))
    }

    async fn grant_credits(
        &self,
        user_id: Uuid,
        amount: i32,
        grant_ref: &str,
    ) -> Result<Option<CreditBalance>, AppError> {
        let mut state = self.state.lock().await;
        if state.grants.contains(grant_ref) {
            return Ok(None);
        }
        let current = state.credits.get(&user_id).map(|c| c.balance).unwrap_or(0);
        let balance = current
            .checked_add(amount)
            .ok_or_else(|| AppError::Validation("credit balance would overflow".to_string()))?;
        state.grants.insert(grant_ref.to_string());
        let now = Utc::now();
        let entry = state.credits.entry(user_id).or_insert(CreditBalance {
            user_id,
            balance: 0,
            updated_at: now,
        });
        entry.balance = balance;
        entry.updated_at = now;
        Ok(Some(entry.clone()))
    }

    async fn record_consumption(
        &self,
        debit: Debit,
        usage: NewUsageEvent,
    ) -> Result<Option<Consumption>, AppError> {
        let mut state = self.state.lock().await;
        let now = Utc::now();

        let (source, subscription_id, remaining) = match debit {
            Debit::Subscription {
                subscription_id,
                allowance,
            } => {
                let Some(sub) = state.subscriptions.get_mut(&subscription_id) else {
                    return Ok(None);
                };
                let has_room = match allowance {
                    Quota::Unlimited => true,
                    Quota::Limited(allowance) => {
                        sub.analyses_used_this_period < allowance + sub.analyses_rollover
                    }
                };
                if sub.user_id != usage.user_id
                    || sub.status != SubscriptionStatus::Active
                    || !has_room
                {
                    return Ok(None);
                }
                sub.analyses_used_this_period += 1;
                sub.version += 1;
                sub.updated_at = now;
                let remaining = match allowance {
                    Quota::Unlimited => None,
                    Quota::Limited(allowance) => {
                        Some(allowance + sub.analyses_rollover - sub.analyses_used_this_period)
                    }
                };
                (UsageSource::Subscription, Some(subscription_id), remaining)
            }
            Debit::Credit => {
                let Some(credits) = state.credits.get_mut(&usage.user_id) else {
                    return Ok(None);
                };
                if credits.balance < 1 {
                    return Ok(None);
                }
                credits.balance -= 1;
                credits.updated_at = now;
                (UsageSource::Credit, None, Some(credits.balance))
            }
        };

        let event = UsageEvent {
            id: Uuid::new_v4(),
            user_id: usage.user_id,
            source,
            amount: 1,
            subscription_id,
            correlation_id: usage.correlation_id,
            occurred_at: now,
        };
        state.usage.push(event.clone());
        Ok(Some(Consumption { event, remaining }))
    }

    async fn usage_history(
        &self,
        user_id: Uuid,
        limit: i64,
        page_token: Option<Uuid>,
    ) -> Result<Vec<UsageEvent>, AppError> {
        let state = self.state.lock().await;
        let newest_first = state.usage.iter().rev().filter(|e| e.user_id == user_id);
        let page: Vec<UsageEvent> = match page_token {
            Some(token) => newest_first
                .skip_while(|e| e.id != token)
                .skip(1)
                .take(limit.max(0) as usize)
                .cloned()
                .collect(),
            None => newest_first.take(limit.max(0) as usize).cloned().collect(),
        };
        Ok(page)
    }

    async fn claim_webhook_event(
        &self,
        event: NewWebhookEvent,
        lease: Duration,
        max_retries: i32,
    ) -> Result<WebhookClaim, AppError> {
        let mut state = self.state.lock().await;
        let now = Utc::now();

        if !state.webhooks.contains_key(&event.external_event_id) {
            let record = WebhookEventRecord {
                external_event_id: event.external_event_id.clone(),
                event_type: event.event_type,
                raw_payload: event.raw_payload,
                processed: false,
                processing_error: None,
                retry_count: 0,
                needs_review: false,
                claimed_until: Some(lease_deadline(now, lease)),
                received_at: now,
                processed_at: None,
            };
            state
                .webhooks
                .insert(event.external_event_id, record.clone());
            return Ok(WebhookClaim::Claimed(record));
        }

        let existing = state
            .webhooks
            .get_mut(&event.external_event_id)
            .ok_or_else(|| AppError::NotFound("Webhook event not found".to_string()))?;
        if existing.processed {
            return Ok(WebhookClaim::AlreadyProcessed);
        }
        if existing.needs_review || existing.retry_count >= max_retries {
            return Ok(WebhookClaim::NeedsReview);
        }
        if existing.claimed_until.is_some_and(|until| until > now) {
            return Ok(WebhookClaim::InFlight);
        }
        existing.claimed_until = Some(lease_deadline(now, lease));
        Ok(WebhookClaim::Claimed(existing.clone()))
    }

    async fn complete_webhook_event(&self, external_event_id: &str) -> Result<(), AppError> {
        let mut state = self.state.lock().await;
        let record = state
            .webhooks
            .get_mut(external_event_id)
            .ok_or_else(|| AppError::NotFound("Webhook event not found".to_string()))?;
        record.processed = true;
        record.processing_error = None;
        record.claimed_until = None;
        record.processed_at = Some(Utc::now());
        Ok(())
    }

    async fn fail_webhook_event(
        &self,
        external_event_id: &str,
        error: &str,
        max_retries: i32,
    ) -> Result<WebhookEventRecord, AppError> {
        let mut state = self.state.lock().await;
        let record = state
            .webhooks
            .get_mut(external_event_id)
            .ok_or_else(|| AppError::NotFound("Webhook event not found".to_string()))?;
        record.processed = false;
        record.processing_error = Some(error.to_string());
        record.retry_count += 1;
        record.needs_review = record.retry_count >= max_retries;
        record.claimed_until = None;
        Ok(record.clone())
    }

    async fn webhook_events_for_retry(
        &self,
        now: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<WebhookEventRecord>, AppError> {
        let state = self.state.lock().await;
        let mut pending: Vec<WebhookEventRecord> = state
            .webhooks
            .values()
            .filter(|e| !e.processed && !e.needs_review)
            .filter(|e| e.claimed_until.map_or(true, |until| until <= now))
            .cloned()
            .collect();
        pending.sort_by_key(|e| e.received_at);
        pending.truncate(limit.max(0) as usize);
        Ok(pending)
    }
}
