//! Webhook Event Processor.
//!
//! Verifies, deduplicates and applies billing-provider events. Each event id
//! is claimed with a lease before any side effect runs, and completed only
//! after its handler succeeds, so redelivery never applies effects twice.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::billing::audit::Actor;
use crate::billing::credits::CreditLedger;
use crate::billing::signature::{SignatureError, SignatureVerifier};
use crate::billing::store::BillingStore;
use crate::billing::subscriptions::{ProviderState, SubscriptionManager};
use crate::billing::tiers::{Quota, TierCatalog};
use crate::errors::AppError;
use crate::models::subscription::SubscriptionStatus;
use crate::models::webhook::{NewWebhookEvent, WebhookClaim};

/// Event types this engine acts on. Anything else is acknowledged and ignored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WebhookEventKind {
    SubscriptionCreated,
    SubscriptionUpdated,
    SubscriptionDeleted,
    InvoicePaid,
    InvoicePaymentFailed,
    CheckoutCompleted,
}

impl WebhookEventKind {
    pub fn parse(event_type: &str) -> Option<Self> {
        match event_type {
            "customer.subscription.created" => Some(WebhookEventKind::SubscriptionCreated),
            "customer.subscription.updated" => Some(WebhookEventKind::SubscriptionUpdated),
            "customer.subscription.deleted" => Some(WebhookEventKind::SubscriptionDeleted),
            "invoice.paid" => Some(WebhookEventKind::InvoicePaid),
            "invoice.payment_failed" => Some(WebhookEventKind::InvoicePaymentFailed),
            "checkout.session.completed" => Some(WebhookEventKind::CheckoutCompleted),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WebhookOutcome {
    Processed,
    /// Acknowledged without side effects.
    Ignored,
    AlreadyProcessed,
    /// Another delivery of the same event holds the lease.
    InFlight,
    /// Retries exhausted; waiting on manual review.
    NeedsReview,
}

#[derive(Debug, Deserialize)]
struct ProviderEvent {
    id: String,
    #[serde(rename = "type")]
    event_type: String,
    created: i64,
    data: EventData,
}

#[derive(Debug, Deserialize)]
struct EventData {
    object: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct SubscriptionObject {
    id: String,
    status: String,
    cancel_at_period_end: Option<bool>,
    #[serde(default)]
    metadata: HashMap<String, String>,
}

#[derive(Debug, Deserialize)]
struct InvoiceObject {
    subscription: Option<String>,
    billing_reason: Option<String>,
    /// End of the period this invoice settles, unix seconds.
    period_end: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct CheckoutObject {
    #[serde(default)]
    metadata: HashMap<String, String>,
}

fn parse_object<T: DeserializeOwned>(event: &ProviderEvent) -> Result<T, AppError> {
    serde_json::from_value(event.data.object.clone()).map_err(|e| {
        AppError::Validation(format!("{} payload: {e}", event.event_type))
    })
}

fn timestamp(secs: i64) -> Result<DateTime<Utc>, AppError> {
    DateTime::from_timestamp(secs, 0)
        .ok_or_else(|| AppError::Validation(format!("timestamp {secs} out of range")))
}

/// Lease and retry bounds for event processing.
#[derive(Debug, Clone, Copy)]
pub struct WebhookPolicy {
    pub lease: Duration,
    pub max_retries: i32,
}

#[derive(Clone)]
pub struct WebhookProcessor {
    store: Arc<dyn BillingStore>,
    catalog: Arc<TierCatalog>,
    subscriptions: SubscriptionManager,
    credits: CreditLedger,
    verifier: SignatureVerifier,
    policy: WebhookPolicy,
}

impl WebhookProcessor {
    pub fn new(
        store: Arc<dyn BillingStore>,
        catalog: Arc<TierCatalog>,
        subscriptions: SubscriptionManager,
        credits: CreditLedger,
        verifier: SignatureVerifier,
        policy: WebhookPolicy,
    ) -> Self {
        Self {
            store,
            catalog,
            subscriptions,
            credits,
            verifier,
            policy,
        }
    }

    /// Entry point for a signed delivery. Nothing is stored unless the
    /// signature verifies.
    pub async fn handle(
        &self,
        payload: &[u8],
        signature: Option<&str>,
    ) -> Result<WebhookOutcome, AppError> {
        let verified = match signature {
            Some(header) => self.verifier.verify(payload, header),
            None => Err(SignatureError::MalformedHeader),
        };
        if let Err(e) = verified {
            warn!(error = %e, "Rejected webhook with invalid signature, possible tampering");
            return Err(AppError::WebhookSignatureInvalid);
        }

        let raw_payload = std::str::from_utf8(payload)
            .map_err(|_| AppError::Validation("webhook payload is not UTF-8".to_string()))?;
        let event: ProviderEvent = serde_json::from_str(raw_payload).map_err(|e| {
            warn!(error = %e, "Failed to parse webhook payload");
            AppError::Validation("malformed webhook payload".to_string())
        })?;

        self.claim_and_apply(event, raw_payload.to_string()).await
    }

    #[instrument(skip(self, event, raw_payload), fields(event_id = %event.id, event_type = %event.event_type))]
    async fn claim_and_apply(
        &self,
        event: ProviderEvent,
        raw_payload: String,
    ) -> Result<WebhookOutcome, AppError> {
        let claim = self
            .store
            .claim_webhook_event(
                NewWebhookEvent {
                    external_event_id: event.id.clone(),
                    event_type: event.event_type.clone(),
                    raw_payload,
                },
                self.policy.lease,
                self.policy.max_retries,
            )
            .await?;

        match claim {
            WebhookClaim::Claimed(record) => {
                if record.retry_count > 0 {
                    info!(retry_count = record.retry_count, "Retrying failed webhook event");
                }
                self.apply(&event).await
            }
            WebhookClaim::AlreadyProcessed => {
                debug!("Webhook event already processed");
                Ok(WebhookOutcome::AlreadyProcessed)
            }
            WebhookClaim::InFlight => {
                debug!("Webhook event in flight elsewhere");
                Ok(WebhookOutcome::InFlight)
            }
            WebhookClaim::NeedsReview => Ok(WebhookOutcome::NeedsReview),
        }
    }

    async fn apply(&self, event: &ProviderEvent) -> Result<WebhookOutcome, AppError> {
        match self.dispatch(event).await {
            Ok(outcome) => {
                self.store.complete_webhook_event(&event.id).await?;
                info!(outcome = ?outcome, "Webhook event applied");
                Ok(outcome)
            }
            Err(e) => {
                let record = self
                    .store
                    .fail_webhook_event(&event.id, &e.to_string(), self.policy.max_retries)
                    .await?;
                if record.needs_review {
                    error!(
                        error = %e,
                        retry_count = record.retry_count,
                        needs_review = true,
                        "Webhook event exhausted its retries"
                    );
                } else {
                    warn!(
                        error = %e,
                        retryable = e.is_retryable(),
                        retry_count = record.retry_count,
                        "Webhook event failed"
                    );
                }
                Err(AppError::WebhookProcessingFailed(event.id.clone()))
            }
        }
    }

    async fn dispatch(&self, event: &ProviderEvent) -> Result<WebhookOutcome, AppError> {
        let Some(kind) = WebhookEventKind::parse(&event.event_type) else {
            return Ok(WebhookOutcome::Ignored);
        };
        let actor = Actor::BillingProvider {
            event_id: event.id.clone(),
        };

        match kind {
            // Subscriptions are created through the API at checkout.
            WebhookEventKind::SubscriptionCreated => Ok(WebhookOutcome::Ignored),
            WebhookEventKind::SubscriptionUpdated => {
                let object: SubscriptionObject = parse_object(event)?;
                let status = SubscriptionStatus::from_provider(&object.status).ok_or_else(|| {
                    AppError::Validation(format!("unknown provider status '{}'", object.status))
                })?;
                let state = ProviderState {
                    tier_id: object.metadata.get("tier_id").cloned(),
                    status,
                    cancel_at_period_end: object.cancel_at_period_end,
                    observed_at: timestamp(event.created)?,
                };
                self.subscriptions
                    .apply_provider_state(&actor, &object.id, state)
                    .await?;
                Ok(WebhookOutcome::Processed)
            }
            WebhookEventKind::SubscriptionDeleted => {
                let object: SubscriptionObject = parse_object(event)?;
                self.subscriptions
                    .cancel_by_external_ref(&actor, &object.id)
                    .await?;
                Ok(WebhookOutcome::Processed)
            }
            WebhookEventKind::InvoicePaid => {
                let invoice: InvoiceObject = parse_object(event)?;
                // The first invoice pays for the period opened at creation.
                if invoice.billing_reason.as_deref() == Some("subscription_create") {
                    return Ok(WebhookOutcome::Ignored);
                }
                let Some(external_ref) = invoice.subscription else {
                    return Ok(WebhookOutcome::Ignored);
                };
                // Without the settled period the renewal cannot be made idempotent.
                let billed_period_end = invoice.period_end.ok_or_else(|| {
                    AppError::Validation("paid invoice has no period_end".to_string())
                })?;
                self.subscriptions
                    .renew_for_invoice(
                        &actor,
                        &external_ref,
                        timestamp(billed_period_end)?,
                        timestamp(event.created)?,
                    )
                    .await?;
                Ok(WebhookOutcome::Processed)
            }
            WebhookEventKind::InvoicePaymentFailed => {
                let invoice: InvoiceObject = parse_object(event)?;
                let Some(external_ref) = invoice.subscription else {
                    return Ok(WebhookOutcome::Ignored);
                };
                self.subscriptions
                    .mark_past_due(&actor, &external_ref, timestamp(event.created)?)
                    .await?;
                Ok(WebhookOutcome::Processed)
            }
            WebhookEventKind::CheckoutCompleted => self.grant_credit_pack(&actor, event).await,
        }
    }

    async fn grant_credit_pack(
        &self,
        actor: &Actor,
        event: &ProviderEvent,
    ) -> Result<WebhookOutcome, AppError> {
        let session: CheckoutObject = parse_object(event)?;
        let (Some(user_id), Some(tier_id)) =
            (session.metadata.get("user_id"), session.metadata.get("tier_id"))
        else {
            return Ok(WebhookOutcome::Ignored);
        };
        let tier = self.catalog.validate(tier_id)?;
        if tier.is_subscription() {
            return Ok(WebhookOutcome::Ignored);
        }
        let user_id = Uuid::parse_str(user_id)
            .map_err(|_| AppError::Validation("checkout user_id is not a UUID".to_string()))?;
        let amount = match tier.monthly_allowance {
            Quota::Limited(n) => n,
            Quota::Unlimited => {
                return Err(AppError::InvalidTier(format!(
                    "credit pack '{}' has no fixed size",
                    tier.id
                )))
            }
        };

        self.credits
            .add_once(actor, user_id, amount, &event.id)
            .await?;
        Ok(WebhookOutcome::Processed)
    }

    /// Re-runs stored events that failed and still have retries left.
    /// Returns how many were applied.
    pub async fn reprocess_failed(&self, limit: i64) -> Result<usize, AppError> {
        let pending = self
            .store
            .webhook_events_for_retry(Utc::now(), limit)
            .await?;
        let mut applied = 0;
        for record in pending {
            let event: ProviderEvent = match serde_json::from_str(&record.raw_payload) {
                Ok(event) => event,
                Err(e) => {
                    self.store
                        .fail_webhook_event(
                            &record.external_event_id,
                            &format!("stored payload unreadable: {e}"),
                            self.policy.max_retries,
                        )
                        .await?;
                    continue;
                }
            };
            match self.claim_and_apply(event, record.raw_payload).await {
                Ok(WebhookOutcome::Processed | WebhookOutcome::Ignored) => applied += 1,
                Ok(_) => {}
                Err(e) => debug!(event_id = %record.external_event_id, error = %e, "Reprocessing failed"),
            }
        }
        Ok(applied)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::billing::memory_store::MemoryBillingStore;
    use crate::models::subscription::Subscription;
    use secrecy::SecretString;
    use serde_json::json;

    struct Harness {
        processor: WebhookProcessor,
        subscriptions: SubscriptionManager,
        credits: CreditLedger,
        store: Arc<MemoryBillingStore>,
        verifier: SignatureVerifier,
    }

    fn harness(max_retries: i32) -> Harness {
        let store = Arc::new(MemoryBillingStore::new());
        let catalog = Arc::new(TierCatalog::builtin());
        let subscriptions = SubscriptionManager::new(store.clone(), catalog.clone());
        let credits = CreditLedger::new(store.clone());
        let verifier = SignatureVerifier::new(
            SecretString::new("whsec_test".to_string()),
            Duration::from_secs(300),
        );
        let processor = WebhookProcessor::new(
            store.clone(),
            catalog,
            subscriptions.clone(),
            credits.clone(),
            verifier.clone(),
            WebhookPolicy {
                lease: Duration::from_secs(60),
                max_retries,
            },
        );
        Harness {
            processor,
            subscriptions,
            credits,
            store,
            verifier,
        }
    }

    fn event(id: &str, event_type: &str, created: i64, object: serde_json::Value) -> Vec<u8> {
        serde_json::to_vec(&json!({
            "id": id,
            "type": event_type,
            "created": created,
            "data": { "object": object },
        }))
        .unwrap()
    }

    impl Harness {
        async fn deliver(&self, body: &[u8]) -> Result<WebhookOutcome, AppError> {
            let header = self.verifier.sign(body, Utc::now().timestamp());
            self.processor.handle(body, Some(&header)).await
        }

        async fn subscribe(&self, external_ref: &str) -> Subscription {
            let user = Uuid::new_v4();
            self.subscriptions
                .create(&Actor::User(user), user, "flow_pro", external_ref)
                .await
                .unwrap()
        }

        async fn pending(&self) -> usize {
            self.store
                .webhook_events_for_retry(Utc::now() + chrono::Duration::days(1), 100)
                .await
                .unwrap()
                .len()
        }
    }

    #[tokio::test]
    async fn test_invalid_signature_stores_nothing() {
        let h = harness(5);
        let body = event("evt_1", "customer.subscription.deleted", 0, json!({"id": "sub_x", "status": "canceled"}));

        let err = h.processor.handle(&body, Some("t=1,v1=00")).await.unwrap_err();
        assert!(matches!(err, AppError::WebhookSignatureInvalid));
        let err = h.processor.handle(&body, None).await.unwrap_err();
        assert!(matches!(err, AppError::WebhookSignatureInvalid));
        assert_eq!(h.pending().await, 0);
    }

    #[tokio::test]
    async fn test_duplicate_delivery_applies_once() {
        let h = harness(5);
        let sub = h.subscribe("sub_dup").await;
        let body = event(
            "evt_del",
            "customer.subscription.deleted",
            Utc::now().timestamp(),
            json!({"id": "sub_dup", "status": "canceled"}),
        );

        assert_eq!(h.deliver(&body).await.unwrap(), WebhookOutcome::Processed);
        let once = h.subscriptions.get(sub.id).await.unwrap();
        assert_eq!(h.deliver(&body).await.unwrap(), WebhookOutcome::AlreadyProcessed);
        let twice = h.subscriptions.get(sub.id).await.unwrap();

        assert_eq!(once.status, SubscriptionStatus::Canceled);
        assert_eq!(once, twice);
    }

    #[tokio::test]
    async fn test_out_of_order_updates_converge_on_newest() {
        let h = harness(5);
        let sub = h.subscribe("sub_ooo").await;
        let base = Utc::now().timestamp();
        let older = event(
            "evt_old",
            "customer.subscription.updated",
            base - 60,
            json!({"id": "sub_ooo", "status": "past_due", "metadata": {"tier_id": "flow_pro"}}),
        );
        let newer = event(
            "evt_new",
            "customer.subscription.updated",
            base,
            json!({"id": "sub_ooo", "status": "active", "cancel_at_period_end": true,
                   "metadata": {"tier_id": "flow_starter"}}),
        );

        h.deliver(&newer).await.unwrap();
        h.deliver(&older).await.unwrap();

        let stored = h.subscriptions.get(sub.id).await.unwrap();
        assert_eq!(stored.tier_id, "flow_starter");
        assert_eq!(stored.status, SubscriptionStatus::Active);
        assert!(stored.cancel_at_period_end);
    }

    #[tokio::test]
    async fn test_invoice_paid_renews_once_per_period() {
        let h = harness(5);
        let sub = h.subscribe("sub_inv").await;
        let period_end = sub.current_period_end.timestamp();
        let base = Utc::now().timestamp();
        let invoice = |id: &str, created: i64| {
            event(
                id,
                "invoice.paid",
                created,
                json!({"subscription": "sub_inv", "billing_reason": "subscription_cycle",
                       "period_end": period_end}),
            )
        };

        h.deliver(&invoice("evt_inv_a", base)).await.unwrap();
        let renewed = h.subscriptions.get(sub.id).await.unwrap();
        assert_eq!(renewed.current_period_start, sub.current_period_end);

        h.deliver(&invoice("evt_inv_b", base + 30)).await.unwrap();
        let again = h.subscriptions.get(sub.id).await.unwrap();
        assert_eq!(again.current_period_start, renewed.current_period_start);
        assert_eq!(again.current_period_end, renewed.current_period_end);
        assert_eq!(again.analyses_rollover, renewed.analyses_rollover);
    }

    #[tokio::test]
    async fn test_paid_invoice_without_period_end_is_rejected() {
        let h = harness(5);
        let sub = h.subscribe("sub_no_period").await;
        let body = event(
            "evt_no_period",
            "invoice.paid",
            Utc::now().timestamp(),
            json!({"subscription": "sub_no_period", "billing_reason": "subscription_cycle"}),
        );
        assert!(matches!(
            h.deliver(&body).await,
            Err(AppError::WebhookProcessingFailed(_))
        ));
        assert_eq!(
            h.subscriptions.get(sub.id).await.unwrap().current_period_start,
            sub.current_period_start
        );
    }

    fn paid(id: &str, external_ref: &str, created: i64, period_end: i64) -> Vec<u8> {
        event(
            id,
            "invoice.paid",
            created,
            json!({"subscription": external_ref, "billing_reason": "subscription_cycle",
                   "period_end": period_end}),
        )
    }

    fn payment_failed(id: &str, external_ref: &str, created: i64) -> Vec<u8> {
        event(id, "invoice.payment_failed", created, json!({"subscription": external_ref}))
    }

    fn updated(id: &str, external_ref: &str, created: i64, status: &str) -> Vec<u8> {
        event(
            id,
            "customer.subscription.updated",
            created,
            json!({"id": external_ref, "status": status}),
        )
    }

    #[tokio::test]
    async fn test_older_payment_failure_after_paid_invoice_is_ignored() {
        let h = harness(5);
        let sub = h.subscribe("sub_late_fail").await;
        let base = Utc::now().timestamp();
        let boundary = sub.current_period_end.timestamp();

        h.deliver(&paid("evt_paid", "sub_late_fail", base + 100, boundary))
            .await
            .unwrap();
        h.deliver(&payment_failed("evt_fail", "sub_late_fail", base))
            .await
            .unwrap();

        let stored = h.subscriptions.get(sub.id).await.unwrap();
        assert_eq!(stored.status, SubscriptionStatus::Active);
        assert_eq!(stored.current_period_start, sub.current_period_end);
    }

    #[tokio::test]
    async fn test_past_due_update_older_than_recovery_is_ignored() {
        let h = harness(5);
        let sub = h.subscribe("sub_late_update").await;
        let base = Utc::now().timestamp();
        let boundary = sub.current_period_end.timestamp();

        h.deliver(&payment_failed("evt_fail", "sub_late_update", base))
            .await
            .unwrap();
        h.deliver(&paid("evt_paid", "sub_late_update", base + 100, boundary))
            .await
            .unwrap();
        h.deliver(&updated("evt_upd", "sub_late_update", base + 50, "past_due"))
            .await
            .unwrap();

        assert_eq!(
            h.subscriptions.get(sub.id).await.unwrap().status,
            SubscriptionStatus::Active
        );
    }

    #[tokio::test]
    async fn test_paid_retry_after_scheduled_renewal_reactivates() {
        let h = harness(5);
        let sub = h.subscribe("sub_dunning_cycle").await;
        let base = Utc::now().timestamp();
        let boundary = sub.current_period_end.timestamp();

        h.subscriptions
            .renew_period(&Actor::Scheduler, sub.id, sub.current_period_start)
            .await
            .unwrap();
        h.deliver(&payment_failed("evt_fail", "sub_dunning_cycle", base))
            .await
            .unwrap();
        assert_eq!(
            h.subscriptions.get(sub.id).await.unwrap().status,
            SubscriptionStatus::PastDue
        );

        h.deliver(&paid("evt_paid", "sub_dunning_cycle", base + 100, boundary))
            .await
            .unwrap();
        let stored = h.subscriptions.get(sub.id).await.unwrap();
        assert_eq!(stored.status, SubscriptionStatus::Active);
        // The sweep already opened this period; the invoice must not open another.
        assert_eq!(stored.current_period_start, sub.current_period_end);
    }

    #[tokio::test]
    async fn test_mixed_event_orders_converge() {
        let orders: [[usize; 3]; 6] = [
            [0, 1, 2],
            [0, 2, 1],
            [1, 0, 2],
            [1, 2, 0],
            [2, 0, 1],
            [2, 1, 0],
        ];
        for swept_first in [false, true] {
            for order in orders {
                let h = harness(5);
                let sub = h.subscribe("sub_mix").await;
                let base = Utc::now().timestamp();
                let boundary = sub.current_period_end.timestamp();
                if swept_first {
                    h.subscriptions
                        .renew_period(&Actor::Scheduler, sub.id, sub.current_period_start)
                        .await
                        .unwrap();
                }

                let events = [
                    payment_failed("evt_fail", "sub_mix", base),
                    updated("evt_upd", "sub_mix", base + 50, "active"),
                    paid("evt_paid", "sub_mix", base + 100, boundary),
                ];
                for i in order {
                    h.deliver(&events[i]).await.unwrap();
                }

                let stored = h.subscriptions.get(sub.id).await.unwrap();
                assert_eq!(
                    stored.status,
                    SubscriptionStatus::Active,
                    "order {order:?}, swept first: {swept_first}"
                );
                assert_eq!(stored.current_period_start, sub.current_period_end);
                assert_eq!(
                    stored.last_event_at.map(|t| t.timestamp()),
                    Some(base + 100)
                );
            }
        }
    }

    #[tokio::test]
    async fn test_first_invoice_does_not_renew() {
        let h = harness(5);
        let sub = h.subscribe("sub_first").await;
        let body = event(
            "evt_first",
            "invoice.paid",
            Utc::now().timestamp(),
            json!({"subscription": "sub_first", "billing_reason": "subscription_create"}),
        );
        assert_eq!(h.deliver(&body).await.unwrap(), WebhookOutcome::Ignored);
        assert_eq!(
            h.subscriptions.get(sub.id).await.unwrap().current_period_start,
            sub.current_period_start
        );
    }

    #[tokio::test]
    async fn test_payment_failure_then_payment_recovers() {
        let h = harness(5);
        let sub = h.subscribe("sub_dunning").await;
        let now = Utc::now().timestamp();

        h.deliver(&event("evt_fail", "invoice.payment_failed", now, json!({"subscription": "sub_dunning"})))
            .await
            .unwrap();
        assert_eq!(
            h.subscriptions.get(sub.id).await.unwrap().status,
            SubscriptionStatus::PastDue
        );

        h.deliver(&event(
            "evt_paid",
            "invoice.paid",
            now + 1,
            json!({"subscription": "sub_dunning", "billing_reason": "subscription_cycle",
                   "period_end": sub.current_period_end.timestamp()}),
        ))
        .await
        .unwrap();
        assert_eq!(
            h.subscriptions.get(sub.id).await.unwrap().status,
            SubscriptionStatus::Active
        );
    }

    #[tokio::test]
    async fn test_failures_are_bounded_then_flagged_for_review() {
        let h = harness(2);
        let body = event(
            "evt_orphan",
            "customer.subscription.deleted",
            Utc::now().timestamp(),
            json!({"id": "sub_missing", "status": "canceled"}),
        );

        for _ in 0..2 {
            let err = h.deliver(&body).await.unwrap_err();
            assert!(matches!(err, AppError::WebhookProcessingFailed(_)));
        }
        assert_eq!(h.deliver(&body).await.unwrap(), WebhookOutcome::NeedsReview);
        assert_eq!(h.pending().await, 0);
    }

    #[tokio::test]
    async fn test_reprocess_applies_event_once_dependency_exists() {
        let h = harness(5);
        let body = event(
            "evt_early",
            "customer.subscription.deleted",
            Utc::now().timestamp(),
            json!({"id": "sub_late", "status": "canceled"}),
        );
        assert!(h.deliver(&body).await.is_err());
        assert_eq!(h.pending().await, 1);

        let sub = h.subscribe("sub_late").await;
        assert_eq!(h.processor.reprocess_failed(10).await.unwrap(), 1);
        assert_eq!(
            h.subscriptions.get(sub.id).await.unwrap().status,
            SubscriptionStatus::Canceled
        );
        assert_eq!(h.pending().await, 0);
        assert_eq!(h.deliver(&body).await.unwrap(), WebhookOutcome::AlreadyProcessed);
    }

    #[tokio::test]
    async fn test_credit_pack_checkout_grants_once() {
        let h = harness(5);
        let user = Uuid::new_v4();
        let body = event(
            "evt_pack",
            "checkout.session.completed",
            Utc::now().timestamp(),
            json!({"mode": "payment", "metadata": {"user_id": user.to_string(), "tier_id": "credits_5"}}),
        );

        assert_eq!(h.deliver(&body).await.unwrap(), WebhookOutcome::Processed);
        assert_eq!(h.deliver(&body).await.unwrap(), WebhookOutcome::AlreadyProcessed);
        assert_eq!(h.credits.balance(user).await.unwrap(), 5);
    }

    #[tokio::test]
    async fn test_subscription_checkout_is_ignored() {
        let h = harness(5);
        let user = Uuid::new_v4();
        let body = event(
            "evt_sub_checkout",
            "checkout.session.completed",
            Utc::now().timestamp(),
            json!({"mode": "subscription", "metadata": {"user_id": user.to_string(), "tier_id": "flow_pro"}}),
        );
        assert_eq!(h.deliver(&body).await.unwrap(), WebhookOutcome::Ignored);
        assert_eq!(h.credits.balance(user).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_unknown_event_type_is_acknowledged() {
        let h = harness(5);
        let body = event("evt_misc", "customer.created", Utc::now().timestamp(), json!({}));
        assert_eq!(h.deliver(&body).await.unwrap(), WebhookOutcome::Ignored);
        assert_eq!(h.deliver(&body).await.unwrap(), WebhookOutcome::AlreadyProcessed);
    }

    #[tokio::test]
    async fn test_unknown_provider_status_is_a_processing_error() {
        let h = harness(5);
        h.subscribe("sub_weird").await;
        let body = event(
            "evt_weird",
            "customer.subscription.updated",
            Utc::now().timestamp(),
            json!({"id": "sub_weird", "status": "on_fire"}),
        );
        assert!(matches!(
            h.deliver(&body).await,
            Err(AppError::WebhookProcessingFailed(_))
        ));
    }

    #[test]
    fn test_event_kind_table_covers_handled_types() {
        assert_eq!(
            WebhookEventKind::parse("invoice.payment_failed"),
            Some(WebhookEventKind::InvoicePaymentFailed)
        );
        assert_eq!(WebhookEventKind::parse("invoice.created"), None);
    }
}
