//! PostgreSQL `BillingStore`.
//!
//! Debits are single conditional `UPDATE ... WHERE <entitlement holds> RETURNING`
//! statements; Postgres re-evaluates the predicate after acquiring the row lock,
//! so two racing debits against one remaining unit cannot both match.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{FromRow, PgPool};
use uuid::Uuid;

use crate::billing::store::{BillingStore, Consumption, Debit, RenewalCursor};
use crate::billing::tiers::Quota;
use crate::errors::AppError;
use crate::models::credit::CreditBalance;
use crate::models::subscription::{NewSubscription, Subscription, SubscriptionStatus};
use crate::models::usage::{NewUsageEvent, UsageEvent, UsageSource};
use crate::models::webhook::{NewWebhookEvent, WebhookClaim, WebhookEventRecord};

const ONE_ACTIVE_PER_USER: &str = "subscriptions_one_active_per_user";
const EXTERNAL_REF_KEY: &str = "subscriptions_external_ref_key";
/// Postgres `numeric_value_out_of_range`.
const NUMERIC_VALUE_OUT_OF_RANGE: &str = "22003";

const SUBSCRIPTION_COLUMNS: &str = "id, user_id, tier_id, status, current_period_start, \
     current_period_end, billing_anchor_day, analyses_used_this_period, analyses_rollover, \
     cancel_at_period_end, canceled_at, external_subscription_ref, last_event_at, version, \
     created_at, updated_at";

const USAGE_COLUMNS: &str =
    "id, user_id, source, amount, subscription_id, correlation_id, occurred_at";

const WEBHOOK_COLUMNS: &str = "external_event_id, event_type, raw_payload, processed, \
     processing_error, retry_count, needs_review, claimed_until, received_at, processed_at";

#[derive(Debug, FromRow)]
struct SubscriptionRow {
    id: Uuid,
    user_id: Uuid,
    tier_id: String,
    status: String,
    current_period_start: DateTime<Utc>,
    current_period_end: DateTime<Utc>,
    billing_anchor_day: i32,
    analyses_used_this_period: i32,
    analyses_rollover: i32,
    cancel_at_period_end: bool,
    canceled_at: Option<DateTime<Utc>>,
    external_subscription_ref: String,
    last_event_at: Option<DateTime<Utc>>,
    version: i64,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<SubscriptionRow> for Subscription {
    type Error = AppError;

    fn try_from(row: SubscriptionRow) -> Result<Self, Self::Error> {
        let status = SubscriptionStatus::parse(&row.status).ok_or_else(|| {
            AppError::Internal(anyhow::anyhow!(
                "subscription {} has unknown status '{}'",
                row.id,
                row.status
            ))
        })?;
        Ok(Subscription {
            id: row.id,
            user_id: row.user_id,
            tier_id: row.tier_id,
            status,
            current_period_start: row.current_period_start,
            current_period_end: row.current_period_end,
            billing_anchor_day: row.billing_anchor_day,
            analyses_used_this_period: row.analyses_used_this_period,
            analyses_rollover: row.analyses_rollover,
            cancel_at_period_end: row.cancel_at_period_end,
            canceled_at: row.canceled_at,
            external_subscription_ref: row.external_subscription_ref,
            last_event_at: row.last_event_at,
            version: row.version,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(Debug, FromRow)]
struct UsageRow {
    id: Uuid,
    user_id: Uuid,
    source: String,
    amount: i32,
    subscription_id: Option<Uuid>,
    correlation_id: Uuid,
    occurred_at: DateTime<Utc>,
}

impl TryFrom<UsageRow> for UsageEvent {
    type Error = AppError;

    fn try_from(row: UsageRow) -> Result<Self, Self::Error> {
        let source = UsageSource::parse(&row.source).ok_or_else(|| {
            AppError::Internal(anyhow::anyhow!(
                "usage event {} has unknown source '{}'",
                row.id,
                row.source
            ))
        })?;
        Ok(UsageEvent {
            id: row.id,
            user_id: row.user_id,
            source,
            amount: row.amount,
            subscription_id: row.subscription_id,
            correlation_id: row.correlation_id,
            occurred_at: row.occurred_at,
        })
    }
}

fn map_subscription_write(e: sqlx::Error) -> AppError {
    if let sqlx::Error::Database(db) = &e {
        match db.constraint() {
            Some(ONE_ACTIVE_PER_USER) => return AppError::DuplicateActiveSubscription,
            Some(EXTERNAL_REF_KEY) => {
                return AppError::Validation(
                    "external subscription reference is already linked".to_string(),
                )
            }
            _ => {}
        }
    }
    AppError::Database(e)
}

fn map_credit_write(e: sqlx::Error) -> AppError {
    if let sqlx::Error::Database(db) = &e {
        if db.code().as_deref() == Some(NUMERIC_VALUE_OUT_OF_RANGE) {
            return AppError::Validation("credit balance would overflow".to_string());
        }
    }
    AppError::Database(e)
}

fn optional_subscription(row: Option<SubscriptionRow>) -> Result<Option<Subscription>, AppError> {
    row.map(Subscription::try_from).transpose()
}

#[derive(Clone)]
pub struct PgBillingStore {
    pool: PgPool,
}

impl PgBillingStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl BillingStore for PgBillingStore {
    async fn insert_subscription(&self, new: NewSubscription) -> Result<Subscription, AppError> {
        let row: SubscriptionRow = sqlx::query_as(&format!(
            r#"
            INSERT INTO subscriptions
                (id, user_id, tier_id, status, current_period_start, current_period_end,
                 billing_anchor_day, external_subscription_ref)
            VALUES ($1, $2, $3, 'active', $4, $5, $6, $7)
            RETURNING {SUBSCRIPTION_COLUMNS}
            "#
        ))
        .bind(Uuid::new_v4())
        .bind(new.user_id)
        .bind(&new.tier_id)
        .bind(new.current_period_start)
        .bind(new.current_period_end)
        .bind(new.billing_anchor_day)
        .bind(&new.external_subscription_ref)
        .fetch_one(&self.pool)
        .await
        .map_err(map_subscription_write)?;
        row.try_into()
    }

    async fn subscription(&self, id: Uuid) -> Result<Option<Subscription>, AppError> {
        let row: Option<SubscriptionRow> = sqlx::query_as(&format!(
            "SELECT {SUBSCRIPTION_COLUMNS} FROM subscriptions WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        optional_subscription(row)
    }

    async fn subscription_by_external_ref(
        &self,
        external_ref: &str,
    ) -> Result<Option<Subscription>, AppError> {
        let row: Option<SubscriptionRow> = sqlx::query_as(&format!(
            "SELECT {SUBSCRIPTION_COLUMNS} FROM subscriptions WHERE external_subscription_ref = $1"
        ))
        .bind(external_ref)
        .fetch_optional(&self.pool)
        .await?;
        optional_subscription(row)
    }

    async fn active_subscription(&self, user_id: Uuid) -> Result<Option<Subscription>, AppError> {
        let row: Option<SubscriptionRow> = sqlx::query_as(&format!(
            "SELECT {SUBSCRIPTION_COLUMNS} FROM subscriptions WHERE user_id = $1 AND status = 'active'"
        ))
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;
        optional_subscription(row)
    }

    async fn latest_subscription(&self, user_id: Uuid) -> Result<Option<Subscription>, AppError> {
        let row: Option<SubscriptionRow> = sqlx::query_as(&format!(
            r#"
            SELECT {SUBSCRIPTION_COLUMNS} FROM subscriptions
            WHERE user_id = $1
            ORDER BY created_at DESC
            LIMIT 1
            "#
        ))
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;
        optional_subscription(row)
    }

    async fn compare_and_save_subscription(
        &self,
        subscription: &Subscription,
        expected_version: i64,
    ) -> Result<Option<Subscription>, AppError> {
        let row: Option<SubscriptionRow> = sqlx::query_as(&format!(
            r#"
            UPDATE subscriptions
            SET tier_id = $3,
                status = $4,
                current_period_start = $5,
                current_period_end = $6,
                billing_anchor_day = $7,
                analyses_used_this_period = $8,
                analyses_rollover = $9,
                cancel_at_period_end = $10,
                canceled_at = $11,
                last_event_at = $12,
                version = version + 1,
                updated_at = NOW()
            WHERE id = $1 AND version = $2
            RETURNING {SUBSCRIPTION_COLUMNS}
            "#
        ))
        .bind(subscription.id)
        .bind(expected_version)
        .bind(&subscription.tier_id)
        .bind(subscription.status.as_str())
        .bind(subscription.current_period_start)
        .bind(subscription.current_period_end)
        .bind(subscription.billing_anchor_day)
        .bind(subscription.analyses_used_this_period)
        .bind(subscription.analyses_rollover)
        .bind(subscription.cancel_at_period_end)
        .bind(subscription.canceled_at)
        .bind(subscription.last_event_at)
        .fetch_optional(&self.pool)
        .await
        .map_err(map_subscription_write)?;
        optional_subscription(row)
    }

    async fn subscriptions_due_for_renewal(
        &self,
        now: DateTime<Utc>,
        after: Option<RenewalCursor>,
        limit: i64,
    ) -> Result<Vec<Subscription>, AppError> {
        let (after_end, after_id) = after.unzip();
        let rows: Vec<SubscriptionRow> = sqlx::query_as(&format!(
            r#"
            SELECT {SUBSCRIPTION_COLUMNS} FROM subscriptions
            WHERE status = 'active' AND current_period_end <= $1
              AND ($2::timestamptz IS NULL OR (current_period_end, id) > ($2, $3::uuid))
            ORDER BY current_period_end ASC, id ASC
            LIMIT $4
            "#
        ))
        .bind(now)
        .bind(after_end)
        .bind(after_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(Subscription::try_from).collect()
    }

    async fn credit_balance(&self, user_id: Uuid) -> Result<i32, AppError> {
        let balance: Option<i32> =
            sqlx::query_scalar("SELECT balance FROM credit_balances WHERE user_id = $1")
                .bind(user_id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(balance.unwrap_or(0))
    }

    async fn grant_credits(
        &self,
        user_id: Uuid,
        amount: i32,
        grant_ref: &str,
    ) -> Result<Option<CreditBalance>, AppError> {
        let mut tx = self.pool.begin().await?;

        let inserted: Option<String> = sqlx::query_scalar(
            r#"
            INSERT INTO credit_grants (grant_ref, user_id, amount)
            VALUES ($1, $2, $3)
            ON CONFLICT (grant_ref) DO NOTHING
            RETURNING grant_ref
            "#,
        )
        .bind(grant_ref)
        .bind(user_id)
        .bind(amount)
        .fetch_optional(&mut *tx)
        .await?;
        if inserted.is_none() {
            return Ok(None);
        }

        let balance: CreditBalance = sqlx::query_as(
            r#"
            INSERT INTO credit_balances (user_id, balance)
            VALUES ($1, $2)
            ON CONFLICT (user_id) DO UPDATE
                SET balance = credit_balances.balance + EXCLUDED.balance,
                    updated_at = NOW()
            RETURNING user_id, balance, updated_at
            "#,
        )
        .bind(user_id)
        .bind(amount)
        .fetch_one(&mut *tx)
        .await
        .map_err(map_credit_write)?;

        tx.commit().await?;
        Ok(Some(balance))
    }

    async fn record_consumption(
        &self,
        debit: Debit,
        usage: NewUsageEvent,
    ) -> Result<Option<Consumption>, AppError> {
        let mut tx = self.pool.begin().await?;

        let (source, subscription_id, remaining) = match debit {
            Debit::Subscription {
                subscription_id,
                allowance,
            } => {
                let limit: i32 = allowance.into();
                let debited: Option<(i32, i32)> = sqlx::query_as(
                    r#"
                    UPDATE subscriptions
                    SET analyses_used_this_period = analyses_used_this_period + 1,
                        version = version + 1,
                        updated_at = NOW()
                    WHERE id = $1
                      AND user_id = $2
                      AND status = 'active'
                      AND ($3 < 0 OR analyses_used_this_period < $3 + analyses_rollover)
                    RETURNING analyses_used_this_period, analyses_rollover
                    "#,
                )
                .bind(subscription_id)
                .bind(usage.user_id)
                .bind(limit)
                .fetch_optional(&mut *tx)
                .await?;
                let Some((used, rollover)) = debited else {
                    return Ok(None);
                };
                let remaining = match allowance {
                    Quota::Unlimited => None,
                    Quota::Limited(allowance) => Some(allowance + rollover - used),
                };
                (UsageSource::Subscription, Some(subscription_id), remaining)
            }
            Debit::Credit => {
                let balance: Option<i32> = sqlx::query_scalar(
                    r#"
                    UPDATE credit_balances
                    SET balance = balance - 1, updated_at = NOW()
                    WHERE user_id = $1 AND balance >= 1
                    RETURNING balance
                    "#,
                )
                .bind(usage.user_id)
                .fetch_optional(&mut *tx)
                .await?;
                let Some(balance) = balance else {
                    return Ok(None);
                };
                (UsageSource::Credit, None, Some(balance))
            }
        };

        let row: UsageRow = sqlx::query_as(&format!(
            r#"
            INSERT INTO usage_events (id, user_id, source, amount, subscription_id, correlation_id)
            VALUES ($1, $2, $3, 1, $4, $5)
            RETURNING {USAGE_COLUMNS}
            "#
        ))
        .bind(Uuid::new_v4())
        .bind(usage.user_id)
        .bind(source.as_str())
        .bind(subscription_id)
        .bind(usage.correlation_id)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(Some(Consumption {
            event: row.try_into()?,
            remaining,
        }))
    }

    async fn usage_history(
        &self,
        user_id: Uuid,
        limit: i64,
        page_token: Option<Uuid>,
    ) -> Result<Vec<UsageEvent>, AppError> {
        let rows: Vec<UsageRow> = sqlx::query_as(&format!(
            r#"
            SELECT {USAGE_COLUMNS} FROM usage_events
            WHERE user_id = $1
              AND ($2::uuid IS NULL OR (occurred_at, id) < (
                    SELECT occurred_at, id FROM usage_events WHERE id = $2 AND user_id = $1))
            ORDER BY occurred_at DESC, id DESC
            LIMIT $3
            "#
        ))
        .bind(user_id)
        .bind(page_token)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(UsageEvent::try_from).collect()
    }

    async fn claim_webhook_event(
        &self,
        event: NewWebhookEvent,
        lease: Duration,
        max_retries: i32,
    ) -> Result<WebhookClaim, AppError> {
        // Insert, or steal the lease on an unprocessed event nobody is working on.
        let claimed: Option<WebhookEventRecord> = sqlx::query_as(&format!(
            r#"
            INSERT INTO webhook_events (external_event_id, event_type, raw_payload, claimed_until)
            VALUES ($1, $2, $3, NOW() + make_interval(secs => $4))
            ON CONFLICT (external_event_id) DO UPDATE
                SET claimed_until = EXCLUDED.claimed_until
                WHERE webhook_events.processed = FALSE
                  AND webhook_events.needs_review = FALSE
                  AND webhook_events.retry_count < $5
                  AND (webhook_events.claimed_until IS NULL
                       OR webhook_events.claimed_until < NOW())
            RETURNING {WEBHOOK_COLUMNS}
            "#
        ))
        .bind(&event.external_event_id)
        .bind(&event.event_type)
        .bind(&event.raw_payload)
        .bind(lease.as_secs_f64())
        .bind(max_retries)
        .fetch_optional(&self.pool)
        .await?;

        if let Some(record) = claimed {
            return Ok(WebhookClaim::Claimed(record));
        }

        let existing: Option<(bool, bool, i32)> = sqlx::query_as(
            "SELECT processed, needs_review, retry_count FROM webhook_events WHERE external_event_id = $1",
        )
        .bind(&event.external_event_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(match existing {
            Some((true, _, _)) => WebhookClaim::AlreadyProcessed,
            Some((false, needs_review, retries)) if needs_review || retries >= max_retries => {
                WebhookClaim::NeedsReview
            }
            _ => WebhookClaim::InFlight,
        })
    }

    async fn complete_webhook_event(&self, external_event_id: &str) -> Result<(), AppError> {
        sqlx::query(
            r#"
            UPDATE webhook_events
            SET processed = TRUE, processing_error = NULL, claimed_until = NULL, processed_at = NOW()
            WHERE external_event_id = $1 AND processed = FALSE
            "#,
        )
        .bind(external_event_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn fail_webhook_event(
        &self,
        external_event_id: &str,
        error: &str,
        max_retries: i32,
    ) -> Result<WebhookEventRecord, AppError> {
        let record: Option<WebhookEventRecord> = sqlx::query_as(&format!(
            r#"
            UPDATE webhook_events
            SET processed = FALSE,
                processing_error = $2,
                retry_count = retry_count + 1,
                needs_review = (retry_count + 1 >= $3),
                claimed_until = NULL
            WHERE external_event_id = $1
            RETURNING {WEBHOOK_COLUMNS}
            "#
        ))
        .bind(external_event_id)
        .bind(error)
        .bind(max_retries)
        .fetch_optional(&self.pool)
        .await?;
        record.ok_or_else(|| AppError::NotFound("Webhook event not found".to_string()))
    }

    async fn webhook_events_for_retry(
        &self,
        now: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<WebhookEventRecord>, AppError> {
        Ok(sqlx::query_as(&format!(
            r#"
            SELECT {WEBHOOK_COLUMNS} FROM webhook_events
            WHERE processed = FALSE
              AND needs_review = FALSE
              AND (claimed_until IS NULL OR claimed_until <= $1)
            ORDER BY received_at ASC
            LIMIT $2
            "#
        ))
        .bind(now)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?)
    }
}
