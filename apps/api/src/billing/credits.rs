//! Credit ledger: prepaid analysis credits, independent of subscriptions.

use std::sync::Arc;

use tracing::instrument;
use uuid::Uuid;

use crate::billing::audit::{self, Actor};
use crate::billing::store::{BillingStore, Consumption, Debit};
use crate::errors::AppError;
use crate::models::credit::CreditBalance;
use crate::models::usage::NewUsageEvent;

#[derive(Clone)]
pub struct CreditLedger {
    store: Arc<dyn BillingStore>,
}

impl CreditLedger {
    pub fn new(store: Arc<dyn BillingStore>) -> Self {
        Self { store }
    }

    pub async fn balance(&self, user_id: Uuid) -> Result<i32, AppError> {
        self.store.credit_balance(user_id).await
    }

    /// Adds credits after a confirmed one-time purchase.
    pub async fn add(
        &self,
        actor: &Actor,
        user_id: Uuid,
        amount: i32,
    ) -> Result<CreditBalance, AppError> {
        let grant_ref = format!("manual:{}", Uuid::new_v4());
        self.add_once(actor, user_id, amount, &grant_ref)
            .await?
            .ok_or_else(|| AppError::Internal(anyhow::anyhow!("fresh grant ref collided")))
    }

    /// Adds credits at most once per `grant_ref`. `None` means already granted.
    #[instrument(skip(self, actor), fields(actor = %actor))]
    pub async fn add_once(
        &self,
        actor: &Actor,
        user_id: Uuid,
        amount: i32,
        grant_ref: &str,
    ) -> Result<Option<CreditBalance>, AppError> {
        if amount <= 0 {
            return Err(AppError::Validation(
                "credit amount must be positive".to_string(),
            ));
        }
        let granted = self.store.grant_credits(user_id, amount, grant_ref).await?;
        match &granted {
            Some(balance) => audit::credits_changed(
                actor,
                "credit_purchase",
                user_id,
                balance.balance - amount,
                balance.balance,
            ),
            None => tracing::info!(grant_ref, "Credit grant already applied, skipping"),
        }
        Ok(granted)
    }

    /// Spends one credit. Fails with `InsufficientCredits` at zero balance;
    /// the balance can never go negative.
    #[instrument(skip(self))]
    pub async fn consume(
        &self,
        user_id: Uuid,
        correlation_id: Uuid,
    ) -> Result<Consumption, AppError> {
        let consumption = self
            .store
            .record_consumption(
                Debit::Credit,
                NewUsageEvent {
                    user_id,
                    correlation_id,
                },
            )
            .await?
            .ok_or(AppError::InsufficientCredits)?;

        if let Some(after) = consumption.remaining {
            audit::credits_changed(&Actor::User(user_id), "consume", user_id, after + 1, after);
        }
        Ok(consumption)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::billing::memory_store::MemoryBillingStore;
    use crate::models::usage::UsageSource;

    fn ledger() -> CreditLedger {
        CreditLedger::new(Arc::new(MemoryBillingStore::new()))
    }

    #[tokio::test]
    async fn test_balance_is_zero_before_first_purchase() {
        assert_eq!(ledger().balance(Uuid::new_v4()).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_add_then_consume_decrements() {
        let ledger = ledger();
        let user = Uuid::new_v4();
        ledger.add(&Actor::User(user), user, 2).await.unwrap();

        let spent = ledger.consume(user, Uuid::new_v4()).await.unwrap();
        assert_eq!(spent.event.source, UsageSource::Credit);
        assert_eq!(spent.remaining, Some(1));
        assert_eq!(ledger.balance(user).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_consume_at_zero_fails_and_stays_zero() {
        let ledger = ledger();
        let user = Uuid::new_v4();
        ledger.add(&Actor::User(user), user, 1).await.unwrap();
        ledger.consume(user, Uuid::new_v4()).await.unwrap();

        let err = ledger.consume(user, Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(err, AppError::InsufficientCredits));
        assert_eq!(ledger.balance(user).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_add_rejects_non_positive_amounts() {
        let ledger = ledger();
        let user = Uuid::new_v4();
        assert!(matches!(
            ledger.add(&Actor::User(user), user, 0).await,
            Err(AppError::Validation(_))
        ));
        assert!(matches!(
            ledger.add(&Actor::User(user), user, -3).await,
            Err(AppError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn test_add_once_ignores_replayed_grant() {
        let ledger = ledger();
        let user = Uuid::new_v4();
        let actor = Actor::BillingProvider {
            event_id: "evt_pack".into(),
        };
        assert!(ledger.add_once(&actor, user, 5, "evt_pack").await.unwrap().is_some());
        assert!(ledger.add_once(&actor, user, 5, "evt_pack").await.unwrap().is_none());
        assert_eq!(ledger.balance(user).await.unwrap(), 5);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_consumers_never_overdraw() {
        let ledger = ledger();
        let user = Uuid::new_v4();
        ledger.add(&Actor::User(user), user, 3).await.unwrap();

        let mut handles = Vec::new();
        for _ in 0..10 {
            let ledger = ledger.clone();
            handles.push(tokio::spawn(async move {
                ledger.consume(user, Uuid::new_v4()).await
            }));
        }
        let mut succeeded = 0;
        for handle in handles {
            if handle.await.unwrap().is_ok() {
                succeeded += 1;
            }
        }
        assert_eq!(succeeded, 3);
        assert_eq!(ledger.balance(user).await.unwrap(), 0);
    }
}
