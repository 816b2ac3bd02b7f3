//! Background sweep: renews subscriptions whose period ended and retries
//! webhook events that failed.

use std::time::Duration;

use chrono::Utc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::billing::subscriptions::SubscriptionManager;
use crate::billing::webhook::WebhookProcessor;

const BATCH_SIZE: i64 = 100;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepReport {
    pub renewed: usize,
    pub reprocessed: usize,
}

#[derive(Clone)]
pub struct Sweeper {
    subscriptions: SubscriptionManager,
    webhooks: WebhookProcessor,
}

impl Sweeper {
    pub fn new(subscriptions: SubscriptionManager, webhooks: WebhookProcessor) -> Self {
        Self {
            subscriptions,
            webhooks,
        }
    }

    /// One pass. A failure in one half does not skip the other.
    pub async fn run_once(&self) -> SweepReport {
        let mut report = SweepReport::default();

        match self.subscriptions.renew_due(Utc::now(), BATCH_SIZE).await {
            Ok(renewed) => report.renewed = renewed,
            Err(e) => tracing::error!(error = %e, "Renewal sweep failed"),
        }
        match self.webhooks.reprocess_failed(BATCH_SIZE).await {
            Ok(reprocessed) => report.reprocessed = reprocessed,
            Err(e) => tracing::error!(error = %e, "Webhook reprocessing sweep failed"),
        }

        if report != SweepReport::default() {
            tracing::info!(
                renewed = report.renewed,
                reprocessed = report.reprocessed,
                "Billing sweep completed"
            );
        }
        report
    }

    pub fn spawn(self, every: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                self.run_once().await;
            }
        })
    }
}
