use std::sync::Arc;

use crate::billing::arbiter::EntitlementArbiter;
use crate::billing::credits::CreditLedger;
use crate::billing::signature::SignatureVerifier;
use crate::billing::store::BillingStore;
use crate::billing::subscriptions::SubscriptionManager;
use crate::billing::sweeper::Sweeper;
use crate::billing::tiers::TierCatalog;
use crate::billing::webhook::{WebhookPolicy, WebhookProcessor};
use crate::config::Config;

/// Shared application state injected into all route handlers via Axum extractors.
#[derive(Clone)]
pub struct AppState {
    pub config: Config,
    /// Immutable after boot.
    pub catalog: Arc<TierCatalog>,
    /// Postgres in production, in-memory for local runs and tests. Swap via STORE_BACKEND.
    pub store: Arc<dyn BillingStore>,
    pub subscriptions: SubscriptionManager,
    pub credits: CreditLedger,
    pub arbiter: EntitlementArbiter,
    pub webhooks: WebhookProcessor,
}

impl AppState {
    pub fn new(config: Config, store: Arc<dyn BillingStore>, catalog: TierCatalog) -> Self {
        let catalog = Arc::new(catalog);
        let subscriptions = SubscriptionManager::new(store.clone(), catalog.clone());
        let credits = CreditLedger::new(store.clone());
        let arbiter =
            EntitlementArbiter::new(subscriptions.clone(), credits.clone(), config.store_timeout);
        let webhooks = WebhookProcessor::new(
            store.clone(),
            catalog.clone(),
            subscriptions.clone(),
            credits.clone(),
            SignatureVerifier::new(config.webhook_secret.clone(), config.webhook_tolerance),
            WebhookPolicy {
                lease: config.webhook_lease,
                max_retries: config.webhook_max_retries,
            },
        );

        Self {
            config,
            catalog,
            store,
            subscriptions,
            credits,
            arbiter,
            webhooks,
        }
    }

    pub fn sweeper(&self) -> Sweeper {
        Sweeper::new(self.subscriptions.clone(), self.webhooks.clone())
    }
}
