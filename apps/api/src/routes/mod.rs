pub mod health;

use axum::{
    routing::{get, post},
    Router,
};

use crate::billing::handlers;
use crate::state::AppState;

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health::health_handler))
        // Entitlement summary and collaborator entry points
        .route("/api/v1/billing/status", get(handlers::handle_status))
        .route("/api/v1/entitlements/check", get(handlers::handle_check))
        .route("/api/v1/entitlements/consume", post(handlers::handle_consume))
        .route("/api/v1/usage", get(handlers::handle_usage_history))
        // Subscriptions
        .route(
            "/api/v1/subscriptions",
            post(handlers::handle_create_subscription),
        )
        .route(
            "/api/v1/subscriptions/:id",
            get(handlers::handle_get_subscription).patch(handlers::handle_update_subscription),
        )
        .route(
            "/api/v1/subscriptions/:id/cancel",
            post(handlers::handle_cancel_subscription),
        )
        // Billing provider
        .route("/api/v1/webhooks/billing", post(handlers::handle_webhook))
        .with_state(state)
}
