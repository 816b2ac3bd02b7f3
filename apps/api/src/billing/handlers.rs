use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    Json,
};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::billing::arbiter::{EntitlementCheck, EntitlementSource, EntitlementStatus};
use crate::billing::audit::Actor;
use crate::billing::webhook::WebhookOutcome;
use crate::errors::AppError;
use crate::models::subscription::{Subscription, SubscriptionUpdate};
use crate::models::usage::UsageEvent;
use crate::state::AppState;

pub const SIGNATURE_HEADER: &str = "stripe-signature";

const DEFAULT_PAGE_SIZE: i64 = 20;
const MAX_PAGE_SIZE: i64 = 100;

#[derive(Deserialize)]
pub struct UserIdQuery {
    pub user_id: Uuid,
}

/// GET /api/v1/billing/status
pub async fn handle_status(
    State(state): State<AppState>,
    Query(params): Query<UserIdQuery>,
) -> Result<Json<EntitlementStatus>, AppError> {
    Ok(Json(state.arbiter.status(params.user_id).await?))
}

#[derive(Deserialize)]
pub struct CreateSubscriptionRequest {
    pub user_id: Uuid,
    pub tier_id: String,
    pub external_ref: String,
}

/// POST /api/v1/subscriptions
pub async fn handle_create_subscription(
    State(state): State<AppState>,
    Json(req): Json<CreateSubscriptionRequest>,
) -> Result<(StatusCode, Json<Subscription>), AppError> {
    let created = state
        .subscriptions
        .create(
            &Actor::User(req.user_id),
            req.user_id,
            &req.tier_id,
            &req.external_ref,
        )
        .await?;
    Ok((StatusCode::CREATED, Json(created)))
}

/// GET /api/v1/subscriptions/:id
pub async fn handle_get_subscription(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<Subscription>, AppError> {
    Ok(Json(state.subscriptions.get(id).await?))
}

/// PATCH /api/v1/subscriptions/:id
pub async fn handle_update_subscription(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(update): Json<SubscriptionUpdate>,
) -> Result<Json<Subscription>, AppError> {
    let owner = state.subscriptions.get(id).await?.user_id;
    let updated = state
        .subscriptions
        .update(&Actor::User(owner), id, update)
        .await?;
    Ok(Json(updated))
}

#[derive(Deserialize)]
pub struct CancelQuery {
    #[serde(default)]
    pub immediate: bool,
}

/// POST /api/v1/subscriptions/:id/cancel
pub async fn handle_cancel_subscription(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Query(params): Query<CancelQuery>,
) -> Result<Json<Subscription>, AppError> {
    let owner = state.subscriptions.get(id).await?.user_id;
    let canceled = state
        .subscriptions
        .cancel(&Actor::User(owner), id, params.immediate)
        .await?;
    Ok(Json(canceled))
}

#[derive(Deserialize)]
pub struct UsageQuery {
    pub user_id: Uuid,
    pub limit: Option<i64>,
    pub page_token: Option<Uuid>,
}

#[derive(Serialize)]
pub struct UsagePage {
    pub events: Vec<UsageEvent>,
    pub next_page_token: Option<Uuid>,
}

/// GET /api/v1/usage
pub async fn handle_usage_history(
    State(state): State<AppState>,
    Query(params): Query<UsageQuery>,
) -> Result<Json<UsagePage>, AppError> {
    let limit = params
        .limit
        .unwrap_or(DEFAULT_PAGE_SIZE)
        .clamp(1, MAX_PAGE_SIZE);
    // One extra row tells us whether another page exists.
    let mut events = state
        .store
        .usage_history(params.user_id, limit + 1, params.page_token)
        .await?;
    let next_page_token = if events.len() as i64 > limit {
        events.truncate(limit as usize);
        events.last().map(|e| e.id)
    } else {
        None
    };
    Ok(Json(UsagePage {
        events,
        next_page_token,
    }))
}

/// GET /api/v1/entitlements/check
pub async fn handle_check(
    State(state): State<AppState>,
    Query(params): Query<UserIdQuery>,
) -> Result<Json<EntitlementCheck>, AppError> {
    Ok(Json(state.arbiter.check(params.user_id).await?))
}

#[derive(Deserialize)]
pub struct ConsumeRequest {
    pub user_id: Uuid,
    pub correlation_id: Option<Uuid>,
}

#[derive(Serialize)]
pub struct ConsumeResponse {
    pub usage_event: UsageEvent,
    pub source: EntitlementSource,
    /// `null` when unlimited.
    pub remaining: Option<i32>,
}

/// POST /api/v1/entitlements/consume
pub async fn handle_consume(
    State(state): State<AppState>,
    Json(req): Json<ConsumeRequest>,
) -> Result<Json<ConsumeResponse>, AppError> {
    let correlation_id = req.correlation_id.unwrap_or_else(Uuid::new_v4);
    let consumption = state.arbiter.consume(req.user_id, correlation_id).await?;
    Ok(Json(ConsumeResponse {
        source: consumption.event.source.into(),
        remaining: consumption.remaining,
        usage_event: consumption.event,
    }))
}

#[derive(Serialize)]
pub struct WebhookResponse {
    pub received: bool,
    pub outcome: WebhookOutcome,
}

/// POST /api/v1/webhooks/billing
pub async fn handle_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<WebhookResponse>, AppError> {
    let signature = headers
        .get(SIGNATURE_HEADER)
        .and_then(|value| value.to_str().ok());
    let outcome = state.webhooks.handle(&body, signature).await?;
    Ok(Json(WebhookResponse {
        received: true,
        outcome,
    }))
}
