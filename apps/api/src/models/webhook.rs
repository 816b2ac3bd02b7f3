use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Stored billing-provider event. Immutable once `processed` is true.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct WebhookEventRecord {
    pub external_event_id: String,
    pub event_type: String,
    pub raw_payload: String,
    pub processed: bool,
    pub processing_error: Option<String>,
    pub retry_count: i32,
    /// Set once `retry_count` reaches the configured maximum.
    pub needs_review: bool,
    /// Lease held by the worker currently applying the event.
    pub claimed_until: Option<DateTime<Utc>>,
    pub received_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct NewWebhookEvent {
    pub external_event_id: String,
    pub event_type: String,
    pub raw_payload: String,
}

/// Result of trying to take exclusive processing rights on an event.
#[derive(Debug, Clone)]
pub enum WebhookClaim {
    /// Caller holds the lease and must complete or fail the event.
    Claimed(WebhookEventRecord),
    AlreadyProcessed,
    /// Another worker holds an unexpired lease.
    InFlight,
    /// Failed too many times; left for manual review.
    NeedsReview,
}
