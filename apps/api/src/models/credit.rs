use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// Prepaid credit balance. Created lazily on the first grant; never negative.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct CreditBalance {
    pub user_id: Uuid,
    pub balance: i32,
    pub updated_at: DateTime<Utc>,
}
