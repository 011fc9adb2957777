//! Database model for vehicle-to-webhook subscriptions.

use chrono::{DateTime, Utc};
use sqlx::FromRow;

use crate::types::WebhookId;

/// One `(asset_did, webhook_id)` pair. The pair is the primary key.
#[derive(Debug, Clone, FromRow)]
pub struct Subscription {
    pub asset_did: String,
    pub webhook_id: WebhookId,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}
