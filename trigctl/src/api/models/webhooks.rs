//! API request/response types for webhook management.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::db::models::webhooks::{Webhook, WebhookStatus};
use crate::types::WebhookId;

/// Request to register a webhook.
#[derive(Debug, Clone, Deserialize)]
pub struct WebhookCreate {
    pub service: String,
    pub metric_name: String,
    pub condition: String,
    pub target_uri: String,
    /// Falls back to the configured default cooldown when absent.
    #[serde(default)]
    pub cooldown_period: Option<u32>,
    pub display_name: String,
    #[serde(default)]
    pub description: Option<String>,
    /// The token the target endpoint must echo during the verification
    /// handshake. Not persisted.
    pub verification_token: String,
}

/// Partial update. A present `target_uri` re-runs the verification
/// handshake, which needs `verification_token`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct WebhookUpdate {
    pub metric_name: Option<String>,
    pub condition: Option<String>,
    pub target_uri: Option<String>,
    pub cooldown_period: Option<u32>,
    pub display_name: Option<String>,
    /// `Some(None)` clears the description.
    #[serde(default)]
    pub description: Option<Option<String>>,
    /// Only `enabled` and `disabled` are accepted from callers.
    pub status: Option<WebhookStatus>,
    pub verification_token: Option<String>,
}

/// Webhook representation returned by the API.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookResponse {
    pub id: WebhookId,
    pub service: String,
    pub metric_name: String,
    pub condition: String,
    pub target_uri: String,
    pub cooldown_period: i32,
    pub display_name: String,
    pub description: Option<String>,
    pub status: String,
    pub failure_count: i32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<Webhook> for WebhookResponse {
    fn from(w: Webhook) -> Self {
        Self {
            id: w.id,
            service: w.service,
            metric_name: w.metric_name,
            condition: w.condition,
            target_uri: w.target_uri,
            cooldown_period: w.cooldown_period,
            display_name: w.display_name,
            description: w.description,
            status: w.status,
            failure_count: w.failure_count,
            created_at: w.created_at,
            updated_at: w.updated_at,
        }
    }
}

/// One subscription row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubscriptionResponse {
    pub asset_did: String,
    pub webhook_id: WebhookId,
    pub created_at: DateTime<Utc>,
}

/// Result of an unsubscribe.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnsubscribeResponse {
    pub deleted: u64,
}
