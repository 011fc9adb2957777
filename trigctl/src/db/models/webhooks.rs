//! Database models for webhook trigger definitions.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use crate::types::WebhookId;

/// Lifecycle status of a webhook.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WebhookStatus {
    /// Live and dispatchable
    Enabled,
    /// Turned off by its owner
    Disabled,
    /// Circuit-broken after too many consecutive delivery failures
    Failed,
    /// Soft-deleted; never indexed or listed
    Deleted,
}

impl WebhookStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Enabled => "enabled",
            Self::Disabled => "disabled",
            Self::Failed => "failed",
            Self::Deleted => "deleted",
        }
    }
}

impl std::str::FromStr for WebhookStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "enabled" => Ok(Self::Enabled),
            "disabled" => Ok(Self::Disabled),
            "failed" => Ok(Self::Failed),
            "deleted" => Ok(Self::Deleted),
            _ => Err(format!("Unknown webhook status: {s}")),
        }
    }
}

/// Database model for a webhook trigger definition.
#[derive(Debug, Clone, FromRow)]
pub struct Webhook {
    pub id: WebhookId,
    pub service: String,
    pub metric_name: String,
    pub condition: String,
    pub target_uri: String,
    pub cooldown_period: i32,
    pub developer_license: String,
    pub display_name: String,
    pub description: Option<String>,
    pub status: String,
    pub failure_count: i32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Webhook {
    /// Get the parsed lifecycle status.
    pub fn webhook_status(&self) -> WebhookStatus {
        self.status.parse().unwrap_or(WebhookStatus::Disabled)
    }

    pub fn cooldown_seconds(&self) -> u32 {
        self.cooldown_period.max(0) as u32
    }
}

/// Request to create a new webhook. All fields are pre-validated by the API
/// layer (service, metric, condition, target URI, cooldown).
#[derive(Debug, Clone)]
pub struct WebhookCreateDBRequest {
    pub service: String,
    pub metric_name: String,
    pub condition: String,
    pub target_uri: String,
    pub cooldown_period: i32,
    pub developer_license: String,
    pub display_name: String,
    pub description: Option<String>,
}

/// Request to update a webhook. `None` leaves a column untouched; the
/// double option on `description` distinguishes "no change" from "clear".
#[derive(Debug, Clone, Default)]
pub struct WebhookUpdateDBRequest {
    pub metric_name: Option<String>,
    pub condition: Option<String>,
    pub target_uri: Option<String>,
    pub cooldown_period: Option<i32>,
    pub display_name: Option<String>,
    pub description: Option<Option<String>>,
    pub status: Option<WebhookStatus>,
}

/// Current failure accounting for a webhook, read with the row lock held or
/// returned by the locked mutators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FailureState {
    pub failure_count: i32,
    pub status: WebhookStatus,
}

/// A webhook joined with one of its subscriptions; the unit the index is
/// rebuilt from.
#[derive(Debug, Clone, FromRow)]
pub struct IndexableWebhook {
    pub asset_did: String,
    #[sqlx(flatten)]
    pub webhook: Webhook,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_round_trips() {
        for status in [
            WebhookStatus::Enabled,
            WebhookStatus::Disabled,
            WebhookStatus::Failed,
            WebhookStatus::Deleted,
        ] {
            assert_eq!(status.as_str().parse::<WebhookStatus>().unwrap(), status);
        }
        assert!("archived".parse::<WebhookStatus>().is_err());
    }
}
