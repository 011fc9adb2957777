//! Database models for the per-(webhook, vehicle) fire log.

use chrono::{DateTime, Utc};
use sqlx::FromRow;

use crate::types::{FireLogId, WebhookId};

/// One successful delivery. The newest row per `(webhook_id, asset_did)`
/// anchors the cooldown window and supplies the `previous*` bindings.
#[derive(Debug, Clone, FromRow)]
pub struct FireLog {
    pub id: FireLogId,
    pub webhook_id: WebhookId,
    pub asset_did: String,
    pub snapshot_data: serde_json::Value,
    pub last_fired_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub failure_reason: Option<String>,
}

impl FireLog {
    /// The sentinel returned when a pair has never fired: an empty snapshot
    /// at the epoch, so any cooldown window has long expired and `previous*`
    /// bindings evaluate to zero values.
    pub fn sentinel(webhook_id: WebhookId, asset_did: &str) -> Self {
        Self {
            id: uuid::Uuid::nil(),
            webhook_id,
            asset_did: asset_did.to_string(),
            snapshot_data: serde_json::json!({}),
            last_fired_at: DateTime::<Utc>::UNIX_EPOCH,
            created_at: DateTime::<Utc>::UNIX_EPOCH,
            failure_reason: None,
        }
    }

    /// True when this is the never-fired sentinel (or a row written with an
    /// empty snapshot).
    pub fn is_empty_snapshot(&self) -> bool {
        self.snapshot_data
            .as_object()
            .is_some_and(|map| map.is_empty())
    }
}

/// Request to record a successful delivery. `id` is produced by the
/// dispatcher so the insert is idempotent under redelivery.
#[derive(Debug, Clone)]
pub struct FireLogCreateDBRequest {
    pub id: FireLogId,
    pub webhook_id: WebhookId,
    pub asset_did: String,
    pub snapshot_data: serde_json::Value,
    pub last_fired_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sentinel_is_empty_and_ancient() {
        let log = FireLog::sentinel(uuid::Uuid::new_v4(), "did:erc721:1:0xabc:1");
        assert!(log.is_empty_snapshot());
        assert_eq!(log.last_fired_at, DateTime::<Utc>::UNIX_EPOCH);
    }

    #[test]
    fn populated_snapshot_is_not_empty() {
        let mut log = FireLog::sentinel(uuid::Uuid::new_v4(), "did:erc721:1:0xabc:1");
        log.snapshot_data = serde_json::json!({"name": "speed"});
        assert!(!log.is_empty_snapshot());
    }
}
