//! Database repository for vehicle-to-webhook subscriptions.

use sqlx::PgConnection;
use tracing::instrument;

use crate::db::errors::Result;
use crate::db::models::subscriptions::Subscription;
use crate::types::{WebhookId, abbrev_uuid};

/// Repository for subscription operations.
pub struct Subscriptions<'c> {
    db: &'c mut PgConnection,
}

impl<'c> Subscriptions<'c> {
    pub fn new(db: &'c mut PgConnection) -> Self {
        Self { db }
    }

    /// Subscribe a vehicle to a webhook. A duplicate pair surfaces as a
    /// unique violation.
    #[instrument(skip(self), fields(webhook_id = %abbrev_uuid(&webhook_id)), err)]
    pub async fn create(&mut self, asset_did: &str, webhook_id: WebhookId) -> Result<Subscription> {
        let subscription = sqlx::query_as::<_, Subscription>(
            r#"
            INSERT INTO subscriptions (asset_did, webhook_id)
            VALUES ($1, $2)
            RETURNING *
            "#,
        )
        .bind(asset_did)
        .bind(webhook_id)
        .fetch_one(&mut *self.db)
        .await?;

        Ok(subscription)
    }

    /// Remove one subscription pair. Returns the number of rows deleted.
    #[instrument(skip(self), fields(webhook_id = %abbrev_uuid(&webhook_id)), err)]
    pub async fn delete(&mut self, asset_did: &str, webhook_id: WebhookId) -> Result<u64> {
        let result = sqlx::query(
            r#"DELETE FROM subscriptions WHERE asset_did = $1 AND webhook_id = $2"#,
        )
        .bind(asset_did)
        .bind(webhook_id)
        .execute(&mut *self.db)
        .await?;

        Ok(result.rows_affected())
    }

    /// Remove every subscription of a webhook (the delete cascade).
    #[instrument(skip(self), fields(webhook_id = %abbrev_uuid(&webhook_id)), err)]
    pub async fn delete_for_webhook(&mut self, webhook_id: WebhookId) -> Result<u64> {
        let result = sqlx::query(r#"DELETE FROM subscriptions WHERE webhook_id = $1"#)
            .bind(webhook_id)
            .execute(&mut *self.db)
            .await?;

        Ok(result.rows_affected())
    }

    /// List subscriptions of a webhook.
    #[instrument(skip(self), fields(webhook_id = %abbrev_uuid(&webhook_id)), err)]
    pub async fn list_for_webhook(&mut self, webhook_id: WebhookId) -> Result<Vec<Subscription>> {
        let subscriptions = sqlx::query_as::<_, Subscription>(
            r#"
            SELECT * FROM subscriptions
            WHERE webhook_id = $1
            ORDER BY created_at DESC
            "#,
        )
        .bind(webhook_id)
        .fetch_all(&mut *self.db)
        .await?;

        Ok(subscriptions)
    }
}
