//! Database repository for the fire log.

use sqlx::PgConnection;
use tracing::instrument;

use crate::db::errors::Result;
use crate::db::models::fire_logs::{FireLog, FireLogCreateDBRequest};
use crate::types::{WebhookId, abbrev_uuid};

/// Repository for fire-log operations.
pub struct FireLogs<'c> {
    db: &'c mut PgConnection,
}

impl<'c> FireLogs<'c> {
    pub fn new(db: &'c mut PgConnection) -> Self {
        Self { db }
    }

    /// Record a successful delivery. Idempotent on `id`, so a redelivered
    /// bus message cannot double-log a fire.
    #[instrument(skip(self, request), fields(webhook_id = %abbrev_uuid(&request.webhook_id)), err)]
    pub async fn create(&mut self, request: &FireLogCreateDBRequest) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO fire_logs (id, webhook_id, asset_did, snapshot_data, last_fired_at)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (id) DO NOTHING
            "#,
        )
        .bind(request.id)
        .bind(request.webhook_id)
        .bind(&request.asset_did)
        .bind(&request.snapshot_data)
        .bind(request.last_fired_at)
        .execute(&mut *self.db)
        .await?;

        Ok(())
    }

    /// Most recent fire for a `(webhook, vehicle)` pair, or the sentinel
    /// when the pair has never fired.
    #[instrument(skip(self), fields(webhook_id = %abbrev_uuid(&webhook_id)), err)]
    pub async fn get_latest(&mut self, webhook_id: WebhookId, asset_did: &str) -> Result<FireLog> {
        let log = sqlx::query_as::<_, FireLog>(
            r#"
            SELECT * FROM fire_logs
            WHERE webhook_id = $1 AND asset_did = $2
            ORDER BY last_fired_at DESC, created_at DESC
            LIMIT 1
            "#,
        )
        .bind(webhook_id)
        .bind(asset_did)
        .fetch_optional(&mut *self.db)
        .await?;

        Ok(log.unwrap_or_else(|| FireLog::sentinel(webhook_id, asset_did)))
    }
}
