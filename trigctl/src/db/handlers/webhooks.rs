//! Database repository for webhook trigger definitions.

use sqlx::PgConnection;
use tracing::instrument;

use crate::db::errors::Result;
use crate::db::models::webhooks::{
    FailureState, IndexableWebhook, Webhook, WebhookCreateDBRequest, WebhookStatus,
    WebhookUpdateDBRequest,
};
use crate::types::{WebhookId, abbrev_uuid};

/// Repository for webhook operations.
pub struct Webhooks<'c> {
    db: &'c mut PgConnection,
}

impl<'c> Webhooks<'c> {
    pub fn new(db: &'c mut PgConnection) -> Self {
        Self { db }
    }

    /// Create a new webhook for a developer license.
    #[instrument(skip(self, request), fields(owner = %request.developer_license), err)]
    pub async fn create(&mut self, request: &WebhookCreateDBRequest) -> Result<Webhook> {
        let webhook = sqlx::query_as::<_, Webhook>(
            r#"
            INSERT INTO webhooks
                (service, metric_name, condition, target_uri, cooldown_period,
                 developer_license, display_name, description)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            RETURNING *
            "#,
        )
        .bind(&request.service)
        .bind(&request.metric_name)
        .bind(&request.condition)
        .bind(&request.target_uri)
        .bind(request.cooldown_period)
        .bind(&request.developer_license)
        .bind(&request.display_name)
        .bind(&request.description)
        .fetch_one(&mut *self.db)
        .await?;

        Ok(webhook)
    }

    /// Get a live webhook owned by the given license.
    #[instrument(skip(self), fields(webhook_id = %abbrev_uuid(&id)), err)]
    pub async fn get_owned(&mut self, id: WebhookId, owner: &str) -> Result<Option<Webhook>> {
        let webhook = sqlx::query_as::<_, Webhook>(
            r#"
            SELECT * FROM webhooks
            WHERE id = $1 AND developer_license = $2 AND status <> 'deleted'
            "#,
        )
        .bind(id)
        .bind(owner)
        .fetch_optional(&mut *self.db)
        .await?;

        Ok(webhook)
    }

    /// List live webhooks for an owner.
    #[instrument(skip(self), fields(owner = %owner), err)]
    pub async fn list_by_owner(&mut self, owner: &str) -> Result<Vec<Webhook>> {
        let webhooks = sqlx::query_as::<_, Webhook>(
            r#"
            SELECT * FROM webhooks
            WHERE developer_license = $1 AND status <> 'deleted'
            ORDER BY created_at DESC
            "#,
        )
        .bind(owner)
        .fetch_all(&mut *self.db)
        .await?;

        Ok(webhooks)
    }

    /// Partially update a webhook. Returns `None` when the row does not
    /// exist or is not owned by the caller.
    #[instrument(skip(self, request), fields(webhook_id = %abbrev_uuid(&id)), err)]
    pub async fn update(
        &mut self,
        id: WebhookId,
        owner: &str,
        request: &WebhookUpdateDBRequest,
    ) -> Result<Option<Webhook>> {
        let status = request.status.map(|s| s.as_str());
        let webhook = sqlx::query_as::<_, Webhook>(
            r#"
            UPDATE webhooks
            SET
                metric_name = COALESCE($3, metric_name),
                condition = COALESCE($4, condition),
                target_uri = COALESCE($5, target_uri),
                cooldown_period = COALESCE($6, cooldown_period),
                display_name = COALESCE($7, display_name),
                description = CASE WHEN $8 THEN $9 ELSE description END,
                status = COALESCE($10, status),
                -- Re-enabling clears the failure streak so the circuit
                -- breaker starts from a clean slate
                failure_count = CASE WHEN $10 = 'enabled' THEN 0 ELSE failure_count END,
                updated_at = now()
            WHERE id = $1 AND developer_license = $2 AND status <> 'deleted'
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(owner)
        .bind(&request.metric_name)
        .bind(&request.condition)
        .bind(&request.target_uri)
        .bind(request.cooldown_period)
        .bind(&request.display_name)
        .bind(request.description.is_some())
        .bind(request.description.clone().flatten())
        .bind(status)
        .fetch_optional(&mut *self.db)
        .await?;

        Ok(webhook)
    }

    /// Soft-delete a webhook. The caller removes subscriptions in the same
    /// transaction so the cascade is atomic.
    #[instrument(skip(self), fields(webhook_id = %abbrev_uuid(&id)), err)]
    pub async fn soft_delete(&mut self, id: WebhookId, owner: &str) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE webhooks
            SET status = 'deleted', updated_at = now()
            WHERE id = $1 AND developer_license = $2 AND status <> 'deleted'
            "#,
        )
        .bind(id)
        .bind(owner)
        .execute(&mut *self.db)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// All `(asset_did, webhook)` pairs the index should contain. Failed
    /// rows are included; the dispatcher's circuit breaker filters them, so
    /// a reset becomes effective without waiting for a rebuild.
    #[instrument(skip(self), err)]
    pub async fn list_indexable(&mut self) -> Result<Vec<IndexableWebhook>> {
        let rows = sqlx::query_as::<_, IndexableWebhook>(
            r#"
            SELECT s.asset_did, w.*
            FROM subscriptions s
            JOIN webhooks w ON w.id = s.webhook_id
            WHERE w.status IN ('enabled', 'failed')
            ORDER BY w.id, s.asset_did
            "#,
        )
        .fetch_all(&mut *self.db)
        .await?;

        Ok(rows)
    }

    /// Current failure accounting for a live webhook.
    #[instrument(skip(self), fields(webhook_id = %abbrev_uuid(&id)), err)]
    pub async fn failure_state(&mut self, id: WebhookId) -> Result<Option<FailureState>> {
        let row = sqlx::query_as::<_, (i32, String)>(
            r#"SELECT failure_count, status FROM webhooks WHERE id = $1 AND status <> 'deleted'"#,
        )
        .bind(id)
        .fetch_optional(&mut *self.db)
        .await?;

        Ok(row.map(|(failure_count, status)| FailureState {
            failure_count,
            status: status.parse().unwrap_or(WebhookStatus::Disabled),
        }))
    }

    /// Increment the consecutive-failure counter under a row lock; trips the
    /// circuit breaker (status -> failed) at the threshold. Returns the new
    /// state, or `None` when the webhook vanished mid-flight.
    ///
    /// Must run inside a transaction: the `FOR UPDATE` lock serializes
    /// concurrent failure/success writers on the same row.
    #[instrument(skip(self), fields(webhook_id = %abbrev_uuid(&id)), err)]
    pub async fn increment_failure_count(
        &mut self,
        id: WebhookId,
        max_failure_count: i32,
    ) -> Result<Option<FailureState>> {
        let Some((failure_count, status)) = sqlx::query_as::<_, (i32, String)>(
            r#"
            SELECT failure_count, status FROM webhooks
            WHERE id = $1 AND status <> 'deleted'
            FOR UPDATE
            "#,
        )
        .bind(id)
        .fetch_optional(&mut *self.db)
        .await?
        else {
            return Ok(None);
        };

        let new_count = failure_count + 1;
        let current: WebhookStatus = status.parse().unwrap_or(WebhookStatus::Disabled);
        let new_status = if current == WebhookStatus::Enabled && new_count >= max_failure_count {
            WebhookStatus::Failed
        } else {
            current
        };

        sqlx::query(
            r#"
            UPDATE webhooks
            SET failure_count = $2, status = $3, updated_at = now()
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(new_count)
        .bind(new_status.as_str())
        .execute(&mut *self.db)
        .await?;

        Ok(Some(FailureState {
            failure_count: new_count,
            status: new_status,
        }))
    }

    /// Reset the failure counter after a successful delivery; a webhook that
    /// was circuit-broken goes back to enabled.
    ///
    /// Must run inside a transaction (see [`Self::increment_failure_count`]).
    #[instrument(skip(self), fields(webhook_id = %abbrev_uuid(&id)), err)]
    pub async fn reset_failure_count(&mut self, id: WebhookId) -> Result<()> {
        let Some((failure_count, status)) = sqlx::query_as::<_, (i32, String)>(
            r#"
            SELECT failure_count, status FROM webhooks
            WHERE id = $1 AND status <> 'deleted'
            FOR UPDATE
            "#,
        )
        .bind(id)
        .fetch_optional(&mut *self.db)
        .await?
        else {
            return Ok(());
        };

        if failure_count == 0 && status != WebhookStatus::Failed.as_str() {
            return Ok(());
        }

        sqlx::query(
            r#"
            UPDATE webhooks
            SET failure_count = 0,
                status = CASE WHEN status = 'failed' THEN 'enabled' ELSE status END,
                updated_at = now()
            WHERE id = $1
            "#,
        )
        .bind(id)
        .execute(&mut *self.db)
        .await?;

        Ok(())
    }
}
