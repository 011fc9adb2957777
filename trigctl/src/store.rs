//! The store seam between the hot path and PostgreSQL.
//!
//! The evaluator, dispatcher, and index all talk to a [`TriggerStore`]
//! rather than to the pool directly, so the engine can be exercised against
//! an in-memory double. [`PgTriggerStore`] is the production implementation
//! and owns the transactional discipline around the failure counters.

use async_trait::async_trait;
use sqlx::PgPool;

use crate::db::errors::{DbError, Result};
use crate::db::handlers::{FireLogs, Subscriptions, Webhooks};
use crate::db::models::fire_logs::{FireLog, FireLogCreateDBRequest};
use crate::db::models::webhooks::{FailureState, IndexableWebhook};
use crate::db::with_transient_retry;
use crate::types::WebhookId;

/// Durable state the hot path depends on.
#[async_trait]
pub trait TriggerStore: Send + Sync {
    /// All `(asset_did, webhook)` pairs the index should contain.
    async fn list_indexable(&self) -> Result<Vec<IndexableWebhook>>;

    /// Most recent fire for a pair, or the sentinel when absent.
    async fn latest_fire_log(&self, webhook_id: WebhookId, asset_did: &str) -> Result<FireLog>;

    /// Record a successful delivery (idempotent on the log id).
    async fn create_fire_log(&self, request: &FireLogCreateDBRequest) -> Result<()>;

    /// Current failure accounting, or `None` for a deleted webhook.
    async fn failure_state(&self, webhook_id: WebhookId) -> Result<Option<FailureState>>;

    /// Row-locked failure increment; flips the webhook to `failed` at the
    /// threshold. Returns the post-increment state.
    async fn increment_failure_count(
        &self,
        webhook_id: WebhookId,
        max_failure_count: i32,
    ) -> Result<Option<FailureState>>;

    /// Row-locked reset after a successful delivery; re-enables a
    /// circuit-broken webhook.
    async fn reset_failure_count(&self, webhook_id: WebhookId) -> Result<()>;

    /// Drop one subscription pair (used when the permission oracle revokes
    /// access). Returns the number of rows removed.
    async fn delete_subscription(&self, asset_did: &str, webhook_id: WebhookId) -> Result<u64>;
}

/// How many times the locked counter transactions retry on deadlock.
const COUNTER_RETRY_ATTEMPTS: u32 = 3;

/// PostgreSQL-backed [`TriggerStore`].
#[derive(Clone)]
pub struct PgTriggerStore {
    pool: PgPool,
}

impl PgTriggerStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl TriggerStore for PgTriggerStore {
    async fn list_indexable(&self) -> Result<Vec<IndexableWebhook>> {
        let mut conn = self.pool.acquire().await.map_err(DbError::from)?;
        Webhooks::new(&mut conn).list_indexable().await
    }

    async fn latest_fire_log(&self, webhook_id: WebhookId, asset_did: &str) -> Result<FireLog> {
        let mut conn = self.pool.acquire().await.map_err(DbError::from)?;
        FireLogs::new(&mut conn).get_latest(webhook_id, asset_did).await
    }

    async fn create_fire_log(&self, request: &FireLogCreateDBRequest) -> Result<()> {
        let mut conn = self.pool.acquire().await.map_err(DbError::from)?;
        FireLogs::new(&mut conn).create(request).await
    }

    async fn failure_state(&self, webhook_id: WebhookId) -> Result<Option<FailureState>> {
        let mut conn = self.pool.acquire().await.map_err(DbError::from)?;
        Webhooks::new(&mut conn).failure_state(webhook_id).await
    }

    async fn increment_failure_count(
        &self,
        webhook_id: WebhookId,
        max_failure_count: i32,
    ) -> Result<Option<FailureState>> {
        with_transient_retry("increment_failure_count", COUNTER_RETRY_ATTEMPTS, || {
            let pool = self.pool.clone();
            async move {
                let mut tx = pool.begin().await.map_err(DbError::from)?;
                let state = Webhooks::new(&mut tx)
                    .increment_failure_count(webhook_id, max_failure_count)
                    .await?;
                tx.commit().await.map_err(DbError::from)?;
                Ok(state)
            }
        })
        .await
    }

    async fn reset_failure_count(&self, webhook_id: WebhookId) -> Result<()> {
        with_transient_retry("reset_failure_count", COUNTER_RETRY_ATTEMPTS, || {
            let pool = self.pool.clone();
            async move {
                let mut tx = pool.begin().await.map_err(DbError::from)?;
                Webhooks::new(&mut tx).reset_failure_count(webhook_id).await?;
                tx.commit().await.map_err(DbError::from)?;
                Ok(())
            }
        })
        .await
    }

    async fn delete_subscription(&self, asset_did: &str, webhook_id: WebhookId) -> Result<u64> {
        let mut conn = self.pool.acquire().await.map_err(DbError::from)?;
        Subscriptions::new(&mut conn).delete(asset_did, webhook_id).await
    }
}
