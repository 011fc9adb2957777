//! Test doubles and fixtures shared across the crate's test suites.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use uuid::Uuid;

use crate::catalog::SignalCatalog;
use crate::consumer::samples::{EventSample, Sample, SignalSample};
use crate::db::errors::{DbError, Result as DbResult};
use crate::db::models::fire_logs::{FireLog, FireLogCreateDBRequest};
use crate::db::models::webhooks::{FailureState, IndexableWebhook, Webhook, WebhookStatus};
use crate::errors::Result;
use crate::index::IndexEntry;
use crate::oracle::PermissionOracle;
use crate::store::TriggerStore;
use crate::types::{Service, WebhookId};
use crate::xl;

/// In-memory [`TriggerStore`] mirroring the PostgreSQL semantics closely
/// enough for engine tests: status filtering, circuit-breaker transitions,
/// idempotent fire logs, and the never-fired sentinel.
#[derive(Default)]
pub struct MemoryTriggerStore {
    inner: Mutex<MemoryState>,
    list_calls: AtomicUsize,
    fail_next_list: AtomicBool,
}

#[derive(Default)]
struct MemoryState {
    webhooks: HashMap<WebhookId, Webhook>,
    subscriptions: HashSet<(String, WebhookId)>,
    fire_logs: Vec<FireLog>,
}

impl MemoryTriggerStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_webhook(&self, webhook: Webhook) {
        self.inner.lock().unwrap().webhooks.insert(webhook.id, webhook);
    }

    /// Overwrite a webhook row (simulates a CRUD update).
    pub fn replace_webhook(&self, webhook: Webhook) {
        self.insert_webhook(webhook);
    }

    pub fn subscribe(&self, asset_did: &str, webhook_id: WebhookId) {
        self.inner
            .lock()
            .unwrap()
            .subscriptions
            .insert((asset_did.to_string(), webhook_id));
    }

    pub fn unsubscribe(&self, asset_did: &str, webhook_id: WebhookId) {
        self.inner
            .lock()
            .unwrap()
            .subscriptions
            .remove(&(asset_did.to_string(), webhook_id));
    }

    pub fn is_subscribed(&self, asset_did: &str, webhook_id: WebhookId) -> bool {
        self.inner
            .lock()
            .unwrap()
            .subscriptions
            .contains(&(asset_did.to_string(), webhook_id))
    }

    /// Insert a fire log dated `seconds_ago` before now.
    pub fn record_fire(
        &self,
        webhook_id: WebhookId,
        asset_did: &str,
        snapshot: serde_json::Value,
        seconds_ago: i64,
    ) {
        let at = Utc::now() - ChronoDuration::seconds(seconds_ago);
        self.inner.lock().unwrap().fire_logs.push(FireLog {
            id: Uuid::new_v4(),
            webhook_id,
            asset_did: asset_did.to_string(),
            snapshot_data: snapshot,
            last_fired_at: at,
            created_at: at,
            failure_reason: None,
        });
    }

    /// Shift the newest log for a pair further into the past; stands in for
    /// the passage of wall-clock time in cooldown tests.
    pub fn backdate_last_fire(&self, webhook_id: WebhookId, asset_did: &str, seconds: i64) {
        let mut state = self.inner.lock().unwrap();
        if let Some(log) = state
            .fire_logs
            .iter_mut()
            .filter(|l| l.webhook_id == webhook_id && l.asset_did == asset_did)
            .max_by_key(|l| l.last_fired_at)
        {
            log.last_fired_at -= ChronoDuration::seconds(seconds);
        }
    }

    pub fn fire_log_count(&self, webhook_id: WebhookId, asset_did: &str) -> usize {
        self.inner
            .lock()
            .unwrap()
            .fire_logs
            .iter()
            .filter(|l| l.webhook_id == webhook_id && l.asset_did == asset_did)
            .count()
    }

    pub fn latest_fire_log_sync(&self, webhook_id: WebhookId, asset_did: &str) -> FireLog {
        self.inner
            .lock()
            .unwrap()
            .fire_logs
            .iter()
            .filter(|l| l.webhook_id == webhook_id && l.asset_did == asset_did)
            .max_by_key(|l| l.last_fired_at)
            .cloned()
            .unwrap_or_else(|| FireLog::sentinel(webhook_id, asset_did))
    }

    pub fn failure_state_sync(&self, webhook_id: WebhookId) -> FailureState {
        let state = self.inner.lock().unwrap();
        let webhook = state.webhooks.get(&webhook_id).expect("webhook exists");
        FailureState {
            failure_count: webhook.failure_count,
            status: webhook.webhook_status(),
        }
    }

    /// Set failure accounting directly (operator actions in tests).
    pub fn force_failure_state(&self, webhook_id: WebhookId, count: i32, status: WebhookStatus) {
        let mut state = self.inner.lock().unwrap();
        if let Some(webhook) = state.webhooks.get_mut(&webhook_id) {
            webhook.failure_count = count;
            webhook.status = status.as_str().to_string();
        }
    }

    /// Make the next `list_indexable` fail (rebuild failure-path tests).
    pub fn fail_next_list(&self) {
        self.fail_next_list.store(true, Ordering::SeqCst);
    }

    /// How many times the index has listed this store.
    pub fn list_calls(&self) -> usize {
        self.list_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TriggerStore for MemoryTriggerStore {
    async fn list_indexable(&self) -> DbResult<Vec<IndexableWebhook>> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_next_list.swap(false, Ordering::SeqCst) {
            return Err(DbError::Other(anyhow::anyhow!("injected list failure")));
        }
        let state = self.inner.lock().unwrap();
        let mut rows = Vec::new();
        for (asset_did, webhook_id) in &state.subscriptions {
            if let Some(webhook) = state.webhooks.get(webhook_id) {
                if matches!(
                    webhook.webhook_status(),
                    WebhookStatus::Enabled | WebhookStatus::Failed
                ) {
                    rows.push(IndexableWebhook {
                        asset_did: asset_did.clone(),
                        webhook: webhook.clone(),
                    });
                }
            }
        }
        Ok(rows)
    }

    async fn latest_fire_log(&self, webhook_id: WebhookId, asset_did: &str) -> DbResult<FireLog> {
        Ok(self.latest_fire_log_sync(webhook_id, asset_did))
    }

    async fn create_fire_log(&self, request: &FireLogCreateDBRequest) -> DbResult<()> {
        let mut state = self.inner.lock().unwrap();
        if state.fire_logs.iter().any(|l| l.id == request.id) {
            return Ok(());
        }
        state.fire_logs.push(FireLog {
            id: request.id,
            webhook_id: request.webhook_id,
            asset_did: request.asset_did.clone(),
            snapshot_data: request.snapshot_data.clone(),
            last_fired_at: request.last_fired_at,
            created_at: Utc::now(),
            failure_reason: None,
        });
        Ok(())
    }

    async fn failure_state(&self, webhook_id: WebhookId) -> DbResult<Option<FailureState>> {
        let state = self.inner.lock().unwrap();
        Ok(state
            .webhooks
            .get(&webhook_id)
            .filter(|w| w.webhook_status() != WebhookStatus::Deleted)
            .map(|w| FailureState {
                failure_count: w.failure_count,
                status: w.webhook_status(),
            }))
    }

    async fn increment_failure_count(
        &self,
        webhook_id: WebhookId,
        max_failure_count: i32,
    ) -> DbResult<Option<FailureState>> {
        let mut state = self.inner.lock().unwrap();
        let Some(webhook) = state.webhooks.get_mut(&webhook_id) else {
            return Ok(None);
        };
        webhook.failure_count += 1;
        if webhook.webhook_status() == WebhookStatus::Enabled
            && webhook.failure_count >= max_failure_count
        {
            webhook.status = WebhookStatus::Failed.as_str().to_string();
        }
        Ok(Some(FailureState {
            failure_count: webhook.failure_count,
            status: webhook.webhook_status(),
        }))
    }

    async fn reset_failure_count(&self, webhook_id: WebhookId) -> DbResult<()> {
        let mut state = self.inner.lock().unwrap();
        if let Some(webhook) = state.webhooks.get_mut(&webhook_id) {
            webhook.failure_count = 0;
            if webhook.webhook_status() == WebhookStatus::Failed {
                webhook.status = WebhookStatus::Enabled.as_str().to_string();
            }
        }
        Ok(())
    }

    async fn delete_subscription(&self, asset_did: &str, webhook_id: WebhookId) -> DbResult<u64> {
        let removed = self
            .inner
            .lock()
            .unwrap()
            .subscriptions
            .remove(&(asset_did.to_string(), webhook_id));
        Ok(u64::from(removed))
    }
}

/// Oracle that always answers the same way, recording what it was asked.
pub struct StaticOracle {
    allow: bool,
    asked: Mutex<Vec<String>>,
}

impl StaticOracle {
    pub fn allow() -> Self {
        Self {
            allow: true,
            asked: Mutex::new(Vec::new()),
        }
    }

    pub fn deny() -> Self {
        Self {
            allow: false,
            asked: Mutex::new(Vec::new()),
        }
    }

    /// The permission set from the most recent check.
    pub fn last_permissions(&self) -> Vec<String> {
        self.asked.lock().unwrap().clone()
    }
}

#[async_trait]
impl PermissionOracle for StaticOracle {
    async fn has_permissions(
        &self,
        _asset_did: &str,
        _grantee: &str,
        permissions: &[String],
    ) -> Result<bool> {
        *self.asked.lock().unwrap() = permissions.to_vec();
        Ok(self.allow)
    }
}

/// A live webhook row with sensible defaults.
pub fn webhook_fixture(service: &str, metric: &str, condition: &str) -> Webhook {
    let id = Uuid::new_v4();
    let now = Utc::now();
    Webhook {
        id,
        service: service.to_string(),
        metric_name: metric.to_string(),
        condition: condition.to_string(),
        target_uri: "https://example.com/hook".to_string(),
        cooldown_period: 0,
        developer_license: "0x0000000000000000000000000000000000000001".to_string(),
        display_name: format!("hook-{}", crate::types::abbrev_uuid(&id)),
        description: None,
        status: WebhookStatus::Enabled.as_str().to_string(),
        failure_count: 0,
        created_at: now,
        updated_at: now,
    }
}

/// Compile a fixture webhook into an index entry, the way a rebuild would.
pub fn index_entry(webhook: Webhook) -> IndexEntry {
    let service: Service = webhook.service.parse().expect("fixture service");
    let schema = match service {
        Service::Signals => {
            let catalog = SignalCatalog::load_embedded().expect("embedded catalog");
            let def = catalog
                .lookup(&webhook.metric_name)
                .expect("fixture metric in catalog");
            xl::signal_schema(def.value_type.kind())
        }
        Service::Events => xl::event_schema(),
    };
    let program = xl::compile(&webhook.condition, &schema).expect("fixture condition compiles");
    IndexEntry {
        webhook,
        program: std::sync::Arc::new(program),
    }
}

/// A number-valued signal sample with its raw JSON attached.
pub fn signal_sample(subject: &str, name: &str, value: f64) -> Sample {
    let sample = SignalSample {
        subject: subject.to_string(),
        timestamp: Utc::now(),
        name: name.to_string(),
        value_number: value,
        value_string: String::new(),
        value_location: None,
        source: "0xDevice".to_string(),
        producer: "did:erc721:137:0x9c94C395cBcBDe662235E0A9d3bB87Ad708561BA:1".to_string(),
    };
    let raw = serde_json::to_value(&sample).expect("serialize sample");
    Sample::Signal { sample, raw }
}

/// An event sample with its raw JSON attached.
pub fn event_sample(subject: &str, name: &str) -> Sample {
    let sample = EventSample {
        subject: subject.to_string(),
        timestamp: Utc::now(),
        name: name.to_string(),
        source: "0xDevice".to_string(),
        producer: "did:erc721:137:0x9c94C395cBcBDe662235E0A9d3bB87Ad708561BA:1".to_string(),
        duration_ns: 1_200_000_000,
        metadata: String::new(),
    };
    let raw = serde_json::to_value(&sample).expect("serialize sample");
    Sample::Event { sample, raw }
}
