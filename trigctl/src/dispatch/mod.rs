//! Webhook dispatch: circuit check, HTTP POST, outcome accounting.
//!
//! For every `fire` verdict the dispatcher assembles the CloudEvents
//! envelope and POSTs it to the target. A 2xx resets the failure streak and
//! writes the fire log (with the raw sample as the snapshot); anything else
//! bumps the failure counter, and the store flips the webhook to `failed`
//! at the configured threshold. There are no in-band retries; reliability
//! comes from the log and the operator surface.

pub mod payload;

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use metrics::counter;
use tracing::{debug, instrument, warn};
use uuid::Uuid;

use crate::catalog::SignalCatalog;
use crate::consumer::samples::Sample;
use crate::db::models::fire_logs::FireLogCreateDBRequest;
use crate::db::models::webhooks::{FailureState, WebhookStatus};
use crate::errors::{Error, Result};
use crate::index::IndexEntry;
use crate::store::TriggerStore;
use crate::types::abbrev_uuid;

/// How much of an error response body is kept for logging.
const BODY_CAPTURE_BYTES: usize = 1024;

/// Outcome of one dispatch attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// Target answered 2xx; fire log written, failure streak reset.
    Delivered { status: u16 },
    /// Transport error or non-2xx; failure streak bumped.
    Failed {
        status: Option<u16>,
        new_state: Option<FailureState>,
    },
    /// Circuit breaker is open (disabled, failed, or over the threshold).
    SkippedCircuitOpen,
    /// Webhook vanished between indexing and dispatch.
    SkippedMissing,
}

/// HTTP delivery of fired webhooks.
pub struct Dispatcher {
    store: Arc<dyn TriggerStore>,
    catalog: Arc<SignalCatalog>,
    http_client: reqwest::Client,
    max_failure_count: i32,
    delivery_source: String,
}

impl Dispatcher {
    pub fn new(
        store: Arc<dyn TriggerStore>,
        catalog: Arc<SignalCatalog>,
        timeout: Duration,
        max_failure_count: i32,
        delivery_source: String,
    ) -> anyhow::Result<Self> {
        let http_client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            store,
            catalog,
            http_client,
            max_failure_count,
            delivery_source,
        })
    }

    /// Deliver one fired webhook and record the outcome.
    #[instrument(skip_all, fields(webhook_id = %abbrev_uuid(&entry.webhook.id), asset_did = %asset_did))]
    pub async fn dispatch(
        &self,
        entry: &IndexEntry,
        asset_did: &str,
        sample: &Sample,
    ) -> Result<DispatchOutcome> {
        let webhook = &entry.webhook;

        // Circuit breaker reads the live state, not the index snapshot, so
        // a webhook broken moments ago stops dispatching immediately and a
        // reset becomes effective without a rebuild.
        let Some(state) = self.store.failure_state(webhook.id).await? else {
            debug!("Webhook deleted while its message was in flight, skipping dispatch");
            counter!("trigctl_webhook_dispatches_total", "outcome" => "skipped").increment(1);
            return Ok(DispatchOutcome::SkippedMissing);
        };
        if state.status != WebhookStatus::Enabled || state.failure_count >= self.max_failure_count {
            debug!(
                status = state.status.as_str(),
                failure_count = state.failure_count,
                "Circuit open, skipping dispatch"
            );
            counter!("trigctl_webhook_dispatches_total", "outcome" => "skipped").increment(1);
            return Ok(DispatchOutcome::SkippedCircuitOpen);
        }

        let signal_def = match sample {
            Sample::Signal { sample, .. } => self.catalog.lookup(&sample.name),
            Sample::Event { .. } => None,
        };
        let envelope = payload::build_cloud_event(
            webhook,
            asset_did,
            sample,
            signal_def,
            &self.delivery_source,
        );

        let response = self
            .http_client
            .post(&webhook.target_uri)
            .header("Content-Type", payload::CONTENT_TYPE)
            .json(&envelope)
            .send()
            .await;

        match response {
            Ok(response) if response.status().is_success() => {
                let status = response.status().as_u16();
                self.record_success(entry, asset_did, sample).await?;
                counter!("trigctl_webhook_dispatches_total", "outcome" => "delivered")
                    .increment(1);
                debug!(status, "Webhook delivered");
                Ok(DispatchOutcome::Delivered { status })
            }
            Ok(response) => {
                let status = response.status().as_u16();
                let body = response.text().await.unwrap_or_default();
                let snippet: String = body.chars().take(BODY_CAPTURE_BYTES).collect();
                let new_state = self.record_failure(entry).await?;
                counter!("trigctl_webhook_dispatches_total", "outcome" => "failed").increment(1);
                warn!(status, body = %snippet, "Webhook delivery failed");
                Ok(DispatchOutcome::Failed {
                    status: Some(status),
                    new_state,
                })
            }
            Err(e) => {
                let new_state = self.record_failure(entry).await?;
                counter!("trigctl_webhook_dispatches_total", "outcome" => "failed").increment(1);
                warn!(error = %e, "Webhook delivery failed before a response");
                Ok(DispatchOutcome::Failed {
                    status: None,
                    new_state,
                })
            }
        }
    }

    /// 2xx path: reset the streak, then write the idempotent fire log with
    /// the raw sample as the snapshot. No fire log is ever written for a
    /// failed delivery.
    async fn record_success(
        &self,
        entry: &IndexEntry,
        asset_did: &str,
        sample: &Sample,
    ) -> Result<()> {
        self.store.reset_failure_count(entry.webhook.id).await?;
        self.store
            .create_fire_log(&FireLogCreateDBRequest {
                id: Uuid::new_v4(),
                webhook_id: entry.webhook.id,
                asset_did: asset_did.to_string(),
                snapshot_data: sample.raw().clone(),
                last_fired_at: Utc::now(),
            })
            .await?;
        Ok(())
    }

    async fn record_failure(&self, entry: &IndexEntry) -> Result<Option<FailureState>> {
        let new_state = self
            .store
            .increment_failure_count(entry.webhook.id, self.max_failure_count)
            .await?;
        if let Some(state) = new_state
            && state.status == WebhookStatus::Failed
        {
            warn!(
                webhook_id = %abbrev_uuid(&entry.webhook.id),
                failure_count = state.failure_count,
                "Circuit breaker tripped; webhook marked failed"
            );
        }
        Ok(new_state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{MemoryTriggerStore, index_entry, signal_sample, webhook_fixture};
    use wiremock::matchers::{header, method};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const VEHICLE: &str = "did:erc721:137:0xbA5738a18d83D41847dfFbDC6101d37C69c9B0cF:7";

    fn dispatcher(store: Arc<MemoryTriggerStore>, max: i32) -> Dispatcher {
        Dispatcher::new(
            store,
            Arc::new(crate::catalog::SignalCatalog::load_embedded().unwrap()),
            Duration::from_secs(5),
            max,
            "vehicle-triggers".to_string(),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn delivered_webhook_writes_the_fire_log() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(header("Content-Type", "application/json"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let store = Arc::new(MemoryTriggerStore::new());
        let mut webhook = webhook_fixture("signals", "speed", "valueNumber > 55");
        webhook.target_uri = server.uri();
        store.insert_webhook(webhook.clone());
        let entry = index_entry(webhook.clone());
        let sample = signal_sample(VEHICLE, "speed", 63.0);

        let outcome = dispatcher(store.clone(), 3)
            .dispatch(&entry, VEHICLE, &sample)
            .await
            .unwrap();
        assert_eq!(outcome, DispatchOutcome::Delivered { status: 200 });

        let log = store.latest_fire_log_sync(webhook.id, VEHICLE);
        assert_eq!(log.snapshot_data, *sample.raw());
        assert_eq!(store.failure_state_sync(webhook.id).failure_count, 0);
    }

    #[tokio::test]
    async fn failed_delivery_increments_without_logging_a_fire() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500).set_body_string("boom"))
            .expect(1)
            .mount(&server)
            .await;

        let store = Arc::new(MemoryTriggerStore::new());
        let mut webhook = webhook_fixture("signals", "speed", "valueNumber > 55");
        webhook.target_uri = server.uri();
        store.insert_webhook(webhook.clone());
        let entry = index_entry(webhook.clone());

        let outcome = dispatcher(store.clone(), 3)
            .dispatch(&entry, VEHICLE, &signal_sample(VEHICLE, "speed", 63.0))
            .await
            .unwrap();
        assert!(matches!(
            outcome,
            DispatchOutcome::Failed {
                status: Some(500),
                ..
            }
        ));
        assert_eq!(store.failure_state_sync(webhook.id).failure_count, 1);
        assert!(store.fire_log_count(webhook.id, VEHICLE) == 0);
    }

    #[tokio::test]
    async fn network_error_counts_as_a_failure() {
        let store = Arc::new(MemoryTriggerStore::new());
        let mut webhook = webhook_fixture("signals", "speed", "valueNumber > 55");
        // Nothing is listening here.
        webhook.target_uri = "http://127.0.0.1:1".to_string();
        store.insert_webhook(webhook.clone());
        let entry = index_entry(webhook.clone());

        let outcome = dispatcher(store.clone(), 3)
            .dispatch(&entry, VEHICLE, &signal_sample(VEHICLE, "speed", 63.0))
            .await
            .unwrap();
        assert!(matches!(
            outcome,
            DispatchOutcome::Failed { status: None, .. }
        ));
        assert_eq!(store.failure_state_sync(webhook.id).failure_count, 1);
    }

    #[tokio::test]
    async fn breaker_trips_at_the_threshold_and_blocks_further_attempts() {
        let server = MockServer::start().await;
        // Exactly three requests reach the target; the fourth is skipped.
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500))
            .expect(3)
            .mount(&server)
            .await;

        let store = Arc::new(MemoryTriggerStore::new());
        let mut webhook = webhook_fixture("signals", "speed", "valueNumber > 55");
        webhook.target_uri = server.uri();
        store.insert_webhook(webhook.clone());
        let entry = index_entry(webhook.clone());
        let sample = signal_sample(VEHICLE, "speed", 63.0);
        let d = dispatcher(store.clone(), 3);

        for expected in 1..=3 {
            let outcome = d.dispatch(&entry, VEHICLE, &sample).await.unwrap();
            let DispatchOutcome::Failed { new_state, .. } = outcome else {
                panic!("expected a failure");
            };
            assert_eq!(new_state.unwrap().failure_count, expected);
        }
        let state = store.failure_state_sync(webhook.id);
        assert_eq!(state.failure_count, 3);
        assert_eq!(state.status, WebhookStatus::Failed);

        let outcome = d.dispatch(&entry, VEHICLE, &sample).await.unwrap();
        assert_eq!(outcome, DispatchOutcome::SkippedCircuitOpen);
    }

    #[tokio::test]
    async fn reset_after_operator_fix_reenables_delivery() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let store = Arc::new(MemoryTriggerStore::new());
        let mut webhook = webhook_fixture("signals", "speed", "valueNumber > 55");
        webhook.target_uri = server.uri();
        store.insert_webhook(webhook.clone());
        store.force_failure_state(webhook.id, 3, WebhookStatus::Failed);
        let entry = index_entry(webhook.clone());
        let sample = signal_sample(VEHICLE, "speed", 63.0);
        let d = dispatcher(store.clone(), 3);

        // Broken webhook: no attempt.
        assert_eq!(
            d.dispatch(&entry, VEHICLE, &sample).await.unwrap(),
            DispatchOutcome::SkippedCircuitOpen
        );

        // Operator re-enables (the CRUD surface does this on target change).
        store.force_failure_state(webhook.id, 0, WebhookStatus::Enabled);
        let outcome = d.dispatch(&entry, VEHICLE, &sample).await.unwrap();
        assert_eq!(outcome, DispatchOutcome::Delivered { status: 200 });

        let state = store.failure_state_sync(webhook.id);
        assert_eq!(state.failure_count, 0);
        assert_eq!(state.status, WebhookStatus::Enabled);
    }

    #[tokio::test]
    async fn deleted_webhook_is_skipped() {
        let store = Arc::new(MemoryTriggerStore::new());
        let webhook = webhook_fixture("signals", "speed", "valueNumber > 55");
        // Never inserted into the store: simulates a mid-flight delete.
        let entry = index_entry(webhook);

        let outcome = dispatcher(store, 3)
            .dispatch(&entry, VEHICLE, &signal_sample(VEHICLE, "speed", 63.0))
            .await
            .unwrap();
        assert_eq!(outcome, DispatchOutcome::SkippedMissing);
    }
}
