//! Bus consumer loops: pull, decode, fan out, acknowledge.
//!
//! Two identical loops (signals and events) pull from JetStream with a
//! durable per-process consumer. A message is processed one at a time per
//! loop (MaxInFlight = 1 is deliberate; the fan-out inside a message is the
//! throughput knob), and acknowledged exactly once regardless of individual
//! webhook outcomes. A cancelled message is left unacknowledged so the bus
//! redelivers it.

pub mod did;
pub mod samples;

use std::sync::Arc;
use std::time::Duration;

use async_nats::jetstream::{self, consumer, stream};
use futures::StreamExt;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::dispatch::{DispatchOutcome, Dispatcher};
use crate::evaluate::{Evaluator, Verdict};
use crate::index::refresh::RefreshHandle;
use crate::index::{IndexEntry, TriggerIndex};
use crate::store::TriggerStore;
use crate::types::{Service, abbrev_uuid};
use samples::{Sample, decode_batch};

/// How long one pull waits for a message before returning empty.
const FETCH_WAIT: Duration = Duration::from_secs(5);

/// Consumer loop lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    Idle,
    Subscribing,
    Running,
    Draining,
    Stopped,
}

impl LoopState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Subscribing => "subscribing",
            Self::Running => "running",
            Self::Draining => "draining",
            Self::Stopped => "stopped",
        }
    }
}

/// Where a fresh consumer group starts reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InitialOffset {
    /// Replay everything retained (dev).
    Oldest,
    /// Only new messages (prod).
    Latest,
}

impl InitialOffset {
    pub fn deliver_policy(&self) -> consumer::DeliverPolicy {
        match self {
            Self::Oldest => consumer::DeliverPolicy::All,
            Self::Latest => consumer::DeliverPolicy::New,
        }
    }
}

/// Counters for one handled message. Also what the scenario tests assert on.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct HandleSummary {
    pub samples: usize,
    pub considered: usize,
    pub fired: usize,
    pub skipped_permission: usize,
    pub skipped_cooldown: usize,
    pub skipped_condition: usize,
    pub skipped_circuit: usize,
    pub errors: usize,
    /// The message was cancelled mid-flight and must not be acknowledged.
    pub cancelled: bool,
}

/// The per-message pipeline shared by both loops: index lookup, bounded
/// fan-out of evaluate + dispatch, permission-revocation cleanup.
pub struct TriggerEngine {
    index: Arc<TriggerIndex>,
    evaluator: Arc<Evaluator>,
    dispatcher: Arc<Dispatcher>,
    store: Arc<dyn TriggerStore>,
    refresh: RefreshHandle,
    fan_out: Arc<Semaphore>,
}

enum TaskResult {
    Done(Verdict, Option<DispatchOutcome>),
    Errored,
    Cancelled,
}

impl TriggerEngine {
    /// The index this engine reads from (exposed for the operator surface
    /// and tests).
    pub fn index(&self) -> &Arc<TriggerIndex> {
        &self.index
    }

    pub fn new(
        index: Arc<TriggerIndex>,
        evaluator: Arc<Evaluator>,
        dispatcher: Arc<Dispatcher>,
        store: Arc<dyn TriggerStore>,
        refresh: RefreshHandle,
        dispatch_concurrency: usize,
    ) -> Self {
        Self {
            index,
            evaluator,
            dispatcher,
            store,
            refresh,
            fan_out: Arc::new(Semaphore::new(dispatch_concurrency.max(1))),
        }
    }

    /// Handle one bus message. Never fails: a poison message is logged and
    /// reported back as zero work so the caller acknowledges it (redelivery
    /// cannot make it good).
    pub async fn handle_message(
        &self,
        service: Service,
        payload: &[u8],
        cancel: &CancellationToken,
    ) -> HandleSummary {
        let mut summary = HandleSummary::default();

        let batch = match decode_batch(service, payload) {
            Ok(batch) => batch,
            Err(e) => {
                warn!(service = %service, error = %e, "Dropping undecodable bus message");
                return summary;
            }
        };
        summary.samples = batch.len();

        for sample in batch {
            if cancel.is_cancelled() {
                summary.cancelled = true;
                break;
            }
            self.handle_sample(service, sample, cancel, &mut summary).await;
        }

        summary.cancelled |= cancel.is_cancelled();
        summary
    }

    async fn handle_sample(
        &self,
        service: Service,
        sample: Sample,
        cancel: &CancellationToken,
        summary: &mut HandleSummary,
    ) {
        let asset_did = match did::resolve_asset_did(sample.subject()) {
            Ok(did) => did,
            Err(e) => {
                warn!(service = %service, error = %e, "Dropping sample with unroutable subject");
                return;
            }
        };

        let entries = self.index.lookup(&asset_did, service, sample.metric_name());
        summary.considered += entries.len();
        if entries.is_empty() {
            return;
        }

        let mut tasks: JoinSet<TaskResult> = JoinSet::new();
        for entry in entries {
            let permit = match self.fan_out.clone().acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => {
                    // Semaphore closed only at teardown.
                    summary.cancelled = true;
                    break;
                }
            };
            let evaluator = Arc::clone(&self.evaluator);
            let dispatcher = Arc::clone(&self.dispatcher);
            let store = Arc::clone(&self.store);
            let refresh = self.refresh.clone();
            let cancel = cancel.clone();
            let asset_did = asset_did.clone();
            let sample = sample.clone();

            tasks.spawn(async move {
                let _permit = permit;
                tokio::select! {
                    _ = cancel.cancelled() => TaskResult::Cancelled,
                    result = run_webhook(
                        &evaluator, &dispatcher, store.as_ref(), &refresh,
                        &entry, &asset_did, &sample, &cancel,
                    ) => result,
                }
            });
        }

        // A task failure never aborts siblings; every outcome is collected.
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(TaskResult::Done(verdict, outcome)) => {
                    match verdict {
                        Verdict::Fire => match outcome {
                            Some(DispatchOutcome::Delivered { .. }) => summary.fired += 1,
                            Some(
                                DispatchOutcome::SkippedCircuitOpen
                                | DispatchOutcome::SkippedMissing,
                            ) => summary.skipped_circuit += 1,
                            _ => summary.errors += 1,
                        },
                        Verdict::SkipPermission => summary.skipped_permission += 1,
                        Verdict::SkipCooldown => summary.skipped_cooldown += 1,
                        Verdict::SkipCondition => summary.skipped_condition += 1,
                    }
                }
                Ok(TaskResult::Errored) => summary.errors += 1,
                Ok(TaskResult::Cancelled) => summary.cancelled = true,
                Err(e) => {
                    warn!(error = %e, "Webhook task panicked");
                    summary.errors += 1;
                }
            }
        }
    }
}

/// Evaluate one webhook and dispatch on fire. Failure of a single webhook
/// is logged here and never propagates to its siblings.
#[allow(clippy::too_many_arguments)]
async fn run_webhook(
    evaluator: &Evaluator,
    dispatcher: &Dispatcher,
    store: &dyn TriggerStore,
    refresh: &RefreshHandle,
    entry: &Arc<IndexEntry>,
    asset_did: &str,
    sample: &Sample,
    cancel: &CancellationToken,
) -> TaskResult {
    let verdict = match evaluator.evaluate(entry, asset_did, sample, cancel).await {
        Ok(verdict) => verdict,
        Err(e) => {
            warn!(
                webhook_id = %abbrev_uuid(&entry.webhook.id),
                error = %e,
                "Webhook evaluation failed; siblings continue"
            );
            return TaskResult::Errored;
        }
    };

    match verdict {
        Verdict::Fire => {
            let outcome = match dispatcher.dispatch(entry, asset_did, sample).await {
                Ok(outcome) => outcome,
                Err(e) => {
                    warn!(
                        webhook_id = %abbrev_uuid(&entry.webhook.id),
                        error = %e,
                        "Webhook dispatch failed to record its outcome"
                    );
                    return TaskResult::Errored;
                }
            };
            TaskResult::Done(Verdict::Fire, Some(outcome))
        }
        Verdict::SkipPermission => {
            // The oracle said no: drop the subscription and let the next
            // rebuild stop indexing this pair.
            match store.delete_subscription(asset_did, entry.webhook.id).await {
                Ok(deleted) => {
                    info!(
                        webhook_id = %abbrev_uuid(&entry.webhook.id),
                        asset_did,
                        deleted,
                        "Permission revoked; subscription removed"
                    );
                    refresh.request_refresh();
                }
                Err(e) => {
                    warn!(
                        webhook_id = %abbrev_uuid(&entry.webhook.id),
                        error = %e,
                        "Failed to remove revoked subscription"
                    );
                }
            }
            TaskResult::Done(Verdict::SkipPermission, None)
        }
        other => TaskResult::Done(other, None),
    }
}

/// One long-running pull loop over a JetStream consumer.
pub struct ConsumerLoop {
    service: Service,
    engine: Arc<TriggerEngine>,
    jetstream: jetstream::Context,
    stream_name: String,
    subject: String,
    durable_name: String,
    initial_offset: InitialOffset,
    handler_deadline: Duration,
    state: LoopState,
}

impl ConsumerLoop {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        service: Service,
        engine: Arc<TriggerEngine>,
        jetstream: jetstream::Context,
        stream_name: String,
        subject: String,
        durable_name: String,
        initial_offset: InitialOffset,
        handler_deadline: Duration,
    ) -> Self {
        Self {
            service,
            engine,
            jetstream,
            stream_name,
            subject,
            durable_name,
            initial_offset,
            handler_deadline,
            state: LoopState::Idle,
        }
    }

    fn transition(&mut self, next: LoopState) {
        info!(
            service = %self.service,
            from = self.state.as_str(),
            to = next.as_str(),
            "Consumer loop state change"
        );
        self.state = next;
    }

    async fn ensure_consumer(&self) -> anyhow::Result<consumer::PullConsumer> {
        let stream = self
            .jetstream
            .get_or_create_stream(stream::Config {
                name: self.stream_name.clone(),
                description: Some(format!("{} telemetry stream", self.service)),
                subjects: vec![self.subject.clone()],
                ..Default::default()
            })
            .await?;

        let consumer = stream
            .get_or_create_consumer(
                &self.durable_name,
                consumer::pull::Config {
                    name: Some(self.durable_name.clone()),
                    durable_name: Some(self.durable_name.clone()),
                    description: Some(format!("{} trigger consumer", self.service)),
                    deliver_policy: self.initial_offset.deliver_policy(),
                    ack_policy: consumer::AckPolicy::Explicit,
                    ack_wait: Duration::from_secs(120),
                    ..Default::default()
                },
            )
            .await?;

        Ok(consumer)
    }

    /// Pull-decode-handle-ack until cancelled.
    pub async fn run(mut self, shutdown: CancellationToken) -> anyhow::Result<()> {
        self.transition(LoopState::Subscribing);
        let consumer = self.ensure_consumer().await?;
        self.transition(LoopState::Running);

        'running: loop {
            let batch = tokio::select! {
                _ = shutdown.cancelled() => break 'running,
                batch = consumer
                    .fetch()
                    .max_messages(1)
                    .expires(FETCH_WAIT)
                    .messages() => batch,
            };

            let mut batch = match batch {
                Ok(batch) => batch,
                Err(e) => {
                    warn!(service = %self.service, error = %e, "Bus fetch failed, backing off");
                    tokio::select! {
                        _ = shutdown.cancelled() => break 'running,
                        _ = tokio::time::sleep(Duration::from_secs(1)) => continue 'running,
                    }
                }
            };

            while let Some(next) = tokio::select! {
                _ = shutdown.cancelled() => None,
                next = batch.next() => next,
            } {
                let message = match next {
                    Ok(message) => message,
                    Err(e) => {
                        warn!(service = %self.service, error = %e, "Bus message error");
                        continue;
                    }
                };

                let summary = self.handle_with_deadline(&message.payload, &shutdown).await;
                debug!(
                    service = %self.service,
                    samples = summary.samples,
                    considered = summary.considered,
                    fired = summary.fired,
                    errors = summary.errors,
                    "Message handled"
                );

                if summary.cancelled {
                    // Leave the message unacknowledged; the bus redelivers.
                    break;
                }
                if let Err(e) = message.ack().await {
                    warn!(service = %self.service, error = %e, "Failed to acknowledge message");
                }
            }

            if shutdown.is_cancelled() {
                break 'running;
            }
        }

        // The fan-out is awaited inside handle_message, so draining only
        // has to stop pulling.
        self.transition(LoopState::Draining);
        self.transition(LoopState::Stopped);
        Ok(())
    }

    /// Run the handler under the per-message deadline. On expiry the
    /// message token is cancelled and the in-flight fan-out is awaited so
    /// no task outlives its message.
    async fn handle_with_deadline(
        &self,
        payload: &[u8],
        shutdown: &CancellationToken,
    ) -> HandleSummary {
        let message_token = shutdown.child_token();
        let handler = self.engine.handle_message(self.service, payload, &message_token);
        tokio::pin!(handler);

        tokio::select! {
            summary = &mut handler => summary,
            _ = tokio::time::sleep(self.handler_deadline) => {
                warn!(service = %self.service, "Message handler deadline exceeded, cancelling");
                message_token.cancel();
                handler.await
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::SignalCatalog;
    use crate::index::refresh::refresh_channel;
    use crate::test_utils::{MemoryTriggerStore, StaticOracle, webhook_fixture};
    use wiremock::matchers::method;
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const VEHICLE: &str = "did:erc721:137:0xbA5738a18d83D41847dfFbDC6101d37C69c9B0cF:7";

    struct Harness {
        engine: TriggerEngine,
        store: Arc<MemoryTriggerStore>,
        refresh_rx: tokio::sync::mpsc::Receiver<()>,
    }

    async fn harness(oracle: StaticOracle) -> Harness {
        let store = Arc::new(MemoryTriggerStore::new());
        let catalog = Arc::new(SignalCatalog::load_embedded().unwrap());
        let oracle = Arc::new(oracle);
        let index = Arc::new(TriggerIndex::new(store.clone(), catalog.clone()));
        let evaluator = Arc::new(Evaluator::new(
            store.clone(),
            oracle,
            catalog.clone(),
            1000,
        ));
        let dispatcher = Arc::new(
            Dispatcher::new(
                store.clone(),
                catalog,
                Duration::from_secs(5),
                3,
                "vehicle-triggers".to_string(),
            )
            .unwrap(),
        );
        let (refresh, refresh_rx) = refresh_channel();
        let engine = TriggerEngine::new(index, evaluator, dispatcher, store.clone(), refresh, 100);
        Harness {
            engine,
            store,
            refresh_rx,
        }
    }

    fn signal_payload(value: f64) -> Vec<u8> {
        serde_json::to_vec(&serde_json::json!({
            "subject": VEHICLE,
            "timestamp": "2025-06-01T12:00:00Z",
            "name": "speed",
            "valueNumber": value,
            "valueString": "",
            "source": "0xDevice",
            "producer": "p"
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn matching_sample_fires_and_logs() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let h = harness(StaticOracle::allow()).await;
        let mut webhook = webhook_fixture("signals", "speed", "valueNumber > 55");
        webhook.target_uri = server.uri();
        h.store.insert_webhook(webhook.clone());
        h.store.subscribe(VEHICLE, webhook.id);
        h.engine.index.rebuild().await.unwrap();

        let summary = h
            .engine
            .handle_message(Service::Signals, &signal_payload(63.0), &CancellationToken::new())
            .await;

        assert_eq!(summary.samples, 1);
        assert_eq!(summary.considered, 1);
        assert_eq!(summary.fired, 1);
        assert!(!summary.cancelled);
        assert_eq!(h.store.fire_log_count(webhook.id, VEHICLE), 1);
    }

    #[tokio::test]
    async fn unknown_key_considers_nothing() {
        let h = harness(StaticOracle::allow()).await;
        let summary = h
            .engine
            .handle_message(Service::Signals, &signal_payload(63.0), &CancellationToken::new())
            .await;
        assert_eq!(summary.considered, 0);
        assert_eq!(summary.fired, 0);
    }

    #[tokio::test]
    async fn poison_message_is_swallowed() {
        let h = harness(StaticOracle::allow()).await;
        let summary = h
            .engine
            .handle_message(Service::Signals, b"{invalid", &CancellationToken::new())
            .await;
        assert_eq!(summary, HandleSummary::default());

        // Routable JSON with a garbage subject is also dropped quietly.
        let bad_subject = serde_json::to_vec(&serde_json::json!({
            "subject": "not-a-did",
            "timestamp": "2025-06-01T12:00:00Z",
            "name": "speed",
            "valueNumber": 99.0
        }))
        .unwrap();
        let summary = h
            .engine
            .handle_message(Service::Signals, &bad_subject, &CancellationToken::new())
            .await;
        assert_eq!(summary.considered, 0);
    }

    #[tokio::test]
    async fn permission_revocation_unsubscribes_and_schedules_refresh() {
        let mut h = harness(StaticOracle::deny()).await;
        let webhook = webhook_fixture("signals", "speed", "true");
        h.store.insert_webhook(webhook.clone());
        h.store.subscribe(VEHICLE, webhook.id);
        h.engine.index.rebuild().await.unwrap();

        let summary = h
            .engine
            .handle_message(Service::Signals, &signal_payload(63.0), &CancellationToken::new())
            .await;
        assert_eq!(summary.skipped_permission, 1);
        assert_eq!(summary.fired, 0);

        // Subscription is gone and a refresh was requested.
        assert!(!h.store.is_subscribed(VEHICLE, webhook.id));
        assert!(h.refresh_rx.try_recv().is_ok());

        // After the rebuild the index stops returning the webhook.
        h.engine.index.rebuild().await.unwrap();
        let summary = h
            .engine
            .handle_message(Service::Signals, &signal_payload(63.0), &CancellationToken::new())
            .await;
        assert_eq!(summary.considered, 0);
    }

    #[tokio::test]
    async fn event_array_fans_out_per_element() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let h = harness(StaticOracle::allow()).await;
        let mut webhook = webhook_fixture("events", "HarshBraking", "true");
        webhook.target_uri = server.uri();
        h.store.insert_webhook(webhook.clone());
        h.store.subscribe(VEHICLE, webhook.id);
        h.engine.index.rebuild().await.unwrap();

        let payload = serde_json::to_vec(&serde_json::json!([
            {
                "subject": VEHICLE,
                "timestamp": "2025-06-01T12:00:00Z",
                "name": "HarshBraking",
                "source": "0xDevice",
                "producer": "p",
                "durationNs": 100,
                "metadata": ""
            },
            {
                "subject": VEHICLE,
                "timestamp": "2025-06-01T12:00:01Z",
                "name": "HarshBraking",
                "source": "0xDevice",
                "producer": "p",
                "durationNs": 200,
                "metadata": ""
            }
        ]))
        .unwrap();

        let summary = h
            .engine
            .handle_message(Service::Events, &payload, &CancellationToken::new())
            .await;
        assert_eq!(summary.samples, 2);
        assert_eq!(summary.fired, 2);
    }

    #[tokio::test]
    async fn cancelled_message_reports_cancelled_and_does_not_fire() {
        let h = harness(StaticOracle::allow()).await;
        let webhook = webhook_fixture("signals", "speed", "valueNumber > 55");
        h.store.insert_webhook(webhook.clone());
        h.store.subscribe(VEHICLE, webhook.id);
        h.engine.index.rebuild().await.unwrap();

        let token = CancellationToken::new();
        token.cancel();
        let summary = h
            .engine
            .handle_message(Service::Signals, &signal_payload(63.0), &token)
            .await;
        assert!(summary.cancelled);
        assert_eq!(summary.fired, 0);
        assert_eq!(h.store.fire_log_count(webhook.id, VEHICLE), 0);
    }

    #[test]
    fn initial_offset_maps_to_deliver_policy() {
        assert!(matches!(
            InitialOffset::Oldest.deliver_policy(),
            consumer::DeliverPolicy::All
        ));
        assert!(matches!(
            InitialOffset::Latest.deliver_policy(),
            consumer::DeliverPolicy::New
        ));
    }

    #[test]
    fn loop_states_have_names() {
        assert_eq!(LoopState::Idle.as_str(), "idle");
        assert_eq!(LoopState::Stopped.as_str(), "stopped");
    }
}
