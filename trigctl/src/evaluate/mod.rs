//! Trigger evaluation: permission -> cooldown -> previous values ->
//! condition.
//!
//! The evaluator is stateless; everything it needs is borrowed from the
//! index entry, the store, and the oracle. Each step may short-circuit with
//! a skip verdict, and the caller decides what a skip means (the consumer
//! loop deletes the subscription on `SkipPermission`, for example).

use std::sync::Arc;

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::instrument;

use crate::catalog::{EVENT_PERMISSIONS, SignalCatalog, ValueType};
use crate::consumer::samples::{EventSample, Sample, SignalSample, decode_previous};
use crate::errors::{Error, Result};
use crate::index::IndexEntry;
use crate::oracle::PermissionOracle;
use crate::store::TriggerStore;
use crate::types::abbrev_uuid;
use crate::xl::{self, Bindings, Value};

/// Outcome of evaluating one webhook against one sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// All gates passed; dispatch the webhook.
    Fire,
    /// The oracle denied the owner access to this vehicle. The caller is
    /// expected to remove the subscription.
    SkipPermission,
    /// Inside the cooldown window since the last fire.
    SkipCooldown,
    /// The condition evaluated to something other than literal true.
    SkipCondition,
}

/// Stateless verdict pipeline shared by both consumer loops.
pub struct Evaluator {
    store: Arc<dyn TriggerStore>,
    oracle: Arc<dyn PermissionOracle>,
    catalog: Arc<SignalCatalog>,
    cost_limit: u64,
}

impl Evaluator {
    pub fn new(
        store: Arc<dyn TriggerStore>,
        oracle: Arc<dyn PermissionOracle>,
        catalog: Arc<SignalCatalog>,
        cost_limit: u64,
    ) -> Self {
        Self {
            store,
            oracle,
            catalog,
            cost_limit,
        }
    }

    /// Run the full pipeline for one `(webhook, sample)` pair.
    #[instrument(skip_all, fields(webhook_id = %abbrev_uuid(&entry.webhook.id), asset_did = %asset_did))]
    pub async fn evaluate(
        &self,
        entry: &IndexEntry,
        asset_did: &str,
        sample: &Sample,
        cancel: &CancellationToken,
    ) -> Result<Verdict> {
        let webhook = &entry.webhook;

        // 1. Permission: signals use the metric's declared permission set,
        //    events use the fixed history set.
        let permissions: Vec<String> = match sample {
            Sample::Signal { sample, .. } => {
                let def = self.catalog.lookup(&sample.name).ok_or_else(|| Error::Internal {
                    operation: format!("resolve permissions for signal {}", sample.name),
                })?;
                def.permissions.clone()
            }
            Sample::Event { .. } => EVENT_PERMISSIONS.iter().map(|s| s.to_string()).collect(),
        };
        let granted = self
            .oracle
            .has_permissions(asset_did, &webhook.developer_license, &permissions)
            .await?;
        if !granted {
            return Ok(Verdict::SkipPermission);
        }

        // 2. Cooldown, anchored on the most recent fire (sentinel when the
        //    pair has never fired).
        let last = self.store.latest_fire_log(webhook.id, asset_did).await?;
        let elapsed = Utc::now() - last.last_fired_at;
        if elapsed < chrono::Duration::seconds(i64::from(webhook.cooldown_period.max(0))) {
            return Ok(Verdict::SkipCooldown);
        }

        // 3. Previous values. An undecodable snapshot is a hard error, not
        //    a silent skip; the log row is supposed to round-trip.
        let previous = if last.is_empty_snapshot() {
            None
        } else {
            Some(
                decode_previous(sample.service(), &last.snapshot_data).map_err(|e| {
                    Error::Internal {
                        operation: format!(
                            "decode fire-log snapshot for webhook {}: {e}",
                            webhook.id
                        ),
                    }
                })?,
            )
        };

        // 4. Condition under the cost budget.
        let bindings = self.bindings_for(sample, previous.as_ref())?;
        if entry
            .program
            .matches(&bindings, self.cost_limit, Some(cancel))?
        {
            Ok(Verdict::Fire)
        } else {
            Ok(Verdict::SkipCondition)
        }
    }

    fn bindings_for(&self, sample: &Sample, previous: Option<&Sample>) -> Result<Bindings> {
        match (sample, previous) {
            (Sample::Signal { sample, .. }, previous) => {
                let def = self.catalog.lookup(&sample.name).ok_or_else(|| Error::Internal {
                    operation: format!("resolve value type for signal {}", sample.name),
                })?;
                let prev = match previous {
                    None => None,
                    Some(Sample::Signal { sample, .. }) => Some(sample),
                    Some(Sample::Event { .. }) => {
                        return Err(Error::Internal {
                            operation: "mismatched previous-sample shape".to_string(),
                        });
                    }
                };
                Ok(signal_bindings(def.value_type, sample, prev))
            }
            (Sample::Event { sample, .. }, previous) => {
                let prev = match previous {
                    None => None,
                    Some(Sample::Event { sample, .. }) => Some(sample),
                    Some(Sample::Signal { .. }) => {
                        return Err(Error::Internal {
                            operation: "mismatched previous-sample shape".to_string(),
                        });
                    }
                };
                Ok(event_bindings(sample, prev))
            }
        }
    }
}

fn typed_value(value_type: ValueType, sample: &SignalSample) -> Value {
    match value_type {
        ValueType::Number => Value::Number(sample.value_number),
        ValueType::String => Value::Text(sample.value_string.clone()),
        ValueType::Location => Value::Location(sample.value_location.unwrap_or_default()),
    }
}

/// Bindings for a signal condition. Absent previous values stay at their
/// schema zeroes.
fn signal_bindings(
    value_type: ValueType,
    current: &SignalSample,
    previous: Option<&SignalSample>,
) -> Bindings {
    let schema = xl::signal_schema(value_type.kind());
    let mut bindings = schema.zero_bindings();
    bindings.set("value", typed_value(value_type, current));
    bindings.set("valueNumber", Value::Number(current.value_number));
    bindings.set("valueString", Value::Text(current.value_string.clone()));
    bindings.set("source", Value::Text(current.source.clone()));
    if let Some(prev) = previous {
        bindings.set("previousValue", typed_value(value_type, prev));
        bindings.set("previousValueNumber", Value::Number(prev.value_number));
        bindings.set("previousValueString", Value::Text(prev.value_string.clone()));
        bindings.set("previousSource", Value::Text(prev.source.clone()));
    }
    bindings
}

/// Bindings for an event condition.
fn event_bindings(current: &EventSample, previous: Option<&EventSample>) -> Bindings {
    let schema = xl::event_schema();
    let mut bindings = schema.zero_bindings();
    bindings.set("name", Value::Text(current.name.clone()));
    bindings.set("source", Value::Text(current.source.clone()));
    bindings.set("durationNs", Value::Number(current.duration_ns as f64));
    bindings.set("metadata", Value::Text(current.metadata.clone()));
    if let Some(prev) = previous {
        bindings.set("previousName", Value::Text(prev.name.clone()));
        bindings.set("previousSource", Value::Text(prev.source.clone()));
        bindings.set("previousDurationNs", Value::Number(prev.duration_ns as f64));
        bindings.set("previousMetadata", Value::Text(prev.metadata.clone()));
    }
    bindings
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{
        MemoryTriggerStore, StaticOracle, event_sample, index_entry, signal_sample,
        webhook_fixture,
    };
    use crate::xl::Location;

    const VEHICLE: &str = "did:erc721:137:0xbA5738a18d83D41847dfFbDC6101d37C69c9B0cF:7";

    fn evaluator(
        store: Arc<MemoryTriggerStore>,
        oracle: Arc<StaticOracle>,
    ) -> Evaluator {
        Evaluator::new(
            store,
            oracle,
            Arc::new(SignalCatalog::load_embedded().unwrap()),
            1000,
        )
    }

    #[tokio::test]
    async fn true_condition_fires() {
        let store = Arc::new(MemoryTriggerStore::new());
        let oracle = Arc::new(StaticOracle::allow());
        let entry = index_entry(webhook_fixture("signals", "speed", "valueNumber > 55"));

        let verdict = evaluator(store, oracle)
            .evaluate(
                &entry,
                VEHICLE,
                &signal_sample(VEHICLE, "speed", 60.0),
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(verdict, Verdict::Fire);
    }

    #[tokio::test]
    async fn false_condition_skips() {
        let store = Arc::new(MemoryTriggerStore::new());
        let oracle = Arc::new(StaticOracle::allow());
        let entry = index_entry(webhook_fixture("signals", "speed", "valueNumber > 55"));

        let verdict = evaluator(store, oracle)
            .evaluate(
                &entry,
                VEHICLE,
                &signal_sample(VEHICLE, "speed", 50.0),
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(verdict, Verdict::SkipCondition);
    }

    #[tokio::test]
    async fn denied_permission_short_circuits() {
        let store = Arc::new(MemoryTriggerStore::new());
        let oracle = Arc::new(StaticOracle::deny());
        // Condition would fire, but permission is checked first.
        let entry = index_entry(webhook_fixture("signals", "speed", "true"));

        let verdict = evaluator(store.clone(), oracle.clone())
            .evaluate(
                &entry,
                VEHICLE,
                &signal_sample(VEHICLE, "speed", 99.0),
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(verdict, Verdict::SkipPermission);
        // Signals ask for the metric's permission set.
        assert_eq!(
            oracle.last_permissions(),
            vec!["privilege:GetNonLocationHistory".to_string()]
        );
    }

    #[tokio::test]
    async fn events_use_the_fixed_permission_set() {
        let store = Arc::new(MemoryTriggerStore::new());
        let oracle = Arc::new(StaticOracle::allow());
        let entry = index_entry(webhook_fixture("events", "HarshBraking", "true"));

        evaluator(store, oracle.clone())
            .evaluate(
                &entry,
                VEHICLE,
                &event_sample(VEHICLE, "HarshBraking"),
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        let perms = oracle.last_permissions();
        assert!(perms.contains(&"privilege:GetNonLocationHistory".to_string()));
        assert!(perms.contains(&"privilege:GetLocationHistory".to_string()));
    }

    #[tokio::test]
    async fn cooldown_window_gates_fires() {
        let store = Arc::new(MemoryTriggerStore::new());
        let oracle = Arc::new(StaticOracle::allow());
        let mut webhook = webhook_fixture("signals", "speed", "valueNumber > 55");
        webhook.cooldown_period = 60;
        let entry = index_entry(webhook.clone());
        let sample = signal_sample(VEHICLE, "speed", 70.0);

        // Fired 30 seconds ago: inside the window.
        store.record_fire(webhook.id, VEHICLE, sample.raw().clone(), 30);
        let ev = evaluator(store.clone(), oracle.clone());
        let verdict = ev
            .evaluate(&entry, VEHICLE, &sample, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(verdict, Verdict::SkipCooldown);

        // Backdate past the window: fires again.
        store.backdate_last_fire(webhook.id, VEHICLE, 80);
        let verdict = ev
            .evaluate(&entry, VEHICLE, &sample, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(verdict, Verdict::Fire);
    }

    #[tokio::test]
    async fn zero_cooldown_always_passes_the_gate() {
        let store = Arc::new(MemoryTriggerStore::new());
        let oracle = Arc::new(StaticOracle::allow());
        let webhook = webhook_fixture("signals", "speed", "valueNumber > 55");
        assert_eq!(webhook.cooldown_period, 0);
        let entry = index_entry(webhook.clone());
        let sample = signal_sample(VEHICLE, "speed", 70.0);

        store.record_fire(webhook.id, VEHICLE, sample.raw().clone(), 0);
        let verdict = evaluator(store, oracle)
            .evaluate(&entry, VEHICLE, &sample, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(verdict, Verdict::Fire);
    }

    #[tokio::test]
    async fn previous_values_come_from_the_last_fire() {
        let store = Arc::new(MemoryTriggerStore::new());
        let oracle = Arc::new(StaticOracle::allow());
        let webhook = webhook_fixture("signals", "speed", "valueNumber > previousValueNumber + 10");
        let entry = index_entry(webhook.clone());

        // No previous fire: previousValueNumber is 0, so 15 > 10 fires.
        let ev = evaluator(store.clone(), oracle);
        let verdict = ev
            .evaluate(
                &entry,
                VEHICLE,
                &signal_sample(VEHICLE, "speed", 15.0),
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(verdict, Verdict::Fire);

        // Record that fire; the next sample is compared against 15.
        let fired = signal_sample(VEHICLE, "speed", 15.0);
        store.record_fire(webhook.id, VEHICLE, fired.raw().clone(), 5);

        let verdict = ev
            .evaluate(
                &entry,
                VEHICLE,
                &signal_sample(VEHICLE, "speed", 20.0),
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(verdict, Verdict::SkipCondition);

        let verdict = ev
            .evaluate(
                &entry,
                VEHICLE,
                &signal_sample(VEHICLE, "speed", 26.0),
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(verdict, Verdict::Fire);
    }

    #[tokio::test]
    async fn corrupted_snapshot_is_a_hard_error() {
        let store = Arc::new(MemoryTriggerStore::new());
        let oracle = Arc::new(StaticOracle::allow());
        let webhook = webhook_fixture("signals", "speed", "valueNumber > 55");
        let entry = index_entry(webhook.clone());

        store.record_fire(
            webhook.id,
            VEHICLE,
            serde_json::json!({"subject": 42, "timestamp": "never"}),
            5,
        );

        let err = evaluator(store, oracle)
            .evaluate(
                &entry,
                VEHICLE,
                &signal_sample(VEHICLE, "speed", 70.0),
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Internal { .. }), "{err:?}");
    }

    #[tokio::test]
    async fn runaway_condition_reports_cost_exceeded() {
        let store = Arc::new(MemoryTriggerStore::new());
        let oracle = Arc::new(StaticOracle::allow());
        let source = (0..100)
            .map(|_| "valueNumber >= 0".to_string())
            .collect::<Vec<_>>()
            .join(" && ");
        let entry = index_entry(webhook_fixture("signals", "speed", &source));

        let tight = Evaluator::new(
            store,
            oracle,
            Arc::new(SignalCatalog::load_embedded().unwrap()),
            50,
        );
        let err = tight
            .evaluate(
                &entry,
                VEHICLE,
                &signal_sample(VEHICLE, "speed", 70.0),
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();
        assert!(
            matches!(err, Error::Expression(xl::Error::CostExceeded { .. })),
            "{err:?}"
        );
    }

    #[tokio::test]
    async fn location_distance_against_zero_previous() {
        let store = Arc::new(MemoryTriggerStore::new());
        let oracle = Arc::new(StaticOracle::allow());
        let entry = index_entry(webhook_fixture(
            "signals",
            "currentLocationCoordinates",
            "geoDistance(value.Latitude, value.Longitude, previousValue.Latitude, previousValue.Longitude) > 1.0",
        ));
        let ev = evaluator(store, oracle);

        let mut near = signal_sample(VEHICLE, "currentLocationCoordinates", 0.0);
        set_location(&mut near, 0.0, 0.005);
        let verdict = ev
            .evaluate(&entry, VEHICLE, &near, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(verdict, Verdict::SkipCondition);

        let mut far = signal_sample(VEHICLE, "currentLocationCoordinates", 0.0);
        set_location(&mut far, 0.0, 0.02);
        let verdict = ev
            .evaluate(&entry, VEHICLE, &far, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(verdict, Verdict::Fire);
    }

    fn set_location(sample: &mut Sample, latitude: f64, longitude: f64) {
        let Sample::Signal { sample, raw } = sample else {
            panic!("expected a signal");
        };
        sample.value_location = Some(Location {
            latitude,
            longitude,
            hdop: 0.5,
        });
        raw["valueLocation"] = serde_json::json!({
            "latitude": latitude,
            "longitude": longitude,
            "hdop": 0.5
        });
    }
}
