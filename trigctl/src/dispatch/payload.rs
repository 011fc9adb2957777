//! CloudEvents 1.0 envelope delivered to webhook targets.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::catalog::SignalDef;
use crate::consumer::samples::Sample;
use crate::db::models::webhooks::Webhook;
use crate::types::WebhookId;
use crate::xl::Location;

pub const SPEC_VERSION: &str = "1.0";
pub const EVENT_TYPE: &str = "dimo.trigger";
pub const CONTENT_TYPE: &str = "application/json";
pub const DATAVERSION_SIGNALS: &str = "telemetry.signals/v1.0";
pub const DATAVERSION_EVENTS: &str = "telemetry.events/v1.0";

/// The delivery envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CloudEvent {
    pub id: Uuid,
    pub source: String,
    pub subject: String,
    pub specversion: String,
    pub time: DateTime<Utc>,
    #[serde(rename = "type")]
    pub event_type: String,
    pub datacontenttype: String,
    pub dataversion: String,
    /// The webhook that produced this delivery.
    pub producer: String,
    pub data: TriggerData,
}

/// Trigger context plus the sample that fired it.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TriggerData {
    pub service: String,
    pub metric_name: String,
    pub webhook_id: WebhookId,
    pub webhook_name: String,
    #[serde(rename = "assetDID")]
    pub asset_did: String,
    pub condition: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signal: Option<SignalPayload>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub event: Option<EventPayload>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignalPayload {
    pub name: String,
    pub units: String,
    pub value_type: String,
    pub value: serde_json::Value,
    pub timestamp: DateTime<Utc>,
    pub source: String,
    pub producer: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventPayload {
    pub name: String,
    pub timestamp: DateTime<Utc>,
    pub source: String,
    pub producer: String,
    pub duration_ns: i64,
    pub metadata: String,
}

/// Assemble the envelope for one fired webhook.
pub fn build_cloud_event(
    webhook: &Webhook,
    asset_did: &str,
    sample: &Sample,
    signal_def: Option<&SignalDef>,
    delivery_source: &str,
) -> CloudEvent {
    let (signal, event, dataversion) = match sample {
        Sample::Signal { sample, .. } => {
            let (units, value_type) = signal_def
                .map(|def| (def.unit.clone(), def.value_type.as_str().to_string()))
                .unwrap_or_default();
            let value = match signal_def.map(|d| d.value_type) {
                Some(crate::catalog::ValueType::String) => {
                    serde_json::Value::String(sample.value_string.clone())
                }
                Some(crate::catalog::ValueType::Location) => {
                    serde_json::to_value(sample.value_location.unwrap_or_else(Location::default))
                        .unwrap_or(serde_json::Value::Null)
                }
                _ => serde_json::json!(sample.value_number),
            };
            (
                Some(SignalPayload {
                    name: sample.name.clone(),
                    units,
                    value_type,
                    value,
                    timestamp: sample.timestamp,
                    source: sample.source.clone(),
                    producer: sample.producer.clone(),
                }),
                None,
                DATAVERSION_SIGNALS,
            )
        }
        Sample::Event { sample, .. } => (
            None,
            Some(EventPayload {
                name: sample.name.clone(),
                timestamp: sample.timestamp,
                source: sample.source.clone(),
                producer: sample.producer.clone(),
                duration_ns: sample.duration_ns,
                metadata: sample.metadata.clone(),
            }),
            DATAVERSION_EVENTS,
        ),
    };

    CloudEvent {
        id: Uuid::new_v4(),
        source: delivery_source.to_string(),
        subject: asset_did.to_string(),
        specversion: SPEC_VERSION.to_string(),
        time: Utc::now(),
        event_type: EVENT_TYPE.to_string(),
        datacontenttype: CONTENT_TYPE.to_string(),
        dataversion: dataversion.to_string(),
        producer: webhook.id.to_string(),
        data: TriggerData {
            service: webhook.service.clone(),
            metric_name: webhook.metric_name.clone(),
            webhook_id: webhook.id,
            webhook_name: webhook.display_name.clone(),
            asset_did: asset_did.to_string(),
            condition: webhook.condition.clone(),
            signal,
            event,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::SignalCatalog;
    use crate::test_utils::{event_sample, signal_sample, webhook_fixture};

    const VEHICLE: &str = "did:erc721:137:0xbA5738a18d83D41847dfFbDC6101d37C69c9B0cF:7";

    #[test]
    fn signal_envelope_has_the_documented_shape() {
        let catalog = SignalCatalog::load_embedded().unwrap();
        let webhook = webhook_fixture("signals", "speed", "valueNumber > 55");
        let sample = signal_sample(VEHICLE, "speed", 63.0);

        let envelope = build_cloud_event(
            &webhook,
            VEHICLE,
            &sample,
            catalog.lookup("speed"),
            "vehicle-triggers",
        );
        let json = serde_json::to_value(&envelope).unwrap();

        assert_eq!(json["specversion"], "1.0");
        assert_eq!(json["type"], "dimo.trigger");
        assert_eq!(json["datacontenttype"], "application/json");
        assert_eq!(json["dataversion"], "telemetry.signals/v1.0");
        assert_eq!(json["subject"], VEHICLE);
        assert_eq!(json["producer"], webhook.id.to_string());
        assert_eq!(json["data"]["metricName"], "speed");
        assert_eq!(json["data"]["assetDID"], VEHICLE);
        assert_eq!(json["data"]["signal"]["value"], 63.0);
        assert_eq!(json["data"]["signal"]["units"], "km/h");
        assert_eq!(json["data"]["signal"]["valueType"], "number");
        assert!(json["data"].get("event").is_none());
    }

    #[test]
    fn event_envelope_carries_duration_and_metadata() {
        let webhook = webhook_fixture("events", "HarshBraking", "name != previousName");
        let sample = event_sample(VEHICLE, "HarshBraking");

        let envelope =
            build_cloud_event(&webhook, VEHICLE, &sample, None, "vehicle-triggers");
        let json = serde_json::to_value(&envelope).unwrap();

        assert_eq!(json["dataversion"], "telemetry.events/v1.0");
        assert_eq!(json["data"]["event"]["name"], "HarshBraking");
        assert!(json["data"]["event"]["durationNs"].is_i64());
        assert!(json["data"].get("signal").is_none());
    }
}
