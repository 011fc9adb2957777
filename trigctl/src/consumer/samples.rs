//! Decoded bus payloads.
//!
//! Signals arrive as one JSON object per message; events arrive as a JSON
//! array per message with every element evaluated independently. Both
//! funnel through [`decode_batch`], so an upstream format change lands in
//! one place. The raw JSON of each sample is kept alongside the typed
//! decode because it becomes the fire-log snapshot verbatim.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::Error;
use crate::types::Service;
use crate::xl::Location;

/// One decoded signal sample.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignalSample {
    pub subject: String,
    pub timestamp: DateTime<Utc>,
    pub name: String,
    #[serde(default)]
    pub value_number: f64,
    #[serde(default)]
    pub value_string: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value_location: Option<Location>,
    #[serde(default)]
    pub source: String,
    #[serde(default)]
    pub producer: String,
}

/// One decoded event.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventSample {
    pub subject: String,
    pub timestamp: DateTime<Utc>,
    pub name: String,
    #[serde(default)]
    pub source: String,
    #[serde(default)]
    pub producer: String,
    #[serde(default)]
    pub duration_ns: i64,
    #[serde(default)]
    pub metadata: String,
}

/// A decoded sample plus the raw JSON it came from.
#[derive(Debug, Clone)]
pub enum Sample {
    Signal {
        sample: SignalSample,
        raw: serde_json::Value,
    },
    Event {
        sample: EventSample,
        raw: serde_json::Value,
    },
}

impl Sample {
    pub fn service(&self) -> Service {
        match self {
            Sample::Signal { .. } => Service::Signals,
            Sample::Event { .. } => Service::Events,
        }
    }

    pub fn subject(&self) -> &str {
        match self {
            Sample::Signal { sample, .. } => &sample.subject,
            Sample::Event { sample, .. } => &sample.subject,
        }
    }

    /// The metric this sample selects in the index: the signal name or the
    /// event name.
    pub fn metric_name(&self) -> &str {
        match self {
            Sample::Signal { sample, .. } => &sample.name,
            Sample::Event { sample, .. } => &sample.name,
        }
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            Sample::Signal { sample, .. } => sample.timestamp,
            Sample::Event { sample, .. } => sample.timestamp,
        }
    }

    /// The raw JSON, written verbatim into the fire log on delivery.
    pub fn raw(&self) -> &serde_json::Value {
        match self {
            Sample::Signal { raw, .. } => raw,
            Sample::Event { raw, .. } => raw,
        }
    }
}

fn sample_from_value(service: Service, raw: serde_json::Value) -> Result<Sample, Error> {
    match service {
        Service::Signals => {
            let sample: SignalSample =
                serde_json::from_value(raw.clone()).map_err(|e| Error::BadRequest {
                    message: format!("undecodable signal payload: {e}"),
                })?;
            Ok(Sample::Signal { sample, raw })
        }
        Service::Events => {
            let sample: EventSample =
                serde_json::from_value(raw.clone()).map_err(|e| Error::BadRequest {
                    message: format!("undecodable event payload: {e}"),
                })?;
            Ok(Sample::Event { sample, raw })
        }
    }
}

/// Decode one bus message into its samples.
pub fn decode_batch(service: Service, payload: &[u8]) -> Result<Vec<Sample>, Error> {
    let value: serde_json::Value =
        serde_json::from_slice(payload).map_err(|e| Error::BadRequest {
            message: format!("message payload is not JSON: {e}"),
        })?;

    match service {
        Service::Signals => Ok(vec![sample_from_value(service, value)?]),
        Service::Events => {
            let serde_json::Value::Array(items) = value else {
                return Err(Error::BadRequest {
                    message: "events payload must be a JSON array".to_string(),
                });
            };
            items
                .into_iter()
                .map(|item| sample_from_value(service, item))
                .collect()
        }
    }
}

/// Re-decode a fire-log snapshot as the previous sample of the same service.
pub fn decode_previous(service: Service, snapshot: &serde_json::Value) -> Result<Sample, Error> {
    sample_from_value(service, snapshot.clone())
}
