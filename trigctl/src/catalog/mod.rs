//! Static signal catalog: metric name → value type + required permissions.
//!
//! The catalog is loaded once at startup from an embedded schema resource
//! and is immutable for the process lifetime. A load failure is fatal; the
//! engine cannot type-check conditions without it.

use std::collections::HashMap;

use anyhow::Context;
use serde::Deserialize;

use crate::xl::ValueKind;

/// Embedded signal schema, generated from the platform signal definitions.
const SIGNALS_JSON: &str = include_str!("signals.json");

/// Permission required to read non-location telemetry history.
pub const PERMISSION_NONLOCATION_HISTORY: &str = "privilege:GetNonLocationHistory";

/// Permission required to read location telemetry history.
pub const PERMISSION_LOCATION_HISTORY: &str = "privilege:GetLocationHistory";

/// Events carry free-form metadata that may embed location, so event
/// webhooks require the full history permission set.
pub const EVENT_PERMISSIONS: &[&str] = &[
    PERMISSION_NONLOCATION_HISTORY,
    PERMISSION_LOCATION_HISTORY,
];

/// Declared value shape of a signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ValueType {
    Number,
    String,
    Location,
}

impl ValueType {
    /// The condition-language type this signal binds `value` to.
    pub fn kind(&self) -> ValueKind {
        match self {
            ValueType::Number => ValueKind::Number,
            ValueType::String => ValueKind::Text,
            ValueType::Location => ValueKind::Location,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ValueType::Number => "number",
            ValueType::String => "string",
            ValueType::Location => "location",
        }
    }
}

/// One signal definition from the embedded schema.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignalDef {
    pub name: String,
    pub value_type: ValueType,
    #[serde(default)]
    pub unit: String,
    pub permissions: Vec<String>,
}

/// Immutable lookup table over all known signals.
#[derive(Debug)]
pub struct SignalCatalog {
    by_name: HashMap<String, SignalDef>,
}

impl SignalCatalog {
    /// Load the embedded schema. Called once during startup.
    pub fn load_embedded() -> anyhow::Result<Self> {
        Self::from_json(SIGNALS_JSON)
    }

    fn from_json(json: &str) -> anyhow::Result<Self> {
        let defs: Vec<SignalDef> =
            serde_json::from_str(json).context("Failed to parse signal schema")?;
        let mut by_name = HashMap::with_capacity(defs.len());
        for def in defs {
            if by_name.insert(def.name.clone(), def).is_some() {
                anyhow::bail!("Duplicate signal definition in schema");
            }
        }
        Ok(Self { by_name })
    }

    pub fn lookup(&self, name: &str) -> Option<&SignalDef> {
        self.by_name.get(name)
    }

    pub fn len(&self) -> usize {
        self.by_name.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_name.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn embedded_schema_loads() {
        let catalog = SignalCatalog::load_embedded().unwrap();
        assert!(catalog.len() > 20);
    }

    #[test]
    fn speed_is_a_number_with_nonlocation_permission() {
        let catalog = SignalCatalog::load_embedded().unwrap();
        let def = catalog.lookup("speed").unwrap();
        assert_eq!(def.value_type, ValueType::Number);
        assert_eq!(def.unit, "km/h");
        assert_eq!(def.permissions, vec![PERMISSION_NONLOCATION_HISTORY]);
    }

    #[test]
    fn coordinates_require_location_permission() {
        let catalog = SignalCatalog::load_embedded().unwrap();
        let def = catalog.lookup("currentLocationCoordinates").unwrap();
        assert_eq!(def.value_type, ValueType::Location);
        assert_eq!(def.value_type.kind(), ValueKind::Location);
        assert_eq!(def.permissions, vec![PERMISSION_LOCATION_HISTORY]);
    }

    #[test]
    fn unknown_signal_is_none() {
        let catalog = SignalCatalog::load_embedded().unwrap();
        assert!(catalog.lookup("flux_capacitor_charge").is_none());
    }

    #[test]
    fn duplicate_definitions_are_rejected() {
        let err = SignalCatalog::from_json(
            r#"[
                {"name": "speed", "valueType": "number", "permissions": []},
                {"name": "speed", "valueType": "string", "permissions": []}
            ]"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("Duplicate"));
    }
}
