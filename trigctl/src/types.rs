//! Common type definitions shared across the crate.
//!
//! - Type aliases for entity IDs ([`WebhookId`], [`FireLogId`])
//! - The [`Service`] discriminator selecting which bus stream a webhook
//!   listens on
//! - Developer-license address validation
//! - [`abbrev_uuid`] for compact IDs in logs

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

// Type aliases for IDs
pub type WebhookId = Uuid;
pub type FireLogId = Uuid;

/// Stable string identifier of a vehicle asset (an ERC-721 DID).
pub type AssetDid = String;

/// Which telemetry stream a webhook listens on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Service {
    /// Continuous time-series samples (speed, battery level, location, ...).
    Signals,
    /// Discrete occurrences (harsh braking, trips, ...).
    Events,
}

impl Service {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Signals => "signals",
            Self::Events => "events",
        }
    }
}

impl fmt::Display for Service {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Service {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "signals" => Ok(Self::Signals),
            "events" => Ok(Self::Events),
            _ => Err(format!("Unknown service: {s}")),
        }
    }
}

/// Check that a developer license looks like a 20-byte hex address
/// (`0x` followed by 40 hex digits).
pub fn is_developer_license(s: &str) -> bool {
    s.len() == 42 && s.starts_with("0x") && s[2..].chars().all(|c| c.is_ascii_hexdigit())
}

/// Abbreviate a UUID to its first 8 characters for more readable logs and traces
/// Example: "550e8400-e29b-41d4-a716-446655440000" -> "550e8400"
pub fn abbrev_uuid(uuid: &Uuid) -> String {
    uuid.to_string().chars().take(8).collect()
}
