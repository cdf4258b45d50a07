use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::ProtocolError;

/// Subscription mode (`LS_mode`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SubscriptionMode {
    /// Every update is delivered as is, no snapshot.
    Raw,
    /// Each item holds one row; the snapshot is the first update.
    Merge,
    /// Each item is a stream of events; the snapshot is a list of past events.
    Distinct,
    /// Each item is a table of rows addressed by the `key` field.
    Command,
}

impl SubscriptionMode {
    /// Wire name of the mode.
    pub const fn as_str(&self) -> &'static str {
        match self {
            SubscriptionMode::Raw => "RAW",
            SubscriptionMode::Merge => "MERGE",
            SubscriptionMode::Distinct => "DISTINCT",
            SubscriptionMode::Command => "COMMAND",
        }
    }
}

impl fmt::Display for SubscriptionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SubscriptionMode {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "RAW" => Ok(SubscriptionMode::Raw),
            "MERGE" => Ok(SubscriptionMode::Merge),
            "DISTINCT" => Ok(SubscriptionMode::Distinct),
            "COMMAND" => Ok(SubscriptionMode::Command),
            other => Err(ProtocolError::InvalidValue {
                what: "subscription mode",
                value: other.to_string(),
            }),
        }
    }
}
