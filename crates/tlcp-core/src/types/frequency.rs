//! Frequency, snapshot and buffer settings as they appear on the wire.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{ProtocolError, ProtocolResult};

/// Max update frequency requested by the client (`LS_requested_max_frequency`).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RequestedMaxFrequency {
    /// No limit beyond the server's own.
    #[default]
    Unlimited,
    /// No limit and no filtering: every update must be delivered.
    Unfiltered,
    /// Updates per second.
    Limited(f64),
}

impl fmt::Display for RequestedMaxFrequency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequestedMaxFrequency::Unlimited => f.write_str("unlimited"),
            RequestedMaxFrequency::Unfiltered => f.write_str("unfiltered"),
            RequestedMaxFrequency::Limited(v) => write!(f, "{v}"),
        }
    }
}

/// Max update frequency the server actually applies, as reported by `CONF`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RealMaxFrequency {
    /// Updates per second.
    Limited(f64),
    /// Unlimited; dominates any finite value.
    Unlimited,
}

impl RealMaxFrequency {
    /// Parses the `CONF` frequency token (`unlimited` or a decimal number).
    pub fn parse(token: &str) -> ProtocolResult<Self> {
        if token == "unlimited" {
            return Ok(RealMaxFrequency::Unlimited);
        }
        token
            .parse::<f64>()
            .ok()
            .filter(|v| v.is_finite() && *v >= 0.0)
            .map(RealMaxFrequency::Limited)
            .ok_or_else(|| ProtocolError::InvalidValue {
                what: "real max frequency",
                value: token.to_string(),
            })
    }

    /// Pointwise maximum; `Unlimited` wins over any finite value.
    #[must_use]
    pub fn max(self, other: Self) -> Self {
        match (self, other) {
            (RealMaxFrequency::Unlimited, _) | (_, RealMaxFrequency::Unlimited) => {
                RealMaxFrequency::Unlimited
            }
            (RealMaxFrequency::Limited(a), RealMaxFrequency::Limited(b)) => {
                RealMaxFrequency::Limited(a.max(b))
            }
        }
    }

    /// Folds optional frequencies; unknown values do not constrain the result.
    pub fn aggregate<I>(values: I) -> Option<Self>
    where
        I: IntoIterator<Item = Option<Self>>,
    {
        values
            .into_iter()
            .flatten()
            .reduce(RealMaxFrequency::max)
    }
}

impl fmt::Display for RealMaxFrequency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RealMaxFrequency::Unlimited => f.write_str("unlimited"),
            RealMaxFrequency::Limited(v) => write!(f, "{v}"),
        }
    }
}

/// Snapshot request policy (`LS_snapshot`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SnapshotRequest {
    /// No snapshot.
    #[default]
    No,
    /// Full snapshot.
    Yes,
    /// At most this many snapshot events (DISTINCT only).
    Length(u32),
}

impl SnapshotRequest {
    /// Whether any snapshot was requested.
    pub const fn is_requested(&self) -> bool {
        !matches!(self, SnapshotRequest::No)
    }

    /// Wire value of `LS_snapshot`.
    pub fn wire_value(&self) -> String {
        match self {
            SnapshotRequest::No => "false".to_string(),
            SnapshotRequest::Yes => "true".to_string(),
            SnapshotRequest::Length(n) => n.to_string(),
        }
    }
}

/// Requested buffer size (`LS_requested_buffer_size`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BufferSize {
    /// Let the server keep as many updates as needed.
    Unlimited,
    /// Keep at most this many updates per item.
    Limited(u32),
}

impl fmt::Display for BufferSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BufferSize::Unlimited => f.write_str("unlimited"),
            BufferSize::Limited(n) => write!(f, "{n}"),
        }
    }
}
