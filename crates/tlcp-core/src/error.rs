//! Error types for wire decoding and value reconciliation.
//!
//! Every error here is fatal to the single inbound line that produced it and
//! to nothing else: the caller that owns message framing reports it and moves
//! on to the next line, the managers stay as they were.
//!
//! # Example
//!
//! ```rust
//! use tlcp_core::codec::parse_update;
//! use tlcp_core::error::ProtocolError;
//!
//! match parse_update("U,1,x,a") {
//!     Err(ProtocolError::MalformedLine { reason, .. }) => {
//!         tracing::warn!(%reason, "dropping update");
//!     }
//!     other => panic!("unexpected: {other:?}"),
//! }
//! ```

use thiserror::Error;

/// Errors raised while decoding server lines or folding deltas into values.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum ProtocolError {
    /// The line does not follow the TLCP grammar.
    #[error("malformed line '{line}': {reason}")]
    MalformedLine {
        /// The offending line (truncated by the caller if needed).
        line: String,
        /// What part of the grammar was violated.
        reason: String,
    },

    /// A single token holds a value that cannot be interpreted.
    #[error("invalid {what}: '{value}'")]
    InvalidValue {
        /// Which kind of value was expected.
        what: &'static str,
        /// The token as received.
        value: String,
    },

    /// The textual diff could not be applied to its base string.
    #[error("diff decode failed at offset {offset}: {reason}")]
    DiffDecode {
        /// Character offset in the diff string.
        offset: usize,
        /// Reason for the failure.
        reason: String,
    },

    /// An `unchanged` delta arrived for an item that never received an update.
    #[error("field {field} marked unchanged but the item has no previous values")]
    UnchangedWithoutPrior {
        /// 1-based field position.
        field: usize,
    },

    /// A patch or diff arrived for a field with no previous value.
    #[error("field {field} received a {kind} but has no previous value")]
    PatchOnMissingValue {
        /// 1-based field position.
        field: usize,
        /// `"JSON patch"` or `"text diff"`.
        kind: &'static str,
    },

    /// A patch or diff arrived for a field whose previous value is null.
    #[error("field {field} received a {kind} but its previous value is null")]
    PatchOnNull {
        /// 1-based field position.
        field: usize,
        /// `"JSON patch"` or `"text diff"`.
        kind: &'static str,
    },

    /// The previous value, or the patch document, is not valid JSON.
    #[error("field {field} is not valid JSON: {source}")]
    InvalidJson {
        /// 1-based field position (0 when not tied to a field).
        field: usize,
        /// The underlying `serde_json` error.
        #[source]
        source: serde_json::Error,
    },

    /// The JSON patch did not apply to the previous value.
    #[error("JSON patch failed on field {field}: {reason}")]
    PatchFailed {
        /// 1-based field position.
        field: usize,
        /// Reason reported by the patch engine.
        reason: String,
    },

    /// A count announced by the server disagrees with the configuration.
    #[error("{what} mismatch: configured {expected}, server reported {got}")]
    CountMismatch {
        /// Which count (`"items"`, `"fields"`...).
        what: &'static str,
        /// Configured count.
        expected: usize,
        /// Count received from the server.
        got: usize,
    },

    /// An event addressed an item index outside the subscription.
    #[error("item {item} out of range 1..={items}")]
    ItemOutOfRange {
        /// 1-based item index as received.
        item: usize,
        /// Number of items of the subscription.
        items: usize,
    },
}

impl ProtocolError {
    /// Create a malformed-line error.
    #[must_use]
    pub fn malformed(line: &str, reason: impl Into<String>) -> Self {
        const MAX_LINE: usize = 200;
        let line = match line.char_indices().nth(MAX_LINE) {
            Some((cut, _)) => format!("{}...", &line[..cut]),
            None => line.to_string(),
        };
        Self::MalformedLine {
            line,
            reason: reason.into(),
        }
    }

    /// Whether the failure came from folding a delta rather than parsing.
    #[must_use]
    pub fn is_reconciliation(&self) -> bool {
        matches!(
            self,
            Self::UnchangedWithoutPrior { .. }
                | Self::PatchOnMissingValue { .. }
                | Self::PatchOnNull { .. }
                | Self::InvalidJson { .. }
                | Self::PatchFailed { .. }
                | Self::DiffDecode { .. }
        )
    }
}

/// Result type alias for decoding and reconciliation.
pub type ProtocolResult<T> = Result<T, ProtocolError>;
