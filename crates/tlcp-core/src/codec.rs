//! Field Update Codec: turns a `U` line into a per-field delta map.
//!
//! # Token grammar
//!
//! | Token        | Delta                                   |
//! |--------------|-----------------------------------------|
//! | *(empty)*    | unchanged                               |
//! | `#`          | changed to null                         |
//! | `$`          | changed to the empty string             |
//! | `^N`         | N consecutive unchanged fields (N ≥ 1)  |
//! | `^P<patch>`  | JSON patch (RFC 6902) on the old value  |
//! | `^T<diff>`   | textual diff on the old value           |
//! | anything else| percent-decoded new value               |
//!
//! ```rust
//! use tlcp_core::codec::{parse_update, FieldDelta};
//!
//! let update = parse_update("U,3,1,^2|#|EUR%7CUSD").unwrap();
//! assert_eq!(update.sub_id.get(), 3);
//! assert_eq!(update.deltas[&1], FieldDelta::Unchanged);
//! assert_eq!(update.deltas[&2], FieldDelta::Unchanged);
//! assert_eq!(update.deltas[&3], FieldDelta::Changed(None));
//! assert_eq!(update.deltas[&4], FieldDelta::Changed(Some("EUR|USD".into())));
//! ```

use json_patch::Patch;
use std::collections::BTreeMap;

use crate::error::{ProtocolError, ProtocolResult};
use crate::types::SubscriptionId;

/// Change of a single field carried by an update line.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldDelta {
    /// Same value as in the previous update.
    Unchanged,
    /// New value; `None` means null.
    Changed(Option<String>),
    /// JSON patch to apply to the previous value.
    JsonPatch(Patch),
    /// Textual diff to apply to the previous value.
    TextDiff(String),
}

/// Field position (1-based) to delta.
pub type DeltaMap = BTreeMap<usize, FieldDelta>;

/// A decoded `U` line.
#[derive(Debug, Clone, PartialEq)]
pub struct UpdateLine {
    /// Subscription the update belongs to.
    pub sub_id: SubscriptionId,
    /// 1-based item index.
    pub item: usize,
    /// One delta per field, keyed by 1-based position.
    pub deltas: DeltaMap,
}

/// Parse a full `U,<subId>,<item>,<fields>` line.
///
/// # Errors
///
/// Returns [`ProtocolError::MalformedLine`] when the prefix, the ids or a
/// token do not follow the grammar.
pub fn parse_update(line: &str) -> ProtocolResult<UpdateLine> {
    let rest = line
        .strip_prefix("U,")
        .ok_or_else(|| ProtocolError::malformed(line, "missing 'U,' prefix"))?;
    let mut parts = rest.splitn(3, ',');
    let sub_id = parts
        .next()
        .and_then(|s| s.parse::<SubscriptionId>().ok())
        .ok_or_else(|| ProtocolError::malformed(line, "invalid subscription id"))?;
    let item = parts
        .next()
        .and_then(|s| s.parse::<usize>().ok())
        .filter(|i| *i >= 1)
        .ok_or_else(|| ProtocolError::malformed(line, "invalid item index"))?;
    let fields = parts
        .next()
        .ok_or_else(|| ProtocolError::malformed(line, "missing field list"))?;
    let deltas = parse_fields(fields).map_err(|err| match err {
        ProtocolError::InvalidValue { what, value } => {
            ProtocolError::malformed(line, format!("invalid {what} '{value}'"))
        }
        other => other,
    })?;
    Ok(UpdateLine {
        sub_id,
        item,
        deltas,
    })
}

/// Parse the `|`-separated field section of an update line.
///
/// # Errors
///
/// Returns [`ProtocolError::InvalidValue`] for a bad run length or escape,
/// and [`ProtocolError::InvalidJson`] for an unparsable JSON patch.
pub fn parse_fields(fields: &str) -> ProtocolResult<DeltaMap> {
    let mut deltas = DeltaMap::new();
    let mut position = 1;
    for token in fields.split('|') {
        match token {
            "" => {
                deltas.insert(position, FieldDelta::Unchanged);
                position += 1;
            }
            "#" => {
                deltas.insert(position, FieldDelta::Changed(None));
                position += 1;
            }
            "$" => {
                deltas.insert(position, FieldDelta::Changed(Some(String::new())));
                position += 1;
            }
            _ => {
                if let Some(escaped) = token.strip_prefix('^') {
                    if let Some(patch) = escaped.strip_prefix('P') {
                        let json = percent_decode(patch)?;
                        let patch: Patch = serde_json::from_str(&json).map_err(|source| {
                            ProtocolError::InvalidJson {
                                field: position,
                                source,
                            }
                        })?;
                        deltas.insert(position, FieldDelta::JsonPatch(patch));
                        position += 1;
                    } else if let Some(diff) = escaped.strip_prefix('T') {
                        deltas.insert(position, FieldDelta::TextDiff(percent_decode(diff)?));
                        position += 1;
                    } else {
                        let run = escaped
                            .parse::<usize>()
                            .ok()
                            .filter(|n| *n >= 1)
                            .ok_or_else(|| ProtocolError::InvalidValue {
                                what: "unchanged run length",
                                value: token.to_string(),
                            })?;
                        for _ in 0..run {
                            deltas.insert(position, FieldDelta::Unchanged);
                            position += 1;
                        }
                    }
                } else {
                    deltas.insert(position, FieldDelta::Changed(Some(percent_decode(token)?)));
                    position += 1;
                }
            }
        }
    }
    Ok(deltas)
}

/// Percent-decode a single wire token.
///
/// # Errors
///
/// Returns [`ProtocolError::InvalidValue`] if the decoded bytes are not UTF-8.
pub fn percent_decode(token: &str) -> ProtocolResult<String> {
    urlencoding::decode(token)
        .map(|s| s.into_owned())
        .map_err(|_| ProtocolError::InvalidValue {
            what: "percent-encoded value",
            value: token.to_string(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn plain_values_are_decoded() {
        let update = parse_update("U,1,2,a|b%20c|%C3%A8").unwrap();
        assert_eq!(update.item, 2);
        assert_eq!(update.deltas.len(), 3);
        assert_eq!(update.deltas[&2], FieldDelta::Changed(Some("b c".into())));
        assert_eq!(update.deltas[&3], FieldDelta::Changed(Some("è".into())));
    }

    #[test]
    fn null_and_empty_markers() {
        let update = parse_update("U,1,1,#|$|").unwrap();
        assert_eq!(update.deltas[&1], FieldDelta::Changed(None));
        assert_eq!(update.deltas[&2], FieldDelta::Changed(Some(String::new())));
        assert_eq!(update.deltas[&3], FieldDelta::Unchanged);
    }

    #[test]
    fn runs_advance_positions() {
        let update = parse_update("U,1,1,x|^3|y").unwrap();
        assert_eq!(update.deltas.len(), 5);
        assert_eq!(update.deltas[&1], FieldDelta::Changed(Some("x".into())));
        for pos in 2..=4 {
            assert_eq!(update.deltas[&pos], FieldDelta::Unchanged);
        }
        assert_eq!(update.deltas[&5], FieldDelta::Changed(Some("y".into())));
    }

    #[test]
    fn run_equals_empty_tokens() {
        let with_run = parse_update("U,1,1,^4|z").unwrap();
        let with_empties = parse_update("U,1,1,||||z").unwrap();
        assert_eq!(with_run.deltas, with_empties.deltas);
    }

    #[test]
    fn json_patch_token() {
        let update =
            parse_update("U,1,1,^P%5B%7B%22op%22%3A%22replace%22%2C%22path%22%3A%22%2Fa%22%2C%22value%22%3A2%7D%5D")
                .unwrap();
        assert_matches!(&update.deltas[&1], FieldDelta::JsonPatch(p) if p.0.len() == 1);
    }

    #[test]
    fn diff_token() {
        let update = parse_update("U,1,1,^Tdc%7CYbc").unwrap();
        assert_eq!(update.deltas[&1], FieldDelta::TextDiff("dc|Ybc".into()));
    }

    #[test]
    fn malformed_lines() {
        assert_matches!(parse_update("X,1,1,a"), Err(ProtocolError::MalformedLine { .. }));
        assert_matches!(parse_update("U,a,1,a"), Err(ProtocolError::MalformedLine { .. }));
        assert_matches!(parse_update("U,1,0,a"), Err(ProtocolError::MalformedLine { .. }));
        assert_matches!(parse_update("U,1,1"), Err(ProtocolError::MalformedLine { .. }));
        assert_matches!(parse_update("U,1,1,^0"), Err(ProtocolError::MalformedLine { .. }));
        assert_matches!(parse_update("U,1,1,^x"), Err(ProtocolError::MalformedLine { .. }));
        assert_matches!(parse_update("U,1,1,^P[oops"), Err(ProtocolError::InvalidJson { field: 1, .. }));
    }
}
