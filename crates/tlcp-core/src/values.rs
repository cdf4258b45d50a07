//! Value Reconciler: folds a [`DeltaMap`] into the previous field values.
//!
//! Reconciliation is all-or-nothing: the new [`ValueTable`] is built aside
//! and only returned when every delta applied, so a failing update never
//! leaves an item half-updated.
//!
//! ```rust
//! use tlcp_core::codec::parse_fields;
//! use tlcp_core::values::reconcile;
//!
//! let first = reconcile(None, &parse_fields("10|EUR").unwrap()).unwrap();
//! assert_eq!(first.changed.len(), 2);
//!
//! let second = reconcile(Some(&first.values), &parse_fields("11|").unwrap()).unwrap();
//! assert_eq!(second.values.rendered(2).as_deref(), Some("EUR"));
//! assert!(second.changed.contains(&1) && !second.changed.contains(&2));
//! ```

use json_patch::Patch;
use serde_json::Value as JsonValue;
use std::borrow::Cow;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use crate::codec::{DeltaMap, FieldDelta};
use crate::diff::apply_diff;
use crate::error::{ProtocolError, ProtocolResult};

/// Current value of a non-null field.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    /// Plain string as received on the wire.
    Text(String),
    /// Parsed JSON, produced by applying a JSON patch.
    Json(JsonValue),
}

impl FieldValue {
    /// String form of the value, identical to the wire representation.
    ///
    /// JSON values render compactly, so a patched value compares equal to
    /// the same document sent as plain text.
    pub fn render(&self) -> Cow<'_, str> {
        match self {
            FieldValue::Text(s) => Cow::Borrowed(s),
            FieldValue::Json(v) => Cow::Owned(v.to_string()),
        }
    }

    /// The value as JSON, parsing plain strings on demand.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::InvalidJson`] when a plain string is not JSON.
    pub fn to_json(&self, field: usize) -> ProtocolResult<JsonValue> {
        match self {
            FieldValue::Text(s) => {
                serde_json::from_str(s).map_err(|source| ProtocolError::InvalidJson { field, source })
            }
            FieldValue::Json(v) => Ok(v.clone()),
        }
    }
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.render())
    }
}

impl From<&str> for FieldValue {
    fn from(s: &str) -> Self {
        FieldValue::Text(s.to_string())
    }
}

impl From<String> for FieldValue {
    fn from(s: String) -> Self {
        FieldValue::Text(s)
    }
}

/// Field position (1-based) to current value; `None` is a null value.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ValueTable(BTreeMap<usize, Option<FieldValue>>);

impl ValueTable {
    /// Empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether the table has an entry (possibly null) for `pos`.
    pub fn contains(&self, pos: usize) -> bool {
        self.0.contains_key(&pos)
    }

    /// Non-null value at `pos`.
    pub fn get(&self, pos: usize) -> Option<&FieldValue> {
        self.0.get(&pos).and_then(Option::as_ref)
    }

    /// Rendered value at `pos`; `None` for null or absent fields.
    pub fn rendered(&self, pos: usize) -> Option<String> {
        self.get(pos).map(|v| v.render().into_owned())
    }

    /// Set the value at `pos`.
    pub fn set(&mut self, pos: usize, value: Option<FieldValue>) {
        self.0.insert(pos, value);
    }

    /// Number of positions present.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether the table is empty.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Positions present, in ascending order.
    pub fn positions(&self) -> impl Iterator<Item = usize> + '_ {
        self.0.keys().copied()
    }

    /// Entries in position order.
    pub fn iter(&self) -> impl Iterator<Item = (usize, Option<&FieldValue>)> + '_ {
        self.0.iter().map(|(pos, v)| (*pos, v.as_ref()))
    }

    /// Positions of `self` whose rendering differs from `prev`.
    ///
    /// With no previous table every present position counts as changed.
    pub fn changed_from(&self, prev: Option<&ValueTable>) -> BTreeSet<usize> {
        match prev {
            None => self.positions().collect(),
            Some(prev) => self
                .positions()
                .filter(|pos| {
                    let old = prev.get(*pos).map(FieldValue::render);
                    let new = self.get(*pos).map(FieldValue::render);
                    old != new || prev.contains(*pos) != self.contains(*pos)
                })
                .collect(),
        }
    }
}

impl FromIterator<(usize, Option<FieldValue>)> for ValueTable {
    fn from_iter<T: IntoIterator<Item = (usize, Option<FieldValue>)>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// Outcome of a successful reconciliation.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Reconciled {
    /// Full new value table.
    pub values: ValueTable,
    /// Positions whose rendered value changed.
    pub changed: BTreeSet<usize>,
    /// Patches applied in this update, kept for listeners asking for deltas.
    pub json_patches: BTreeMap<usize, Patch>,
}

/// Fold `deltas` into `prev`.
///
/// # Errors
///
/// - [`ProtocolError::UnchangedWithoutPrior`] for an unchanged field with no
///   previous table.
/// - [`ProtocolError::PatchOnMissingValue`] / [`ProtocolError::PatchOnNull`]
///   for a patch or diff on a field with nothing to patch.
/// - [`ProtocolError::InvalidJson`], [`ProtocolError::PatchFailed`] and
///   [`ProtocolError::DiffDecode`] when the patch or diff does not apply.
pub fn reconcile(prev: Option<&ValueTable>, deltas: &DeltaMap) -> ProtocolResult<Reconciled> {
    let mut values = ValueTable::new();
    let mut json_patches = BTreeMap::new();

    for (&pos, delta) in deltas {
        let value = match delta {
            FieldDelta::Unchanged => {
                let prev = prev.ok_or(ProtocolError::UnchangedWithoutPrior { field: pos })?;
                prev.get(pos).cloned()
            }
            FieldDelta::Changed(v) => v.clone().map(FieldValue::Text),
            FieldDelta::JsonPatch(patch) => {
                let old = previous_value(prev, pos, "JSON patch")?;
                let mut json = old.to_json(pos)?;
                json_patch::patch(&mut json, patch).map_err(|e| ProtocolError::PatchFailed {
                    field: pos,
                    reason: e.to_string(),
                })?;
                json_patches.insert(pos, patch.clone());
                Some(FieldValue::Json(json))
            }
            FieldDelta::TextDiff(diff) => {
                let old = previous_value(prev, pos, "text diff")?;
                Some(FieldValue::Text(apply_diff(&old.render(), diff)?))
            }
        };
        values.set(pos, value);
    }

    let changed = values.changed_from(prev);
    tracing::trace!(fields = values.len(), changed = changed.len(), "reconciled update");
    Ok(Reconciled {
        values,
        changed,
        json_patches,
    })
}

fn previous_value<'a>(
    prev: Option<&'a ValueTable>,
    pos: usize,
    kind: &'static str,
) -> ProtocolResult<&'a FieldValue> {
    let prev = prev.ok_or(ProtocolError::PatchOnMissingValue { field: pos, kind })?;
    if !prev.contains(pos) {
        return Err(ProtocolError::PatchOnMissingValue { field: pos, kind });
    }
    prev.get(pos)
        .ok_or(ProtocolError::PatchOnNull { field: pos, kind })
}
