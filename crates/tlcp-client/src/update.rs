//! Item update objects handed to [`SubscriptionListener::on_item_update`].
//!
//! An update is an immutable snapshot of one item (or one COMMAND row) after
//! an event: all current values, the positions that changed, the snapshot
//! flag and the JSON patches that produced JSON values. Two-level updates
//! expose the nested fields after the first-level ones, in a single position
//! space offset by the first level's field count.
//!
//! [`SubscriptionListener::on_item_update`]: crate::listener::SubscriptionListener::on_item_update

use json_patch::Patch;
use serde_json::Value as JsonValue;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tlcp_core::ProtocolResult;
use tlcp_core::values::{FieldValue, ValueTable};

/// Field names known for a subscription, used for lookups by name.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FieldNames {
    /// First-level field list, when configured.
    pub first_level: Option<Vec<String>>,
    /// Second-level field list, when configured.
    pub second_level: Option<Vec<String>>,
}

impl FieldNames {
    /// Position of `name`, searching the first level before the second.
    ///
    /// Second-level names only resolve when `first_level_len` is known.
    pub fn position(&self, name: &str, first_level_len: Option<usize>) -> Option<usize> {
        let find = |list: &Option<Vec<String>>| {
            list.as_ref()
                .and_then(|l| l.iter().position(|f| f == name))
                .map(|i| i + 1)
        };
        find(&self.first_level).or_else(|| Some(first_level_len? + find(&self.second_level)?))
    }
}

/// Immutable view of an item after an update.
#[derive(Debug, Clone)]
pub struct ItemUpdate {
    pub(crate) item_pos: usize,
    pub(crate) item_name: Option<String>,
    pub(crate) snapshot: bool,
    pub(crate) values: ValueTable,
    pub(crate) changed: BTreeSet<usize>,
    pub(crate) json_patches: BTreeMap<usize, Patch>,
    pub(crate) names: Arc<FieldNames>,
    /// Number of first-level fields; set only for two-level updates.
    pub(crate) first_level_len: Option<usize>,
}

impl ItemUpdate {
    /// 1-based item position.
    pub fn item_pos(&self) -> usize {
        self.item_pos
    }

    /// Item name, when an item list was configured.
    pub fn item_name(&self) -> Option<&str> {
        self.item_name.as_deref()
    }

    /// Whether the update belongs to the snapshot.
    pub fn is_snapshot(&self) -> bool {
        self.snapshot
    }

    /// Whether this is a two-level update.
    pub fn is_two_level(&self) -> bool {
        self.first_level_len.is_some()
    }

    /// Number of first-level fields of a two-level update.
    pub fn first_level_len(&self) -> Option<usize> {
        self.first_level_len
    }

    /// Current value at `pos`; `None` for null or unknown fields.
    pub fn value(&self, pos: usize) -> Option<String> {
        self.values.rendered(pos)
    }

    /// Current value of the field named `name`.
    pub fn value_by_name(&self, name: &str) -> Option<String> {
        self.value(self.position_of(name)?)
    }

    /// Raw current value at `pos`, keeping JSON values parsed.
    pub fn field(&self, pos: usize) -> Option<&FieldValue> {
        self.values.get(pos)
    }

    /// Current value at `pos` as JSON. Values built by JSON patches are
    /// returned as they are, plain strings are parsed.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::InvalidJson`] when the value is not JSON.
    ///
    /// [`ProtocolError::InvalidJson`]: tlcp_core::ProtocolError::InvalidJson
    pub fn value_as_json(&self, pos: usize) -> ProtocolResult<Option<JsonValue>> {
        self.field(pos).map(|v| v.to_json(pos)).transpose()
    }

    /// JSON value of the field named `name`.
    ///
    /// # Errors
    ///
    /// See [`value_as_json`](Self::value_as_json).
    pub fn value_as_json_by_name(&self, name: &str) -> ProtocolResult<Option<JsonValue>> {
        match self.position_of(name) {
            Some(pos) => self.value_as_json(pos),
            None => Ok(None),
        }
    }

    /// Position of the field named `name`.
    pub fn position_of(&self, name: &str) -> Option<usize> {
        self.names.position(name, self.first_level_len)
    }

    /// Whether the field at `pos` changed with this update.
    pub fn is_value_changed(&self, pos: usize) -> bool {
        self.changed.contains(&pos)
    }

    /// Whether the field named `name` changed with this update.
    pub fn is_value_changed_by_name(&self, name: &str) -> bool {
        self.position_of(name)
            .is_some_and(|pos| self.is_value_changed(pos))
    }

    /// Changed positions, ascending.
    pub fn changed_positions(&self) -> impl Iterator<Item = usize> + '_ {
        self.changed.iter().copied()
    }

    /// Changed positions with their new values.
    pub fn changed_fields(&self) -> BTreeMap<usize, Option<String>> {
        self.changed
            .iter()
            .map(|pos| (*pos, self.value(*pos)))
            .collect()
    }

    /// All positions with their current values.
    pub fn fields(&self) -> BTreeMap<usize, Option<String>> {
        self.values
            .iter()
            .map(|(pos, v)| (pos, v.map(|v| v.render().into_owned())))
            .collect()
    }

    /// The JSON patch that produced the value at `pos` in this update.
    pub fn json_patch(&self, pos: usize) -> Option<&Patch> {
        self.json_patches.get(&pos)
    }

    /// The whole value table.
    pub fn values(&self) -> &ValueTable {
        &self.values
    }
}
