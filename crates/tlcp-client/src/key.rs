//! Key state machine: one row of a COMMAND item.
//!
//! ```text
//! 1-level:  Fresh ──ADD/UPDATE──▶ Live ──DELETE──▶ Deleted
//!             └──────DELETE (light delete)───────────▲
//!
//! 2-level:  Fresh ──ADD──▶ AwaitingSecondLevel ──nested update──▶ SecondLevelActive
//!                              │  nested error                       │ nested error
//!                              └──────────────▶ Live ◀───────────────┘
//!           any live state ──DELETE──▶ (close nested) ──▶ Deleted
//! ```
//!
//! The key never talks to the nested subscription directly: it pushes
//! [`Output::OpenSecondLevel`] / [`Output::CloseSecondLevel`] and the engine
//! resolves them by `(item, key)`.

use std::collections::BTreeSet;
use tlcp_core::types::RealMaxFrequency;
use tlcp_core::values::{FieldValue, ValueTable};

use crate::config::is_valid_item_name;
use crate::subscription::{Output, SubscriptionEvent};

/// Error code reported when a key cannot be used as a nested item name.
pub const ILLEGAL_SECOND_LEVEL_KEY: i32 = 14;

/// Value of the `command` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Command {
    Add,
    Update,
    Delete,
}

impl Command {
    pub(crate) fn parse(token: &str) -> Option<Self> {
        match token {
            "ADD" => Some(Command::Add),
            "UPDATE" => Some(Command::Update),
            "DELETE" => Some(Command::Delete),
            _ => None,
        }
    }

    pub(crate) const fn as_str(&self) -> &'static str {
        match self {
            Command::Add => "ADD",
            Command::Update => "UPDATE",
            Command::Delete => "DELETE",
        }
    }
}

/// Field layout of a COMMAND subscription, known after `SUBCMD`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct CommandLayout {
    pub key_pos: usize,
    pub cmd_pos: usize,
    /// Number of first-level fields.
    pub first_len: usize,
    pub two_level: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum KeyState {
    Fresh,
    Live,
    AwaitingSecondLevel,
    SecondLevelActive,
    Deleted,
}

impl KeyState {
    fn has_nested(self) -> bool {
        matches!(self, KeyState::AwaitingSecondLevel | KeyState::SecondLevelActive)
    }
}

/// Row emitted by a key transition.
#[derive(Debug)]
pub(crate) struct KeyChange {
    pub row: ValueTable,
    pub changed: BTreeSet<usize>,
    /// The key left the item with this change.
    pub removed: bool,
}

#[derive(Debug)]
pub(crate) struct Key {
    name: String,
    state: KeyState,
    first: ValueTable,
    second: Option<ValueTable>,
    exposed: Option<ValueTable>,
    frequency: Option<RealMaxFrequency>,
}

impl Key {
    pub(crate) fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            state: KeyState::Fresh,
            first: ValueTable::new(),
            second: None,
            exposed: None,
            frequency: None,
        }
    }

    #[cfg(test)]
    pub(crate) fn state(&self) -> KeyState {
        self.state
    }

    /// Real max frequency of the nested subscription, if known.
    pub(crate) fn frequency(&self) -> Option<RealMaxFrequency> {
        self.frequency
    }

    /// Current exposed value at `pos`.
    pub(crate) fn value(&self, pos: usize) -> Option<String> {
        self.exposed.as_ref()?.rendered(pos)
    }

    /// Apply a first-level row for this key.
    pub(crate) fn apply(
        &mut self,
        row: &ValueTable,
        command: Command,
        item_pos: usize,
        layout: &CommandLayout,
        out: &mut Vec<Output>,
    ) -> Option<KeyChange> {
        match (self.state, command) {
            (KeyState::Deleted, _) => None,
            (KeyState::Fresh, Command::Delete) => {
                let light = row
                    .positions()
                    .map(|pos| (pos, self.key_or_command(pos, layout, Command::Delete)))
                    .collect();
                self.state = KeyState::Deleted;
                Some(self.expose(light, true))
            }
            (KeyState::Fresh, _) => {
                self.first = with_command(row, layout.cmd_pos, Command::Add);
                self.state = KeyState::Live;
                if layout.two_level {
                    if is_valid_item_name(&self.name) {
                        self.state = KeyState::AwaitingSecondLevel;
                        out.push(Output::OpenSecondLevel {
                            item: item_pos,
                            key: self.name.clone(),
                        });
                    } else {
                        out.push(Output::Event(SubscriptionEvent::SecondLevelError {
                            code: ILLEGAL_SECOND_LEVEL_KEY,
                            message: "Illegal second-level item name".to_string(),
                            key: self.name.clone(),
                        }));
                    }
                }
                let row = self.combined(layout);
                Some(self.expose(row, false))
            }
            (_, Command::Delete) => {
                if self.state.has_nested() {
                    out.push(Output::CloseSecondLevel {
                        item: item_pos,
                        key: self.name.clone(),
                    });
                }
                let mut positions: BTreeSet<usize> = row.positions().collect();
                if let Some(exposed) = &self.exposed {
                    positions.extend(exposed.positions());
                }
                let deleted = positions
                    .into_iter()
                    .map(|pos| (pos, self.key_or_command(pos, layout, Command::Delete)))
                    .collect();
                self.state = KeyState::Deleted;
                self.second = None;
                self.frequency = None;
                Some(self.expose(deleted, true))
            }
            (_, _) => {
                self.first = with_command(row, layout.cmd_pos, Command::Update);
                let row = self.combined(layout);
                Some(self.expose(row, false))
            }
        }
    }

    /// Merge a row of the nested subscription.
    pub(crate) fn second_level_update(
        &mut self,
        nested: &ValueTable,
        layout: &CommandLayout,
    ) -> Option<KeyChange> {
        if !self.state.has_nested() {
            return None;
        }
        self.second = Some(nested.clone());
        self.state = KeyState::SecondLevelActive;
        self.first = with_command(&self.first, layout.cmd_pos, Command::Update);
        let row = self.combined(layout);
        Some(self.expose(row, false))
    }

    /// The nested subscription failed: keep tracking the first level only.
    pub(crate) fn second_level_failed(&mut self) -> bool {
        if !self.state.has_nested() {
            return false;
        }
        self.state = KeyState::Live;
        self.second = None;
        self.frequency = None;
        true
    }

    /// Record the nested subscription's real max frequency.
    pub(crate) fn set_frequency(&mut self, frequency: Option<RealMaxFrequency>) -> bool {
        if !self.state.has_nested() {
            return false;
        }
        self.frequency = frequency;
        true
    }

    /// Drop the key without emitting an update.
    pub(crate) fn dispose(&mut self, item_pos: usize, out: &mut Vec<Output>) {
        if self.state.has_nested() {
            out.push(Output::CloseSecondLevel {
                item: item_pos,
                key: self.name.clone(),
            });
        }
        self.state = KeyState::Deleted;
        self.frequency = None;
    }

    fn key_or_command(&self, pos: usize, layout: &CommandLayout, command: Command) -> Option<FieldValue> {
        if pos == layout.key_pos {
            Some(FieldValue::Text(self.name.clone()))
        } else if pos == layout.cmd_pos {
            Some(FieldValue::Text(command.as_str().to_string()))
        } else {
            None
        }
    }

    fn combined(&self, layout: &CommandLayout) -> ValueTable {
        let mut row = self.first.clone();
        if let Some(second) = &self.second {
            for (pos, value) in second.iter() {
                row.set(layout.first_len + pos, value.cloned());
            }
        }
        row
    }

    fn expose(&mut self, row: ValueTable, removed: bool) -> KeyChange {
        let changed = row.changed_from(self.exposed.as_ref());
        self.exposed = Some(row.clone());
        KeyChange {
            row,
            changed,
            removed,
        }
    }
}

fn with_command(row: &ValueTable, cmd_pos: usize, command: Command) -> ValueTable {
    let mut row = row.clone();
    row.set(cmd_pos, Some(FieldValue::Text(command.as_str().to_string())));
    row
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    const ONE_LEVEL: CommandLayout = CommandLayout {
        key_pos: 1,
        cmd_pos: 2,
        first_len: 3,
        two_level: false,
    };

    const TWO_LEVEL: CommandLayout = CommandLayout {
        two_level: true,
        ..ONE_LEVEL
    };

    fn row(key: &str, cmd: &str, value: Option<&str>) -> ValueTable {
        [
            (1, Some(FieldValue::from(key))),
            (2, Some(FieldValue::from(cmd))),
            (3, value.map(FieldValue::from)),
        ]
        .into_iter()
        .collect()
    }

    #[test]
    fn first_sighting_becomes_add_then_update() {
        let mut key = Key::new("k1");
        let mut out = vec![];
        let first = key.apply(&row("k1", "UPDATE", Some("10")), Command::Update, 1, &ONE_LEVEL, &mut out).unwrap();
        assert_eq!(first.row.rendered(2).as_deref(), Some("ADD"));
        assert_eq!(first.changed, BTreeSet::from([1, 2, 3]));
        assert_eq!(key.state(), KeyState::Live);

        let second = key.apply(&row("k1", "ADD", Some("11")), Command::Add, 1, &ONE_LEVEL, &mut out).unwrap();
        assert_eq!(second.row.rendered(2).as_deref(), Some("UPDATE"));
        assert_eq!(second.changed, BTreeSet::from([2, 3]));
        assert!(out.is_empty());
    }

    #[test]
    fn delete_on_first_sighting_is_light() {
        let mut key = Key::new("k1");
        let mut out = vec![];
        let change = key.apply(&row("k1", "DELETE", Some("10")), Command::Delete, 1, &ONE_LEVEL, &mut out).unwrap();
        assert!(change.removed);
        assert_eq!(change.row.rendered(1).as_deref(), Some("k1"));
        assert_eq!(change.row.rendered(2).as_deref(), Some("DELETE"));
        assert_eq!(change.row.get(3), None);
        assert_eq!(key.state(), KeyState::Deleted);
    }

    #[test]
    fn delete_nulls_everything_but_key_and_command() {
        let mut key = Key::new("k1");
        let mut out = vec![];
        key.apply(&row("k1", "ADD", Some("10")), Command::Add, 1, &ONE_LEVEL, &mut out);
        let change = key.apply(&row("k1", "DELETE", Some("10")), Command::Delete, 1, &ONE_LEVEL, &mut out).unwrap();
        assert!(change.removed);
        assert_eq!(change.row.get(3), None);
        assert!(change.changed.contains(&3));
        assert!(key.apply(&row("k1", "ADD", None), Command::Add, 1, &ONE_LEVEL, &mut out).is_none());
    }

    #[test]
    fn two_level_key_opens_nested_subscription() {
        let mut key = Key::new("k1");
        let mut out = vec![];
        key.apply(&row("k1", "ADD", Some("10")), Command::Add, 2, &TWO_LEVEL, &mut out);
        assert_eq!(key.state(), KeyState::AwaitingSecondLevel);
        assert_matches!(&out[..], [Output::OpenSecondLevel { item: 2, key }] if key == "k1");

        let nested: ValueTable = [(1, Some(FieldValue::from("9.5")))].into_iter().collect();
        let change = key.second_level_update(&nested, &TWO_LEVEL).unwrap();
        assert_eq!(key.state(), KeyState::SecondLevelActive);
        assert_eq!(change.row.rendered(4).as_deref(), Some("9.5"));
        assert_eq!(change.changed, BTreeSet::from([2, 4]));
    }

    #[test]
    fn illegal_key_reports_second_level_error() {
        let mut key = Key::new("42");
        let mut out = vec![];
        key.apply(&row("42", "ADD", None), Command::Add, 1, &TWO_LEVEL, &mut out);
        assert_eq!(key.state(), KeyState::Live);
        assert_matches!(
            &out[..],
            [Output::Event(SubscriptionEvent::SecondLevelError { code: ILLEGAL_SECOND_LEVEL_KEY, .. })]
        );
    }

    #[test]
    fn delete_with_nested_closes_it_first() {
        let mut key = Key::new("k1");
        let mut out = vec![];
        key.apply(&row("k1", "ADD", Some("1")), Command::Add, 1, &TWO_LEVEL, &mut out);
        let nested: ValueTable = [(1, Some(FieldValue::from("x")))].into_iter().collect();
        key.second_level_update(&nested, &TWO_LEVEL);
        out.clear();

        let change = key.apply(&row("k1", "DELETE", Some("1")), Command::Delete, 1, &TWO_LEVEL, &mut out).unwrap();
        assert_matches!(&out[..], [Output::CloseSecondLevel { .. }]);
        assert!(change.row.contains(4));
        assert_eq!(change.row.get(4), None);
        assert!(change.changed.contains(&4));
    }

    #[test]
    fn nested_failure_reverts_to_first_level() {
        let mut key = Key::new("k1");
        let mut out = vec![];
        key.apply(&row("k1", "ADD", None), Command::Add, 1, &TWO_LEVEL, &mut out);
        assert!(key.set_frequency(Some(RealMaxFrequency::Unlimited)));
        assert!(key.second_level_failed());
        assert_eq!(key.state(), KeyState::Live);
        assert_eq!(key.frequency(), None);
        assert!(!key.second_level_failed());
    }
}
