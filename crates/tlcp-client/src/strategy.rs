//! Mode strategy: the item map of one subscription.
//!
//! Created on `SUBOK`/`SUBCMD` after checking the announced counts against
//! the configuration. Items are created lazily on the first event that
//! addresses them. The strategy also tracks the real max frequency, which
//! for two-level COMMAND subscriptions is the aggregate of the first level
//! and every nested subscription.

use std::collections::BTreeMap;
use std::sync::Arc;
use tlcp_core::codec::DeltaMap;
use tlcp_core::error::{ProtocolError, ProtocolResult};
use tlcp_core::types::{RealMaxFrequency, SubscriptionMode};
use tlcp_core::values::ValueTable;

use crate::config::SubscriptionConfig;
use crate::item::{Item, ItemContext};
use crate::key::CommandLayout;
use crate::subscription::{Output, SubscriptionEvent};
use crate::update::FieldNames;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Variant {
    Raw,
    Merge,
    Distinct,
    Command(CommandLayout),
    TwoLevelCommand(CommandLayout),
}

#[derive(Debug)]
pub(crate) struct ModeStrategy {
    variant: Variant,
    items: BTreeMap<usize, Item>,
    item_count: usize,
    item_names: Option<Vec<String>>,
    names: Arc<FieldNames>,
    snapshot_requested: bool,
    /// First-level frequency from `CONF`.
    frequency: Option<RealMaxFrequency>,
    /// Last value handed to the listener, starting from "unknown".
    published: Option<Option<RealMaxFrequency>>,
}

fn check_count(what: &'static str, configured: Option<usize>, got: usize) -> ProtocolResult<()> {
    match configured {
        Some(expected) if expected != got => Err(ProtocolError::CountMismatch { what, expected, got }),
        _ => Ok(()),
    }
}

impl ModeStrategy {
    /// Strategy for `SUBOK,<sub>,<items>,<fields>`.
    pub(crate) fn on_sub(config: &SubscriptionConfig, items: usize, fields: usize) -> ProtocolResult<Self> {
        let variant = match config.mode {
            SubscriptionMode::Raw => Variant::Raw,
            SubscriptionMode::Merge => Variant::Merge,
            SubscriptionMode::Distinct => Variant::Distinct,
            SubscriptionMode::Command => {
                return Err(ProtocolError::InvalidValue {
                    what: "acknowledgement for COMMAND subscription",
                    value: "SUBOK".to_string(),
                });
            }
        };
        Self::build(config, variant, items, fields)
    }

    /// Strategy for `SUBCMD,<sub>,<items>,<fields>,<key>,<command>`.
    pub(crate) fn on_sub_cmd(
        config: &SubscriptionConfig,
        items: usize,
        fields: usize,
        key_pos: usize,
        cmd_pos: usize,
    ) -> ProtocolResult<Self> {
        if config.mode != SubscriptionMode::Command {
            return Err(ProtocolError::InvalidValue {
                what: "acknowledgement for non-COMMAND subscription",
                value: "SUBCMD".to_string(),
            });
        }
        check_count("key position", config.field_position("key"), key_pos)?;
        check_count("command position", config.field_position("command"), cmd_pos)?;
        if key_pos == 0 || cmd_pos == 0 || key_pos > fields || cmd_pos > fields || key_pos == cmd_pos {
            return Err(ProtocolError::InvalidValue {
                what: "key/command positions",
                value: format!("{key_pos},{cmd_pos}"),
            });
        }
        let layout = CommandLayout {
            key_pos,
            cmd_pos,
            first_len: fields,
            two_level: config.second_level.is_some(),
        };
        let variant = if layout.two_level {
            Variant::TwoLevelCommand(layout)
        } else {
            Variant::Command(layout)
        };
        Self::build(config, variant, items, fields)
    }

    fn build(config: &SubscriptionConfig, variant: Variant, items: usize, fields: usize) -> ProtocolResult<Self> {
        check_count("items", config.items.as_ref().map(Vec::len), items)?;
        check_count("fields", config.fields.as_ref().map(Vec::len), fields)?;
        Ok(Self {
            variant,
            items: BTreeMap::new(),
            item_count: items,
            item_names: config.items.clone(),
            names: Arc::new(FieldNames {
                first_level: config.fields.clone(),
                second_level: config.second_level.as_ref().and_then(|s| s.fields.clone()),
            }),
            snapshot_requested: config.snapshot_requested(),
            frequency: None,
            published: Some(None),
        })
    }

    fn layout(&self) -> Option<CommandLayout> {
        match self.variant {
            Variant::Command(layout) | Variant::TwoLevelCommand(layout) => Some(layout),
            _ => None,
        }
    }

    fn item_name(&self, pos: usize) -> Option<&str> {
        self.item_names
            .as_ref()
            .and_then(|names| names.get(pos - 1))
            .map(String::as_str)
    }

    fn check_item(&self, pos: usize) -> ProtocolResult<()> {
        if pos == 0 || pos > self.item_count {
            return Err(ProtocolError::ItemOutOfRange {
                item: pos,
                items: self.item_count,
            });
        }
        Ok(())
    }

    fn new_item(variant: Variant, snapshot_requested: bool) -> Item {
        match variant {
            Variant::Raw => Item::raw(),
            Variant::Merge => Item::merge(snapshot_requested),
            Variant::Distinct => Item::distinct(snapshot_requested),
            Variant::Command(layout) | Variant::TwoLevelCommand(layout) => {
                Item::command(snapshot_requested, layout)
            }
        }
    }

    pub(crate) fn update(&mut self, pos: usize, deltas: &DeltaMap, out: &mut Vec<Output>) -> ProtocolResult<()> {
        self.check_item(pos)?;
        let ctx = ItemContext {
            pos,
            name: self
                .item_names
                .as_ref()
                .and_then(|names| names.get(pos - 1))
                .map(String::as_str),
            names: &self.names,
        };
        let (variant, snapshot) = (self.variant, self.snapshot_requested);
        let item = self
            .items
            .entry(pos)
            .or_insert_with(|| Self::new_item(variant, snapshot));
        item.update(&ctx, deltas, out)?;
        self.publish_frequency(out);
        Ok(())
    }

    pub(crate) fn end_of_snapshot(&mut self, pos: usize, out: &mut Vec<Output>) -> ProtocolResult<()> {
        self.check_item(pos)?;
        let (variant, snapshot) = (self.variant, self.snapshot_requested);
        self.items
            .entry(pos)
            .or_insert_with(|| Self::new_item(variant, snapshot))
            .end_of_snapshot();
        out.push(Output::Event(SubscriptionEvent::EndOfSnapshot {
            item_pos: pos,
            item_name: self.item_name(pos).map(str::to_string),
        }));
        Ok(())
    }

    pub(crate) fn clear_snapshot(&mut self, pos: usize, out: &mut Vec<Output>) -> ProtocolResult<()> {
        self.check_item(pos)?;
        let (variant, snapshot) = (self.variant, self.snapshot_requested);
        self.items
            .entry(pos)
            .or_insert_with(|| Self::new_item(variant, snapshot))
            .clear_snapshot(pos, out);
        out.push(Output::Event(SubscriptionEvent::ClearSnapshot {
            item_pos: pos,
            item_name: self.item_name(pos).map(str::to_string),
        }));
        self.publish_frequency(out);
        Ok(())
    }

    pub(crate) fn lost_updates(&mut self, pos: usize, lost: u64, out: &mut Vec<Output>) -> ProtocolResult<()> {
        self.check_item(pos)?;
        out.push(Output::Event(SubscriptionEvent::LostUpdates {
            item_pos: pos,
            item_name: self.item_name(pos).map(str::to_string),
            lost,
        }));
        Ok(())
    }

    /// Record the first-level frequency from `CONF`.
    pub(crate) fn on_conf(&mut self, frequency: RealMaxFrequency, out: &mut Vec<Output>) {
        self.frequency = Some(frequency);
        self.publish_frequency(out);
    }

    /// Current real max frequency; the aggregate for two-level COMMAND.
    pub(crate) fn real_max_frequency(&self) -> Option<RealMaxFrequency> {
        match self.variant {
            Variant::TwoLevelCommand(_) => RealMaxFrequency::aggregate(
                std::iter::once(self.frequency).chain(
                    self.items
                        .values()
                        .filter_map(Item::as_command)
                        .flat_map(|item| item.key_frequencies()),
                ),
            ),
            _ => self.frequency,
        }
    }

    fn publish_frequency(&mut self, out: &mut Vec<Output>) {
        let current = self.real_max_frequency();
        if self.published != Some(current) {
            self.published = Some(current);
            out.push(Output::Event(SubscriptionEvent::RealMaxFrequency(current)));
        }
    }

    pub(crate) fn second_level_update(
        &mut self,
        pos: usize,
        key: &str,
        nested: &ValueTable,
        out: &mut Vec<Output>,
    ) {
        let ctx = ItemContext {
            pos,
            name: self
                .item_names
                .as_ref()
                .and_then(|names| names.get(pos - 1))
                .map(String::as_str),
            names: &self.names,
        };
        if let Some(item) = self.items.get_mut(&pos).and_then(Item::as_command_mut) {
            item.second_level_update(&ctx, key, nested, out);
        }
    }

    pub(crate) fn second_level_failed(
        &mut self,
        pos: usize,
        key: &str,
        code: i32,
        message: &str,
        out: &mut Vec<Output>,
    ) {
        let reverted = self
            .items
            .get_mut(&pos)
            .and_then(Item::as_command_mut)
            .is_some_and(|item| item.second_level_failed(key));
        if reverted {
            out.push(Output::Event(SubscriptionEvent::SecondLevelError {
                code,
                message: message.to_string(),
                key: key.to_string(),
            }));
            self.publish_frequency(out);
        }
    }

    pub(crate) fn second_level_frequency(
        &mut self,
        pos: usize,
        key: &str,
        frequency: Option<RealMaxFrequency>,
        out: &mut Vec<Output>,
    ) {
        let recorded = self
            .items
            .get_mut(&pos)
            .and_then(Item::as_command_mut)
            .is_some_and(|item| item.set_key_frequency(key, frequency));
        if recorded {
            self.publish_frequency(out);
        }
    }

    /// The session ended: forget frequencies, release items if any exist.
    pub(crate) fn abort(&mut self, out: &mut Vec<Output>) {
        self.frequency = None;
        self.published = None;
        if !self.items.is_empty() {
            self.dispose(out);
        }
    }

    /// Release every item, closing nested subscriptions.
    pub(crate) fn dispose(&mut self, out: &mut Vec<Output>) {
        for (pos, item) in self.items.iter_mut() {
            item.dispose(*pos, out);
        }
        self.items.clear();
    }

    pub(crate) fn value(&self, pos: usize, field: usize) -> Option<String> {
        self.items.get(&pos)?.value(field)
    }

    pub(crate) fn command_value(&self, pos: usize, key: &str, field: usize) -> Option<String> {
        self.items.get(&pos)?.as_command()?.key_value(key, field)
    }

    pub(crate) fn key_position(&self) -> Option<usize> {
        self.layout().map(|l| l.key_pos)
    }

    pub(crate) fn command_position(&self) -> Option<usize> {
        self.layout().map(|l| l.cmd_pos)
    }
}
