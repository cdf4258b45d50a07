//! Item state machines, one variant per subscription mode.
//!
//! Every variant reconciles the update before touching its state, so a
//! failing update leaves the item exactly as it was.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tlcp_core::codec::DeltaMap;
use tlcp_core::error::{ProtocolError, ProtocolResult};
use tlcp_core::types::RealMaxFrequency;
use tlcp_core::values::{Reconciled, ValueTable, reconcile};

use crate::key::{Command, CommandLayout, Key};
use crate::subscription::{Output, SubscriptionEvent};
use crate::update::{FieldNames, ItemUpdate};

/// What an item needs to know about its position in the subscription.
pub(crate) struct ItemContext<'a> {
    pub pos: usize,
    pub name: Option<&'a str>,
    pub names: &'a Arc<FieldNames>,
}

impl ItemContext<'_> {
    fn update(&self, snapshot: bool, r: Reconciled, first_level_len: Option<usize>) -> ItemUpdate {
        ItemUpdate {
            item_pos: self.pos,
            item_name: self.name.map(str::to_string),
            snapshot,
            values: r.values,
            changed: r.changed,
            json_patches: r.json_patches,
            names: Arc::clone(self.names),
            first_level_len,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RawState {
    Unset,
    Set,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum MergeState {
    Unset,
    SnapshotReceived,
    Live,
}

/// Snapshot phase shared by DISTINCT and COMMAND items: two cycles,
/// {pre-snapshot, snapshot-active} and {post-snapshot, post-snapshot-active},
/// flipped by end-of-snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SnapshotPhase {
    PreSnapshot,
    SnapshotActive,
    PostSnapshot,
    PostSnapshotActive,
}

impl SnapshotPhase {
    fn initial(snapshot_requested: bool) -> Self {
        if snapshot_requested {
            SnapshotPhase::PreSnapshot
        } else {
            SnapshotPhase::PostSnapshot
        }
    }

    /// Transition on update; returns the snapshot flag of the update.
    fn on_update(&mut self) -> bool {
        *self = match *self {
            SnapshotPhase::PreSnapshot | SnapshotPhase::SnapshotActive => SnapshotPhase::SnapshotActive,
            SnapshotPhase::PostSnapshot | SnapshotPhase::PostSnapshotActive => {
                SnapshotPhase::PostSnapshotActive
            }
        };
        self.is_snapshot()
    }

    fn on_end_of_snapshot(&mut self) {
        *self = match *self {
            SnapshotPhase::PreSnapshot => SnapshotPhase::PostSnapshot,
            SnapshotPhase::SnapshotActive => SnapshotPhase::PostSnapshotActive,
            other => other,
        };
    }

    fn is_snapshot(&self) -> bool {
        matches!(self, SnapshotPhase::PreSnapshot | SnapshotPhase::SnapshotActive)
    }
}

#[derive(Debug)]
pub(crate) struct RawItem {
    state: RawState,
    values: Option<ValueTable>,
}

#[derive(Debug)]
pub(crate) struct MergeItem {
    state: MergeState,
    snapshot_requested: bool,
    values: Option<ValueTable>,
}

#[derive(Debug)]
pub(crate) struct DistinctItem {
    phase: SnapshotPhase,
    values: Option<ValueTable>,
}

#[derive(Debug)]
pub(crate) struct CommandItem {
    phase: SnapshotPhase,
    layout: CommandLayout,
    values: Option<ValueTable>,
    keys: BTreeMap<String, Key>,
}

/// Item of a subscription.
#[derive(Debug)]
pub(crate) enum Item {
    Raw(RawItem),
    Merge(MergeItem),
    Distinct(DistinctItem),
    Command(CommandItem),
}

impl Item {
    pub(crate) fn raw() -> Self {
        Item::Raw(RawItem {
            state: RawState::Unset,
            values: None,
        })
    }

    pub(crate) fn merge(snapshot_requested: bool) -> Self {
        Item::Merge(MergeItem {
            state: MergeState::Unset,
            snapshot_requested,
            values: None,
        })
    }

    pub(crate) fn distinct(snapshot_requested: bool) -> Self {
        Item::Distinct(DistinctItem {
            phase: SnapshotPhase::initial(snapshot_requested),
            values: None,
        })
    }

    pub(crate) fn command(snapshot_requested: bool, layout: CommandLayout) -> Self {
        Item::Command(CommandItem {
            phase: SnapshotPhase::initial(snapshot_requested),
            layout,
            values: None,
            keys: BTreeMap::new(),
        })
    }

    /// Apply an update line.
    pub(crate) fn update(
        &mut self,
        ctx: &ItemContext<'_>,
        deltas: &DeltaMap,
        out: &mut Vec<Output>,
    ) -> ProtocolResult<()> {
        match self {
            Item::Raw(item) => {
                let r = reconcile(item.values.as_ref(), deltas)?;
                item.state = RawState::Set;
                item.values = Some(r.values.clone());
                out.push(Output::Event(SubscriptionEvent::Update(ctx.update(false, r, None))));
            }
            Item::Merge(item) => {
                let r = reconcile(item.values.as_ref(), deltas)?;
                let (state, snapshot) = match item.state {
                    MergeState::Unset if item.snapshot_requested => (MergeState::SnapshotReceived, true),
                    _ => (MergeState::Live, false),
                };
                item.state = state;
                item.values = Some(r.values.clone());
                out.push(Output::Event(SubscriptionEvent::Update(ctx.update(snapshot, r, None))));
            }
            Item::Distinct(item) => {
                let r = reconcile(item.values.as_ref(), deltas)?;
                let snapshot = item.phase.on_update();
                item.values = Some(r.values.clone());
                out.push(Output::Event(SubscriptionEvent::Update(ctx.update(snapshot, r, None))));
            }
            Item::Command(item) => item.update(ctx, deltas, out)?,
        }
        Ok(())
    }

    pub(crate) fn end_of_snapshot(&mut self) {
        match self {
            Item::Raw(_) => {}
            Item::Merge(item) => {
                if item.state == MergeState::SnapshotReceived {
                    item.state = MergeState::Live;
                }
            }
            Item::Distinct(item) => item.phase.on_end_of_snapshot(),
            Item::Command(item) => item.phase.on_end_of_snapshot(),
        }
    }

    /// Clear snapshot. Only COMMAND items change: every key is dropped
    /// without emitting a row.
    pub(crate) fn clear_snapshot(&mut self, pos: usize, out: &mut Vec<Output>) {
        if let Item::Command(item) = self {
            item.clear(pos, out);
        }
    }

    /// Terminal: release keys and their nested subscriptions.
    pub(crate) fn dispose(&mut self, pos: usize, out: &mut Vec<Output>) {
        if let Item::Command(item) = self {
            item.clear(pos, out);
        }
    }

    /// Current value of a field of the item.
    pub(crate) fn value(&self, field: usize) -> Option<String> {
        let values = match self {
            Item::Raw(item) => item.values.as_ref(),
            Item::Merge(item) => item.values.as_ref(),
            Item::Distinct(item) => item.values.as_ref(),
            Item::Command(item) => item.values.as_ref(),
        };
        values?.rendered(field)
    }

    pub(crate) fn as_command(&self) -> Option<&CommandItem> {
        match self {
            Item::Command(item) => Some(item),
            _ => None,
        }
    }

    pub(crate) fn as_command_mut(&mut self) -> Option<&mut CommandItem> {
        match self {
            Item::Command(item) => Some(item),
            _ => None,
        }
    }
}

impl CommandItem {
    fn update(
        &mut self,
        ctx: &ItemContext<'_>,
        deltas: &DeltaMap,
        out: &mut Vec<Output>,
    ) -> ProtocolResult<()> {
        let r = reconcile(self.values.as_ref(), deltas)?;
        let key = r
            .values
            .rendered(self.layout.key_pos)
            .ok_or(ProtocolError::InvalidValue {
                what: "command key",
                value: "null".to_string(),
            })?;
        let token = r.values.rendered(self.layout.cmd_pos).unwrap_or_default();
        let command = Command::parse(&token).ok_or(ProtocolError::InvalidValue {
            what: "command",
            value: token,
        })?;

        let snapshot = self.phase.on_update();
        let row = r.values;
        let entry = self.keys.entry(key.clone()).or_insert_with(|| Key::new(key.clone()));
        let change = entry.apply(&row, command, ctx.pos, &self.layout, out);
        self.values = Some(row);
        let Some(change) = change else {
            return Ok(());
        };
        if change.removed {
            self.keys.remove(&key);
        }
        out.push(Output::Event(SubscriptionEvent::Update(self.row_update(
            ctx,
            snapshot,
            change.row,
            change.changed,
        ))));
        Ok(())
    }

    /// Merge a nested update into the row of `key`.
    pub(crate) fn second_level_update(
        &mut self,
        ctx: &ItemContext<'_>,
        key: &str,
        nested: &ValueTable,
        out: &mut Vec<Output>,
    ) {
        let snapshot = self.phase.is_snapshot();
        let Some(change) = self
            .keys
            .get_mut(key)
            .and_then(|k| k.second_level_update(nested, &self.layout))
        else {
            return;
        };
        out.push(Output::Event(SubscriptionEvent::Update(self.row_update(
            ctx,
            snapshot,
            change.row,
            change.changed,
        ))));
    }

    pub(crate) fn second_level_failed(&mut self, key: &str) -> bool {
        self.keys.get_mut(key).is_some_and(Key::second_level_failed)
    }

    pub(crate) fn set_key_frequency(&mut self, key: &str, frequency: Option<RealMaxFrequency>) -> bool {
        self.keys
            .get_mut(key)
            .is_some_and(|k| k.set_frequency(frequency))
    }

    pub(crate) fn key_frequencies(&self) -> impl Iterator<Item = Option<RealMaxFrequency>> + '_ {
        self.keys.values().map(Key::frequency)
    }

    pub(crate) fn key_value(&self, key: &str, field: usize) -> Option<String> {
        self.keys.get(key)?.value(field)
    }

    pub(crate) fn keys(&self) -> impl Iterator<Item = &str> + '_ {
        self.keys.keys().map(String::as_str)
    }

    fn clear(&mut self, pos: usize, out: &mut Vec<Output>) {
        for key in self.keys.values_mut() {
            key.dispose(pos, out);
        }
        self.keys.clear();
    }

    fn row_update(
        &self,
        ctx: &ItemContext<'_>,
        snapshot: bool,
        values: ValueTable,
        changed: BTreeSet<usize>,
    ) -> ItemUpdate {
        ctx.update(
            snapshot,
            Reconciled {
                values,
                changed,
                json_patches: BTreeMap::new(),
            },
            self.layout.two_level.then_some(self.layout.first_len),
        )
    }
}
