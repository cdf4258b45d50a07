//! User-facing configuration: subscriptions, messages, MPN and the engine.
//!
//! Every config is a plain serde struct with `with_*` builders and a
//! `validate()` that the engine runs before accepting it.

use serde::{Deserialize, Serialize};
use tlcp_core::types::{BufferSize, RequestedMaxFrequency, SnapshotRequest, SubscriptionMode};

use crate::error::{ClientError, ClientResult};

/// Transport of the current session. Over the stream transport, some
/// requests are sent with `LS_ack=false` and rely on data lines instead of
/// `REQOK`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Transport {
    /// WebSocket or HTTP streaming connection.
    Stream,
    /// Polling or plain HTTP control connection.
    Http,
}

impl Transport {
    /// Whether requests may skip the acknowledgement.
    pub const fn is_stream(&self) -> bool {
        matches!(self, Transport::Stream)
    }
}

/// Whether `name` can be used as an item name: non-empty, no whitespace and
/// not purely numeric.
pub fn is_valid_item_name(name: &str) -> bool {
    !name.is_empty()
        && !name.chars().any(char::is_whitespace)
        && !name.chars().all(|c| c.is_ascii_digit())
}

/// Second-level settings of a two-level COMMAND subscription.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct SecondLevelConfig {
    /// Field list of the nested subscriptions.
    pub fields: Option<Vec<String>>,
    /// Field schema of the nested subscriptions.
    pub schema: Option<String>,
    /// Data adapter of the nested subscriptions.
    pub data_adapter: Option<String>,
}

impl SecondLevelConfig {
    /// Second level with an explicit field list.
    pub fn with_fields<I, S>(fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            fields: Some(fields.into_iter().map(Into::into).collect()),
            ..Self::default()
        }
    }

    /// Second level with a field schema.
    pub fn with_schema(schema: impl Into<String>) -> Self {
        Self {
            schema: Some(schema.into()),
            ..Self::default()
        }
    }

    /// Set the data adapter.
    #[must_use]
    pub fn data_adapter(mut self, adapter: impl Into<String>) -> Self {
        self.data_adapter = Some(adapter.into());
        self
    }
}

/// Subscription request settings.
///
/// # Example
///
/// ```rust
/// use tlcp_client::config::SubscriptionConfig;
/// use tlcp_client::core::types::{RequestedMaxFrequency, SnapshotRequest, SubscriptionMode};
///
/// let config = SubscriptionConfig::new(SubscriptionMode::Merge)
///     .with_items(["item1", "item2"])
///     .with_fields(["last_price", "time"])
///     .with_snapshot(SnapshotRequest::Yes)
///     .with_max_frequency(RequestedMaxFrequency::Limited(1.0));
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubscriptionConfig {
    /// Subscription mode.
    pub mode: SubscriptionMode,
    /// Explicit item names.
    pub items: Option<Vec<String>>,
    /// Item group name, resolved by the metadata adapter.
    pub group: Option<String>,
    /// Explicit field names.
    pub fields: Option<Vec<String>>,
    /// Field schema name, resolved by the metadata adapter.
    pub schema: Option<String>,
    /// Data adapter name.
    pub data_adapter: Option<String>,
    /// Selector name.
    pub selector: Option<String>,
    /// Snapshot policy.
    #[serde(default)]
    pub snapshot: SnapshotRequest,
    /// Requested buffer size.
    pub buffer_size: Option<BufferSize>,
    /// Requested max frequency; the only setting that can change once sent.
    pub max_frequency: Option<RequestedMaxFrequency>,
    /// Two-level expansion (COMMAND only).
    pub second_level: Option<SecondLevelConfig>,
}

impl SubscriptionConfig {
    /// Empty configuration for `mode`.
    pub fn new(mode: SubscriptionMode) -> Self {
        Self {
            mode,
            items: None,
            group: None,
            fields: None,
            schema: None,
            data_adapter: None,
            selector: None,
            snapshot: SnapshotRequest::No,
            buffer_size: None,
            max_frequency: None,
            second_level: None,
        }
    }

    /// Set the item list.
    #[must_use]
    pub fn with_items<I, S>(mut self, items: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.items = Some(items.into_iter().map(Into::into).collect());
        self
    }

    /// Set the item group.
    #[must_use]
    pub fn with_group(mut self, group: impl Into<String>) -> Self {
        self.group = Some(group.into());
        self
    }

    /// Set the field list.
    #[must_use]
    pub fn with_fields<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.fields = Some(fields.into_iter().map(Into::into).collect());
        self
    }

    /// Set the field schema.
    #[must_use]
    pub fn with_schema(mut self, schema: impl Into<String>) -> Self {
        self.schema = Some(schema.into());
        self
    }

    /// Set the data adapter.
    #[must_use]
    pub fn with_data_adapter(mut self, adapter: impl Into<String>) -> Self {
        self.data_adapter = Some(adapter.into());
        self
    }

    /// Set the selector.
    #[must_use]
    pub fn with_selector(mut self, selector: impl Into<String>) -> Self {
        self.selector = Some(selector.into());
        self
    }

    /// Set the snapshot policy.
    #[must_use]
    pub fn with_snapshot(mut self, snapshot: SnapshotRequest) -> Self {
        self.snapshot = snapshot;
        self
    }

    /// Set the requested buffer size.
    #[must_use]
    pub fn with_buffer_size(mut self, size: BufferSize) -> Self {
        self.buffer_size = Some(size);
        self
    }

    /// Set the requested max frequency.
    #[must_use]
    pub fn with_max_frequency(mut self, frequency: RequestedMaxFrequency) -> Self {
        self.max_frequency = Some(frequency);
        self
    }

    /// Enable two-level expansion.
    #[must_use]
    pub fn with_second_level(mut self, second_level: SecondLevelConfig) -> Self {
        self.second_level = Some(second_level);
        self
    }

    /// Value of `LS_group`: the item list joined by spaces, or the group.
    pub fn group_value(&self) -> Option<String> {
        match (&self.items, &self.group) {
            (Some(items), _) => Some(items.join(" ")),
            (None, Some(group)) => Some(group.clone()),
            (None, None) => None,
        }
    }

    /// Value of `LS_schema`: the field list joined by spaces, or the schema.
    pub fn schema_value(&self) -> Option<String> {
        match (&self.fields, &self.schema) {
            (Some(fields), _) => Some(fields.join(" ")),
            (None, Some(schema)) => Some(schema.clone()),
            (None, None) => None,
        }
    }

    /// 1-based position of `name` in the field list.
    pub fn field_position(&self, name: &str) -> Option<usize> {
        self.fields
            .as_ref()?
            .iter()
            .position(|f| f == name)
            .map(|i| i + 1)
    }

    /// Whether a snapshot was requested.
    pub fn snapshot_requested(&self) -> bool {
        self.snapshot.is_requested()
    }

    /// Nested MERGE subscription for `key` of a two-level COMMAND
    /// subscription, or `None` without a second level.
    pub fn second_level_config(&self, key: &str) -> Option<SubscriptionConfig> {
        let second = self.second_level.as_ref()?;
        Some(SubscriptionConfig {
            mode: SubscriptionMode::Merge,
            items: Some(vec![key.to_string()]),
            group: None,
            fields: second.fields.clone(),
            schema: second.schema.clone(),
            data_adapter: second.data_adapter.clone(),
            selector: None,
            snapshot: SnapshotRequest::Yes,
            buffer_size: None,
            max_frequency: self.max_frequency,
            second_level: None,
        })
    }

    /// Check the settings before any request is built.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::InvalidConfig`] describing the first problem.
    pub fn validate(&self) -> ClientResult<()> {
        if self.items.is_none() && self.group.is_none() {
            return Err(ClientError::config("either items or an item group is required"));
        }
        if self.fields.is_none() && self.schema.is_none() {
            return Err(ClientError::config("either fields or a field schema is required"));
        }
        if let Some(items) = &self.items {
            if items.is_empty() {
                return Err(ClientError::config("item list is empty"));
            }
            if let Some(bad) = items.iter().find(|i| !is_valid_item_name(i)) {
                return Err(ClientError::config(format!("invalid item name '{bad}'")));
            }
        }
        if let Some(fields) = &self.fields {
            if fields.is_empty() {
                return Err(ClientError::config("field list is empty"));
            }
            if let Some(bad) = fields.iter().find(|f| f.is_empty() || f.contains(' ')) {
                return Err(ClientError::config(format!("invalid field name '{bad}'")));
            }
            if self.mode == SubscriptionMode::Command
                && (self.field_position("key").is_none() || self.field_position("command").is_none())
            {
                return Err(ClientError::config(
                    "COMMAND field list must contain 'key' and 'command'",
                ));
            }
        }
        if matches!(self.snapshot, SnapshotRequest::Length(_))
            && self.mode != SubscriptionMode::Distinct
        {
            return Err(ClientError::config("snapshot length is only allowed in DISTINCT mode"));
        }
        if self.snapshot.is_requested() && self.mode == SubscriptionMode::Raw {
            return Err(ClientError::config("RAW mode has no snapshot"));
        }
        if let Some(second) = &self.second_level {
            if self.mode != SubscriptionMode::Command {
                return Err(ClientError::config("second level is only allowed in COMMAND mode"));
            }
            if second.fields.is_none() && second.schema.is_none() {
                return Err(ClientError::config(
                    "second level needs either fields or a field schema",
                ));
            }
            if second.fields.as_ref().is_some_and(Vec::is_empty) {
                return Err(ClientError::config("second-level field list is empty"));
            }
        }
        if self.max_frequency == Some(RequestedMaxFrequency::Unfiltered)
            && self.buffer_size.is_some()
        {
            return Err(ClientError::config("unfiltered subscriptions cannot set a buffer size"));
        }
        if let Some(RequestedMaxFrequency::Limited(f)) = self.max_frequency {
            if !(f.is_finite() && f > 0.0) {
                return Err(ClientError::config(format!("invalid max frequency {f}")));
            }
        }
        Ok(())
    }
}

/// Options for [`Engine::send_message`](crate::engine::Engine::send_message).
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct MessageOptions {
    /// Sequence the message belongs to; unordered when absent.
    pub sequence: Option<String>,
    /// Max time in milliseconds the server may wait for earlier messages of
    /// the sequence (`LS_max_wait`).
    pub delay_timeout: Option<u64>,
}

impl MessageOptions {
    /// Options for an unordered message.
    pub fn new() -> Self {
        Self::default()
    }

    /// Send within `sequence`.
    #[must_use]
    pub fn with_sequence(mut self, sequence: impl Into<String>) -> Self {
        self.sequence = Some(sequence.into());
        self
    }

    /// Set `LS_max_wait`.
    #[must_use]
    pub fn with_delay_timeout(mut self, millis: u64) -> Self {
        self.delay_timeout = Some(millis);
        self
    }

    /// Check the sequence name.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::InvalidSequence`] unless the name matches
    /// `[A-Za-z0-9_]+`.
    pub fn validate(&self) -> ClientResult<()> {
        match &self.sequence {
            Some(seq)
                if seq.is_empty() || !seq.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') =>
            {
                Err(ClientError::InvalidSequence(seq.clone()))
            }
            _ => Ok(()),
        }
    }
}

/// Device registration settings for mobile push notifications.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MpnDeviceConfig {
    /// Notification platform (`PN_type`), e.g. `Apple` or `Google`.
    pub platform: String,
    /// Application id (`PN_appId`).
    pub app_id: String,
    /// Device token (`PN_deviceToken`).
    pub device_token: String,
}

impl MpnDeviceConfig {
    /// New device settings.
    pub fn new(
        platform: impl Into<String>,
        app_id: impl Into<String>,
        device_token: impl Into<String>,
    ) -> Self {
        Self {
            platform: platform.into(),
            app_id: app_id.into(),
            device_token: device_token.into(),
        }
    }

    /// Check the settings.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::InvalidConfig`] when a setting is empty.
    pub fn validate(&self) -> ClientResult<()> {
        if self.platform.is_empty() || self.app_id.is_empty() || self.device_token.is_empty() {
            return Err(ClientError::config("device platform, app id and token are required"));
        }
        Ok(())
    }
}

/// MPN subscription settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MpnSubscriptionConfig {
    /// Subscription mode; RAW is not allowed.
    pub mode: SubscriptionMode,
    /// Item group (or space-separated item list).
    pub group: String,
    /// Field schema (or space-separated field list).
    pub schema: String,
    /// Data adapter name.
    pub data_adapter: Option<String>,
    /// Notification format (`PN_notificationFormat`).
    pub notification_format: String,
    /// Trigger expression (`PN_trigger`).
    pub trigger: Option<String>,
    /// Coalesce notifications (`PN_coalescing`).
    #[serde(default)]
    pub coalescing: bool,
    /// Requested buffer size.
    pub buffer_size: Option<BufferSize>,
    /// Requested max frequency.
    pub max_frequency: Option<RequestedMaxFrequency>,
}

impl MpnSubscriptionConfig {
    /// New MPN subscription settings.
    pub fn new(
        mode: SubscriptionMode,
        group: impl Into<String>,
        schema: impl Into<String>,
        notification_format: impl Into<String>,
    ) -> Self {
        Self {
            mode,
            group: group.into(),
            schema: schema.into(),
            data_adapter: None,
            notification_format: notification_format.into(),
            trigger: None,
            coalescing: false,
            buffer_size: None,
            max_frequency: None,
        }
    }

    /// Set the data adapter.
    #[must_use]
    pub fn with_data_adapter(mut self, adapter: impl Into<String>) -> Self {
        self.data_adapter = Some(adapter.into());
        self
    }

    /// Set the trigger expression.
    #[must_use]
    pub fn with_trigger(mut self, trigger: impl Into<String>) -> Self {
        self.trigger = Some(trigger.into());
        self
    }

    /// Enable coalescing.
    #[must_use]
    pub fn with_coalescing(mut self, coalescing: bool) -> Self {
        self.coalescing = coalescing;
        self
    }

    /// Set the requested max frequency.
    #[must_use]
    pub fn with_max_frequency(mut self, frequency: RequestedMaxFrequency) -> Self {
        self.max_frequency = Some(frequency);
        self
    }

    /// Check the settings.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::InvalidConfig`] describing the first problem.
    pub fn validate(&self) -> ClientResult<()> {
        if self.mode == SubscriptionMode::Raw {
            return Err(ClientError::config("RAW mode cannot be used for MPN"));
        }
        if self.group.trim().is_empty() || self.schema.trim().is_empty() {
            return Err(ClientError::config("MPN group and schema are required"));
        }
        if self.notification_format.is_empty() {
            return Err(ClientError::config("notification format is required"));
        }
        Ok(())
    }
}

/// Engine-wide settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Deliver listener callbacks only when
    /// [`CallbackQueue::drain`](crate::dispatch::CallbackQueue::drain) is
    /// called, instead of on a dispatcher thread.
    #[serde(default)]
    pub manual_dispatch: bool,
    /// Name of the dispatcher thread.
    #[serde(default = "default_thread_name")]
    pub dispatcher_thread_name: String,
    /// Send `LS_cause=zombie` deletes for events of unknown subscriptions.
    #[serde(default = "default_true")]
    pub delete_zombies: bool,
}

fn default_thread_name() -> String {
    "tlcp-callbacks".to_string()
}

fn default_true() -> bool {
    true
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            manual_dispatch: false,
            dispatcher_thread_name: default_thread_name(),
            delete_zombies: true,
        }
    }
}

impl EngineConfig {
    /// Use manual callback dispatch.
    #[must_use]
    pub fn with_manual_dispatch(mut self, manual: bool) -> Self {
        self.manual_dispatch = manual;
        self
    }

    /// Enable or disable zombie deletes.
    #[must_use]
    pub fn with_zombie_deletes(mut self, enabled: bool) -> Self {
        self.delete_zombies = enabled;
        self
    }
}
