//! Listener traits for subscriptions, messages, MPN subscriptions and the
//! MPN device.
//!
//! Every method has a no-op default, so implementors override only what they
//! care about. Callbacks run on the callback queue, never while the engine
//! is locked, so a listener may call back into a
//! [`SharedEngine`](crate::engine::SharedEngine).

use tlcp_core::types::RealMaxFrequency;

use crate::update::ItemUpdate;

/// Receives the events of one subscription.
pub trait SubscriptionListener: Send + Sync {
    /// The listener was attached to a subscription.
    fn on_listen_start(&self) {}

    /// The listener was detached.
    fn on_listen_end(&self) {}

    /// The server accepted the subscription.
    fn on_subscription(&self) {}

    /// The server refused the subscription; it will not be retried.
    fn on_subscription_error(&self, _code: i32, _message: &str) {}

    /// The subscription is no longer active.
    fn on_unsubscription(&self) {}

    /// An item changed.
    fn on_item_update(&self, _update: &ItemUpdate) {}

    /// The snapshot of an item is complete (DISTINCT and COMMAND).
    fn on_end_of_snapshot(&self, _item_name: Option<&str>, _item_pos: usize) {}

    /// The snapshot of an item must be discarded.
    fn on_clear_snapshot(&self, _item_name: Option<&str>, _item_pos: usize) {}

    /// The server dropped `lost` updates for an item.
    fn on_item_lost_updates(&self, _item_name: Option<&str>, _item_pos: usize, _lost: u64) {}

    /// The frequency actually applied changed; `None` while unknown.
    fn on_real_max_frequency(&self, _frequency: Option<RealMaxFrequency>) {}

    /// The nested subscription for `key` could not be established.
    fn on_second_level_subscription_error(&self, _code: i32, _message: &str, _key: &str) {}

    /// The server dropped `lost` updates of the nested subscription for `key`.
    fn on_second_level_lost_updates(&self, _lost: u64, _key: &str) {}
}

/// Receives the outcome of one client message.
pub trait ClientMessageListener: Send + Sync {
    /// The metadata adapter processed the message.
    fn on_processed(&self, _message: &str, _response: &str) {}

    /// The server discarded the message before processing it.
    fn on_discarded(&self, _message: &str) {}

    /// The metadata adapter refused the message.
    fn on_deny(&self, _message: &str, _code: i32, _error: &str) {}

    /// The message could not be processed.
    fn on_error(&self, _message: &str) {}

    /// The session ended before the outcome was known.
    fn on_abort(&self, _message: &str, _sent_on_network: bool) {}
}

/// Receives the events of one MPN subscription.
pub trait MpnSubscriptionListener: Send + Sync {
    /// The listener was attached.
    fn on_listen_start(&self) {}

    /// The MPN subscription is active on the server.
    fn on_subscription(&self) {}

    /// The MPN subscription was deleted.
    fn on_unsubscription(&self) {}

    /// The activation was refused.
    fn on_subscription_error(&self, _code: i32, _message: &str) {}

    /// The deactivation was refused or aborted.
    fn on_unsubscription_error(&self, _code: i32, _message: &str) {}

    /// The trigger condition fired.
    fn on_triggered(&self) {}

    /// The server-side status changed.
    fn on_status_changed(&self, _status: &str, _timestamp: Option<u64>) {}

    /// A server-side property (`notification_format`, `trigger`) changed.
    fn on_property_changed(&self, _property: &str) {}

    /// Changing `property` was refused or aborted.
    fn on_modification_error(&self, _code: i32, _message: &str, _property: &str) {}
}

/// Receives the device registration outcome.
pub trait MpnDeviceListener: Send + Sync {
    /// The server registered the device.
    fn on_registered(&self, _device_id: &str) {}

    /// The registration was refused.
    fn on_registration_failed(&self, _code: i32, _message: &str) {}
}
