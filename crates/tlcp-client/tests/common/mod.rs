#![allow(dead_code)]

use parking_lot::Mutex;
use std::sync::Arc;
use tlcp_client::core::types::RealMaxFrequency;
use tlcp_client::{
    ClientMessageListener, Engine, EngineConfig, ItemUpdate, MpnDeviceListener, MpnSubscriptionListener,
    SubscriptionListener,
};

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn engine() -> Engine {
    engine_with(EngineConfig::default())
}

pub fn engine_with(config: EngineConfig) -> Engine {
    init_tracing();
    Engine::new(config.with_manual_dispatch(true)).expect("manual engine")
}

/// Feed lines, panicking on the first rejected one.
pub fn feed(engine: &mut Engine, lines: &[&str]) {
    for line in lines {
        engine
            .handle_line(line)
            .unwrap_or_else(|e| panic!("line {line:?} rejected: {e}"));
    }
}

/// Every request currently ready, in order.
pub fn drain_requests(engine: &mut Engine) -> Vec<tlcp_client::core::ControlRequest> {
    std::iter::from_fn(|| engine.next_request()).collect()
}

/// Listener recording every callback as a line of text.
#[derive(Default)]
pub struct Recorder {
    events: Mutex<Vec<String>>,
    updates: Mutex<Vec<ItemUpdate>>,
}

impl Recorder {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn subscription(self: &Arc<Self>) -> Option<Arc<dyn SubscriptionListener>> {
        let listener: Arc<dyn SubscriptionListener> = self.clone();
        Some(listener)
    }

    pub fn message(self: &Arc<Self>) -> Option<Arc<dyn ClientMessageListener>> {
        let listener: Arc<dyn ClientMessageListener> = self.clone();
        Some(listener)
    }

    pub fn mpn(self: &Arc<Self>) -> Option<Arc<dyn MpnSubscriptionListener>> {
        let listener: Arc<dyn MpnSubscriptionListener> = self.clone();
        Some(listener)
    }

    pub fn device(self: &Arc<Self>) -> Option<Arc<dyn MpnDeviceListener>> {
        let listener: Arc<dyn MpnDeviceListener> = self.clone();
        Some(listener)
    }

    fn push(&self, event: impl Into<String>) {
        self.events.lock().push(event.into());
    }

    /// Recorded events since the last call.
    pub fn take(&self) -> Vec<String> {
        std::mem::take(&mut *self.events.lock())
    }

    /// Recorded item updates since the last call.
    pub fn take_updates(&self) -> Vec<ItemUpdate> {
        std::mem::take(&mut *self.updates.lock())
    }
}

fn frequency(f: Option<RealMaxFrequency>) -> String {
    f.map_or_else(|| "none".to_string(), |f| f.to_string())
}

impl SubscriptionListener for Recorder {
    fn on_listen_start(&self) {
        self.push("listen_start");
    }

    fn on_listen_end(&self) {
        self.push("listen_end");
    }

    fn on_subscription(&self) {
        self.push("subscribed");
    }

    fn on_subscription_error(&self, code: i32, message: &str) {
        self.push(format!("sub_error {code} {message}"));
    }

    fn on_unsubscription(&self) {
        self.push("unsubscribed");
    }

    fn on_item_update(&self, update: &ItemUpdate) {
        let values: Vec<String> = update
            .fields()
            .into_values()
            .map(|v| v.unwrap_or_else(|| "#".to_string()))
            .collect();
        let snapshot = if update.is_snapshot() { " snapshot" } else { "" };
        self.push(format!("update {} [{}]{snapshot}", update.item_pos(), values.join("|")));
        self.updates.lock().push(update.clone());
    }

    fn on_end_of_snapshot(&self, _item_name: Option<&str>, item_pos: usize) {
        self.push(format!("eos {item_pos}"));
    }

    fn on_clear_snapshot(&self, _item_name: Option<&str>, item_pos: usize) {
        self.push(format!("cs {item_pos}"));
    }

    fn on_item_lost_updates(&self, _item_name: Option<&str>, item_pos: usize, lost: u64) {
        self.push(format!("lost {item_pos} {lost}"));
    }

    fn on_real_max_frequency(&self, f: Option<RealMaxFrequency>) {
        self.push(format!("frequency {}", frequency(f)));
    }

    fn on_second_level_subscription_error(&self, code: i32, _message: &str, key: &str) {
        self.push(format!("second_level_error {code} {key}"));
    }

    fn on_second_level_lost_updates(&self, lost: u64, key: &str) {
        self.push(format!("second_level_lost {lost} {key}"));
    }
}

impl ClientMessageListener for Recorder {
    fn on_processed(&self, message: &str, response: &str) {
        self.push(format!("processed {message} {response}"));
    }

    fn on_discarded(&self, message: &str) {
        self.push(format!("discarded {message}"));
    }

    fn on_deny(&self, message: &str, code: i32, error: &str) {
        self.push(format!("denied {message} {code} {error}"));
    }

    fn on_error(&self, message: &str) {
        self.push(format!("error {message}"));
    }

    fn on_abort(&self, message: &str, sent_on_network: bool) {
        self.push(format!("aborted {message} sent={sent_on_network}"));
    }
}

impl MpnSubscriptionListener for Recorder {
    fn on_listen_start(&self) {
        self.push("mpn_listen_start");
    }

    fn on_subscription(&self) {
        self.push("mpn_subscribed");
    }

    fn on_unsubscription(&self) {
        self.push("mpn_unsubscribed");
    }

    fn on_subscription_error(&self, code: i32, _message: &str) {
        self.push(format!("mpn_sub_error {code}"));
    }

    fn on_unsubscription_error(&self, code: i32, _message: &str) {
        self.push(format!("mpn_unsub_error {code}"));
    }

    fn on_triggered(&self) {
        self.push("mpn_triggered");
    }

    fn on_status_changed(&self, status: &str, timestamp: Option<u64>) {
        self.push(format!("mpn_status {status} {timestamp:?}"));
    }

    fn on_property_changed(&self, property: &str) {
        self.push(format!("mpn_property {property}"));
    }

    fn on_modification_error(&self, code: i32, _message: &str, property: &str) {
        self.push(format!("mpn_modification_error {code} {property}"));
    }
}

impl MpnDeviceListener for Recorder {
    fn on_registered(&self, device_id: &str) {
        self.push(format!("device_registered {device_id}"));
    }

    fn on_registration_failed(&self, code: i32, _message: &str) {
        self.push(format!("device_failed {code}"));
    }
}
