//! Mobile push notification state: device registration and MPN
//! subscriptions.
//!
//! An MPN subscription is a flat struct of orthogonal regions:
//!
//! - `main`: activation lifecycle (waiting for the device, activating,
//!   active, finalized);
//! - `unsubscribe`, `format`, `trigger`: one [`Modification`] each, holding
//!   a queued value and the request in flight;
//! - `control`: which single modification request is in flight;
//! - `abort`: whether a session abort can still be observed;
//! - `status`: the server-pushed `ACTIVE`/`TRIGGERED` status.
//!
//! After any region changes, [`MpnSubscriptionManager::reconcile_control`]
//! picks the next request by priority: unsubscribe, then format, then
//! trigger.

use tracing::Span;
use tlcp_core::request::ControlRequest;
use tlcp_core::types::{RequestId, SnapshotRequest, SubscriptionId, SubscriptionMode};

use crate::config::{MpnDeviceConfig, MpnSubscriptionConfig, SubscriptionConfig};
use crate::subscription::Terminal;
use crate::update::ItemUpdate;

/// Code reported for MPN requests cut short by the end of the session.
pub const ABORTED: i32 = 54;

/// Fields of the MPN status item, in subscription order.
pub const STATUS_FIELDS: [&str; 4] = ["status", "status_timestamp", "notification_format", "trigger"];

/// Public view of the device registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceStatus {
    /// No registration for the current session.
    Unregistered,
    /// Register request queued or in flight.
    Registering,
    /// `MPNREG` received.
    Registered,
    /// The server refused the registration.
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum DeviceState {
    Unregistered,
    RegisterPending { req_id: Option<RequestId> },
    Registered { device_id: String, adapter: String },
    Failed { code: i32, message: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum DeviceEvent {
    Registered { device_id: String },
    Failed { code: i32, message: String },
}

/// The device this client registers for push notifications.
#[derive(Debug)]
pub(crate) struct MpnDevice {
    config: MpnDeviceConfig,
    state: DeviceState,
    span: Span,
}

impl MpnDevice {
    pub(crate) fn new(config: MpnDeviceConfig, span: Span) -> Self {
        Self {
            config,
            state: DeviceState::Unregistered,
            span,
        }
    }

    pub(crate) fn status(&self) -> DeviceStatus {
        match self.state {
            DeviceState::Unregistered => DeviceStatus::Unregistered,
            DeviceState::RegisterPending { .. } => DeviceStatus::Registering,
            DeviceState::Registered { .. } => DeviceStatus::Registered,
            DeviceState::Failed { .. } => DeviceStatus::Failed,
        }
    }

    /// Device id and adapter once registered.
    pub(crate) fn registration(&self) -> Option<(&str, &str)> {
        match &self.state {
            DeviceState::Registered { device_id, adapter } => Some((device_id, adapter)),
            _ => None,
        }
    }

    fn transition(&mut self, to: DeviceState) {
        tracing::debug!(parent: &self.span, from = ?self.state, to = ?to, "device transition");
        self.state = to;
    }

    /// Queue the register request. Returns whether a request is now pending.
    pub(crate) fn register(&mut self) -> bool {
        match self.state {
            DeviceState::Unregistered | DeviceState::Failed { .. } => {
                self.transition(DeviceState::RegisterPending { req_id: None });
                true
            }
            _ => false,
        }
    }

    pub(crate) fn encode(&mut self, req_id: RequestId) -> Option<ControlRequest> {
        if self.state != (DeviceState::RegisterPending { req_id: None }) {
            return None;
        }
        self.transition(DeviceState::RegisterPending { req_id: Some(req_id) });
        Some(
            ControlRequest::new(req_id)
                .param("LS_op", "register")
                .param("PN_type", &self.config.platform)
                .param("PN_appId", &self.config.app_id)
                .param("PN_deviceToken", &self.config.device_token),
        )
    }

    pub(crate) fn is_pending(&self, req_id: RequestId) -> bool {
        self.state == (DeviceState::RegisterPending { req_id: Some(req_id) })
    }

    pub(crate) fn on_req_err(&mut self, req_id: RequestId, code: i32, message: &str) -> Option<DeviceEvent> {
        if !self.is_pending(req_id) {
            return None;
        }
        tracing::warn!(parent: &self.span, code, reason = message, "device registration refused");
        self.transition(DeviceState::Failed {
            code,
            message: message.to_string(),
        });
        Some(DeviceEvent::Failed {
            code,
            message: message.to_string(),
        })
    }

    /// `MPNREG`.
    pub(crate) fn on_registered(&mut self, device_id: &str, adapter: &str) -> Option<DeviceEvent> {
        if !matches!(self.state, DeviceState::RegisterPending { .. } | DeviceState::Registered { .. }) {
            tracing::trace!(parent: &self.span, state = ?self.state, "MPNREG ignored");
            return None;
        }
        self.transition(DeviceState::Registered {
            device_id: device_id.to_string(),
            adapter: adapter.to_string(),
        });
        Some(DeviceEvent::Registered {
            device_id: device_id.to_string(),
        })
    }

    /// Registrations do not outlive the session.
    pub(crate) fn abort(&mut self) {
        if matches!(self.state, DeviceState::RegisterPending { .. } | DeviceState::Registered { .. }) {
            self.transition(DeviceState::Unregistered);
        }
    }
}

/// A region holding a requested change and the request carrying it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Modification<T> {
    Idle,
    Queued(T),
    InFlight {
        req_id: Option<RequestId>,
        value: T,
        next: Option<T>,
    },
}

impl<T> Modification<T> {
    fn request(&mut self, value: T) {
        *self = match std::mem::replace(self, Modification::Idle) {
            Modification::Idle | Modification::Queued(_) => Modification::Queued(value),
            Modification::InFlight { req_id, value: sent, .. } => Modification::InFlight {
                req_id,
                value: sent,
                next: Some(value),
            },
        };
    }

    fn is_queued(&self) -> bool {
        matches!(self, Modification::Queued(_))
    }

    fn is_pending(&self) -> bool {
        !matches!(self, Modification::Idle)
    }

    fn start(&mut self) {
        *self = match std::mem::replace(self, Modification::Idle) {
            Modification::Queued(value) => Modification::InFlight {
                req_id: None,
                value,
                next: None,
            },
            other => other,
        };
    }

    /// The value about to be encoded, tagging it with `req_id`.
    fn encode(&mut self, id: RequestId) -> Option<&T> {
        match self {
            Modification::InFlight { req_id, value, .. } if req_id.is_none() => {
                *req_id = Some(id);
                Some(&*value)
            }
            _ => None,
        }
    }

    fn is_in_flight(&self, id: RequestId) -> bool {
        matches!(self, Modification::InFlight { req_id: Some(r), .. } if *r == id)
    }

    /// Settle the request in flight, re-queuing any value that arrived
    /// meanwhile.
    fn finish(&mut self) -> Option<T> {
        match std::mem::replace(self, Modification::Idle) {
            Modification::InFlight { value, next, .. } => {
                if let Some(next) = next {
                    *self = Modification::Queued(next);
                }
                Some(value)
            }
            other => {
                *self = other;
                None
            }
        }
    }

    fn clear(&mut self) -> bool {
        let pending = self.is_pending();
        *self = Modification::Idle;
        pending
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Main {
    WaitingDevice,
    Activating { req_id: Option<RequestId> },
    Active,
    Finalized(Terminal),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Control {
    Idle,
    Unsubscribe,
    Format,
    Trigger,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum AbortRegion {
    Open,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Status {
    Unknown,
    Subscribed,
    Triggered,
}

/// Public view of an MPN subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MpnSubscriptionStatus {
    /// Waiting for the device registration.
    Inactive,
    /// Activate request queued or in flight.
    Activating,
    /// Active on the server.
    Subscribed,
    /// Active and its trigger fired.
    Triggered,
    /// No longer active.
    Terminated,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum MpnEvent {
    Subscribed,
    Unsubscribed,
    SubscriptionError { code: i32, message: String },
    UnsubscriptionError { code: i32, message: String },
    Triggered,
    StatusChanged { status: String, timestamp: Option<u64> },
    PropertyChanged(&'static str),
    ModificationError {
        code: i32,
        message: String,
        property: &'static str,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum MpnOutput {
    Event(MpnEvent),
    RequestReady,
    /// Subscribe to the status item of `mpn_sub_id`.
    OpenStatus { mpn_sub_id: String },
    /// Drop the status item subscription.
    CloseStatus,
    Finalized(Terminal),
}

#[derive(Debug)]
pub(crate) struct MpnSubscriptionManager {
    sub_id: SubscriptionId,
    config: MpnSubscriptionConfig,
    mpn_sub_id: Option<String>,
    main: Main,
    unsubscribe: Modification<()>,
    format: Modification<String>,
    trigger: Modification<Option<String>>,
    control: Control,
    abort: AbortRegion,
    status: Status,
    status_timestamp: Option<String>,
    status_open: bool,
    span: Span,
}

impl MpnSubscriptionManager {
    pub(crate) fn new(sub_id: SubscriptionId, config: MpnSubscriptionConfig, span: Span) -> Self {
        Self {
            sub_id,
            config,
            mpn_sub_id: None,
            main: Main::WaitingDevice,
            unsubscribe: Modification::Idle,
            format: Modification::Idle,
            trigger: Modification::Idle,
            control: Control::Idle,
            abort: AbortRegion::Closed,
            status: Status::Unknown,
            status_timestamp: None,
            status_open: false,
            span,
        }
    }

    pub(crate) fn sub_id(&self) -> SubscriptionId {
        self.sub_id
    }

    pub(crate) fn mpn_sub_id(&self) -> Option<&str> {
        self.mpn_sub_id.as_deref()
    }

    pub(crate) fn main(&self) -> Main {
        self.main
    }

    #[cfg(test)]
    pub(crate) fn control(&self) -> Control {
        self.control
    }

    pub(crate) fn is_finalized(&self) -> bool {
        matches!(self.main, Main::Finalized(_))
    }

    pub(crate) fn status(&self) -> MpnSubscriptionStatus {
        match (self.main, self.status) {
            (Main::WaitingDevice, _) => MpnSubscriptionStatus::Inactive,
            (Main::Activating { .. }, _) => MpnSubscriptionStatus::Activating,
            (Main::Active, Status::Triggered) => MpnSubscriptionStatus::Triggered,
            (Main::Active, _) => MpnSubscriptionStatus::Subscribed,
            (Main::Finalized(_), _) => MpnSubscriptionStatus::Terminated,
        }
    }

    /// Status item subscription for `mpn_sub_id`, read through `adapter`.
    pub(crate) fn status_config(mpn_sub_id: &str, adapter: &str) -> SubscriptionConfig {
        SubscriptionConfig::new(SubscriptionMode::Merge)
            .with_items([format!("SUB-{mpn_sub_id}")])
            .with_fields(STATUS_FIELDS)
            .with_data_adapter(adapter)
            .with_snapshot(SnapshotRequest::Yes)
    }

    fn set_main(&mut self, to: Main) {
        tracing::debug!(parent: &self.span, from = ?self.main, to = ?to, "mpn transition");
        self.main = to;
    }

    fn finalize(&mut self, terminal: Terminal, out: &mut Vec<MpnOutput>) {
        self.set_main(Main::Finalized(terminal));
        self.unsubscribe.clear();
        self.format.clear();
        self.trigger.clear();
        self.control = Control::Idle;
        self.abort = AbortRegion::Closed;
        if self.status_open {
            self.status_open = false;
            out.push(MpnOutput::CloseStatus);
        }
        out.push(MpnOutput::Finalized(terminal));
    }

    /// Pick the next modification to send, by priority. Runs after every
    /// region change. Nothing is selected while the abort region is closed:
    /// changes made between sessions stay queued until the device is ready.
    pub(crate) fn reconcile_control(&mut self, out: &mut Vec<MpnOutput>) {
        if self.main != Main::Active || self.control != Control::Idle || self.abort != AbortRegion::Open {
            return;
        }
        self.control = if self.unsubscribe.is_queued() {
            self.unsubscribe.start();
            Control::Unsubscribe
        } else if self.format.is_queued() {
            self.format.start();
            Control::Format
        } else if self.trigger.is_queued() {
            self.trigger.start();
            Control::Trigger
        } else {
            return;
        };
        tracing::debug!(parent: &self.span, control = ?self.control, "mpn control selected");
        out.push(MpnOutput::RequestReady);
    }

    /// The device is registered for the current session.
    pub(crate) fn device_ready(&mut self, out: &mut Vec<MpnOutput>) {
        match self.main {
            Main::WaitingDevice => {
                self.set_main(Main::Activating { req_id: None });
                out.push(MpnOutput::RequestReady);
            }
            Main::Active => {
                self.abort = AbortRegion::Open;
                self.reconcile_control(out);
            }
            _ => {}
        }
    }

    /// The device registration failed: nothing waiting for it can activate.
    pub(crate) fn device_failed(&mut self, code: i32, message: &str, out: &mut Vec<MpnOutput>) {
        if self.main == Main::WaitingDevice {
            out.push(MpnOutput::Event(MpnEvent::SubscriptionError {
                code,
                message: message.to_string(),
            }));
            self.finalize(Terminal::Failed, out);
        }
    }

    pub(crate) fn unsubscribe(&mut self, out: &mut Vec<MpnOutput>) {
        match self.main {
            Main::WaitingDevice | Main::Activating { req_id: None } => {
                self.finalize(Terminal::Deleted, out);
            }
            Main::Activating { .. } | Main::Active => {
                if !self.unsubscribe.is_pending() {
                    self.unsubscribe.request(());
                    self.reconcile_control(out);
                }
            }
            Main::Finalized(_) => {}
        }
    }

    pub(crate) fn set_notification_format(&mut self, format: String, out: &mut Vec<MpnOutput>) {
        match self.main {
            Main::WaitingDevice | Main::Activating { req_id: None } => {
                self.config.notification_format = format;
            }
            Main::Activating { .. } | Main::Active => {
                self.format.request(format);
                self.reconcile_control(out);
            }
            Main::Finalized(_) => {}
        }
    }

    pub(crate) fn set_trigger(&mut self, trigger: Option<String>, out: &mut Vec<MpnOutput>) {
        match self.main {
            Main::WaitingDevice | Main::Activating { req_id: None } => {
                self.config.trigger = trigger;
            }
            Main::Activating { .. } | Main::Active => {
                self.trigger.request(trigger);
                self.reconcile_control(out);
            }
            Main::Finalized(_) => {}
        }
    }

    /// Build the pending request. `device_id` is required to activate.
    pub(crate) fn encode(&mut self, req_id: RequestId, device_id: &str) -> Option<ControlRequest> {
        let request = match (self.main, self.control) {
            (Main::Activating { req_id: None }, _) => {
                self.set_main(Main::Activating { req_id: Some(req_id) });
                self.activate_request(req_id, device_id)
            }
            (Main::Active, Control::Unsubscribe) => {
                self.unsubscribe.encode(req_id)?;
                ControlRequest::new(req_id)
                    .param("LS_op", "deactivate")
                    .param("PN_deviceId", device_id)
                    .param_opt("PN_subscriptionId", self.mpn_sub_id.as_deref())
            }
            (Main::Active, Control::Format) => {
                let format = self.format.encode(req_id)?.clone();
                ControlRequest::new(req_id)
                    .param("LS_op", "pn_reconf")
                    .param_opt("PN_subscriptionId", self.mpn_sub_id.as_deref())
                    .param("PN_notificationFormat", format)
            }
            (Main::Active, Control::Trigger) => {
                let trigger = self.trigger.encode(req_id)?.clone();
                ControlRequest::new(req_id)
                    .param("LS_op", "pn_reconf")
                    .param_opt("PN_subscriptionId", self.mpn_sub_id.as_deref())
                    .param("PN_trigger", trigger.unwrap_or_default())
            }
            _ => return None,
        };
        tracing::debug!(parent: &self.span, %req_id, op = ?request.op(), "encoded mpn request");
        Some(request)
    }

    fn activate_request(&self, req_id: RequestId, device_id: &str) -> ControlRequest {
        let c = &self.config;
        ControlRequest::new(req_id)
            .param("LS_op", "activate")
            .param("LS_subId", self.sub_id)
            .param("LS_mode", c.mode)
            .param("LS_group", &c.group)
            .param("LS_schema", &c.schema)
            .param_opt("LS_data_adapter", c.data_adapter.as_deref())
            .param("PN_deviceId", device_id)
            .param("PN_notificationFormat", &c.notification_format)
            .param_opt("PN_trigger", c.trigger.as_deref())
            .param_if(c.coalescing, "PN_coalescing", "true")
            .param_opt("LS_requested_buffer_size", c.buffer_size)
            .param_opt("LS_requested_max_frequency", c.max_frequency)
    }

    pub(crate) fn on_req_ok(&mut self, req_id: RequestId, out: &mut Vec<MpnOutput>) {
        if self.main == (Main::Activating { req_id: Some(req_id) }) {
            // MPNOK completes the activation
            tracing::trace!(parent: &self.span, %req_id, "activate acknowledged");
        } else if self.unsubscribe.is_in_flight(req_id) {
            self.unsubscribe.finish();
            out.push(MpnOutput::Event(MpnEvent::Unsubscribed));
            self.finalize(Terminal::Deleted, out);
        } else if self.format.is_in_flight(req_id) {
            if let Some(format) = self.format.finish() {
                self.config.notification_format = format;
                out.push(MpnOutput::Event(MpnEvent::PropertyChanged("notification_format")));
            }
            self.control = Control::Idle;
            self.reconcile_control(out);
        } else if self.trigger.is_in_flight(req_id) {
            if let Some(trigger) = self.trigger.finish() {
                self.config.trigger = trigger;
                out.push(MpnOutput::Event(MpnEvent::PropertyChanged("trigger")));
            }
            self.control = Control::Idle;
            self.reconcile_control(out);
        } else {
            tracing::trace!(parent: &self.span, %req_id, "stale REQOK ignored");
        }
    }

    pub(crate) fn on_req_err(&mut self, req_id: RequestId, code: i32, message: &str, out: &mut Vec<MpnOutput>) {
        if self.main == (Main::Activating { req_id: Some(req_id) }) {
            tracing::warn!(parent: &self.span, code, reason = message, "mpn activation refused");
            out.push(MpnOutput::Event(MpnEvent::SubscriptionError {
                code,
                message: message.to_string(),
            }));
            self.finalize(Terminal::Failed, out);
        } else if self.unsubscribe.is_in_flight(req_id) {
            tracing::warn!(parent: &self.span, code, reason = message, "mpn deactivation refused");
            self.unsubscribe.finish();
            out.push(MpnOutput::Event(MpnEvent::UnsubscriptionError {
                code,
                message: message.to_string(),
            }));
            self.control = Control::Idle;
            self.reconcile_control(out);
        } else if self.format.is_in_flight(req_id) || self.trigger.is_in_flight(req_id) {
            let property = if self.format.is_in_flight(req_id) {
                self.format.finish();
                "notification_format"
            } else {
                self.trigger.finish();
                "trigger"
            };
            tracing::warn!(parent: &self.span, code, reason = message, property, "mpn modification refused");
            out.push(MpnOutput::Event(MpnEvent::ModificationError {
                code,
                message: message.to_string(),
                property,
            }));
            self.control = Control::Idle;
            self.reconcile_control(out);
        } else {
            tracing::trace!(parent: &self.span, %req_id, "stale REQERR ignored");
        }
    }

    /// `MPNOK`: the server created the MPN subscription.
    pub(crate) fn on_mpn_ok(&mut self, mpn_sub_id: &str, out: &mut Vec<MpnOutput>) {
        if !matches!(self.main, Main::Activating { req_id: Some(_) }) {
            tracing::trace!(parent: &self.span, main = ?self.main, "MPNOK ignored");
            return;
        }
        self.mpn_sub_id = Some(mpn_sub_id.to_string());
        self.set_main(Main::Active);
        self.abort = AbortRegion::Open;
        self.status_open = true;
        out.push(MpnOutput::Event(MpnEvent::Subscribed));
        out.push(MpnOutput::OpenStatus {
            mpn_sub_id: mpn_sub_id.to_string(),
        });
        self.reconcile_control(out);
    }

    /// `MPNDEL`, or the end of the status stream.
    pub(crate) fn on_deleted(&mut self, out: &mut Vec<MpnOutput>) {
        if self.main != Main::Active {
            tracing::trace!(parent: &self.span, main = ?self.main, "deletion ignored");
            return;
        }
        out.push(MpnOutput::Event(MpnEvent::Unsubscribed));
        self.finalize(Terminal::Deleted, out);
    }

    /// The status item subscription ended on the server side.
    pub(crate) fn on_status_end(&mut self, out: &mut Vec<MpnOutput>) {
        self.status_open = false;
        self.on_deleted(out);
    }

    /// Update of the status item.
    pub(crate) fn on_status_update(&mut self, update: &ItemUpdate, out: &mut Vec<MpnOutput>) {
        if self.main != Main::Active {
            return;
        }
        let timestamp = update.value_by_name("status_timestamp");
        if let Some(status) = update.value_by_name("status") {
            let next = match status.as_str() {
                "TRIGGERED" => Status::Triggered,
                _ => Status::Subscribed,
            };
            if next != self.status {
                tracing::debug!(parent: &self.span, from = ?self.status, to = ?next, "mpn status");
                self.status = next;
                out.push(MpnOutput::Event(MpnEvent::StatusChanged {
                    status,
                    timestamp: timestamp.as_deref().and_then(|t| t.parse().ok()),
                }));
                if next == Status::Triggered {
                    out.push(MpnOutput::Event(MpnEvent::Triggered));
                }
            }
        }
        if timestamp.is_some() && timestamp != self.status_timestamp {
            self.status_timestamp = timestamp;
            out.push(MpnOutput::Event(MpnEvent::PropertyChanged("status_timestamp")));
        }
        if let Some(format) = update.value_by_name("notification_format") {
            if format != self.config.notification_format {
                self.config.notification_format = format;
                out.push(MpnOutput::Event(MpnEvent::PropertyChanged("notification_format")));
            }
        }
        if update.is_value_changed_by_name("trigger") {
            let trigger = update.value_by_name("trigger").filter(|t| !t.is_empty());
            if trigger != self.config.trigger {
                self.config.trigger = trigger;
                out.push(MpnOutput::Event(MpnEvent::PropertyChanged("trigger")));
            }
        }
    }

    /// The session ended.
    pub(crate) fn abort(&mut self, out: &mut Vec<MpnOutput>) {
        match self.main {
            Main::Activating { .. } => self.set_main(Main::WaitingDevice),
            Main::Active if self.abort == AbortRegion::Open => {
                self.abort = AbortRegion::Closed;
                self.status_open = false;
                for (pending, property) in [
                    (self.format.clear(), "notification_format"),
                    (self.trigger.clear(), "trigger"),
                ] {
                    if pending {
                        out.push(MpnOutput::Event(MpnEvent::ModificationError {
                            code: ABORTED,
                            message: "aborted".to_string(),
                            property,
                        }));
                    }
                }
                if self.unsubscribe.clear() {
                    out.push(MpnOutput::Event(MpnEvent::UnsubscriptionError {
                        code: ABORTED,
                        message: "aborted".to_string(),
                    }));
                }
                self.control = Control::Idle;
            }
            _ => {}
        }
    }

    /// The status subscription was re-created after a session change.
    pub(crate) fn status_reopened(&mut self) {
        if self.main == Main::Active {
            self.status_open = true;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    fn manager() -> MpnSubscriptionManager {
        MpnSubscriptionManager::new(
            SubscriptionId::new(3),
            MpnSubscriptionConfig::new(SubscriptionMode::Merge, "item1", "last_price", "{\"aps\":{}}"),
            Span::none(),
        )
    }

    fn active() -> MpnSubscriptionManager {
        let mut m = manager();
        let mut out = Vec::new();
        m.device_ready(&mut out);
        m.encode(RequestId::new(1), "dev").unwrap();
        m.on_req_ok(RequestId::new(1), &mut out);
        m.on_mpn_ok("mpn7", &mut out);
        assert_eq!(m.main(), Main::Active);
        m
    }

    fn events(out: &[MpnOutput]) -> Vec<&MpnEvent> {
        out.iter()
            .filter_map(|o| match o {
                MpnOutput::Event(e) => Some(e),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn device_registration() {
        let mut device = MpnDevice::new(MpnDeviceConfig::new("Apple", "com.example", "tok"), Span::none());
        assert!(device.register());
        assert!(!device.register());
        let req = device.encode(RequestId::new(4)).unwrap();
        assert_eq!(
            req.to_query_string(),
            "LS_reqId=4&LS_op=register&PN_type=Apple&PN_appId=com.example&PN_deviceToken=tok"
        );
        assert_eq!(
            device.on_registered("d1", "MPN"),
            Some(DeviceEvent::Registered { device_id: "d1".into() })
        );
        assert_eq!(device.registration(), Some(("d1", "MPN")));
        device.abort();
        assert_eq!(device.status(), DeviceStatus::Unregistered);
    }

    #[test]
    fn device_refusal() {
        let mut device = MpnDevice::new(MpnDeviceConfig::new("Google", "app", "tok"), Span::none());
        device.register();
        device.encode(RequestId::new(1));
        assert_eq!(device.on_req_err(RequestId::new(9), 1, "x"), None);
        assert_matches!(
            device.on_req_err(RequestId::new(1), 46, "bad token"),
            Some(DeviceEvent::Failed { code: 46, .. })
        );
        assert_eq!(device.status(), DeviceStatus::Failed);
    }

    #[test]
    fn activation_waits_for_device() {
        let mut m = manager();
        assert_eq!(m.encode(RequestId::new(1), "dev"), None);
        let mut out = Vec::new();
        m.device_ready(&mut out);
        assert_eq!(out, vec![MpnOutput::RequestReady]);
        let req = m.encode(RequestId::new(1), "dev").unwrap();
        assert_eq!(req.op(), Some("activate"));
        assert_eq!(req.get("LS_subId"), Some("3"));
        assert_eq!(req.get("PN_deviceId"), Some("dev"));
        assert!(!req.params.contains("PN_coalescing"));

        let mut out = Vec::new();
        m.on_mpn_ok("mpn7", &mut out);
        assert_matches!(events(&out)[..], [MpnEvent::Subscribed]);
        assert!(out.contains(&MpnOutput::OpenStatus { mpn_sub_id: "mpn7".into() }));
        assert_eq!(m.status(), MpnSubscriptionStatus::Subscribed);
    }

    #[test]
    fn control_priority() {
        let mut m = active();
        let mut out = Vec::new();
        m.set_trigger(Some("Double.parseDouble(${last_price}) > 10".into()), &mut out);
        assert_eq!(m.control(), Control::Trigger);
        let req = m.encode(RequestId::new(2), "dev").unwrap();
        assert_eq!(req.op(), Some("pn_reconf"));
        assert_eq!(req.get("PN_subscriptionId"), Some("mpn7"));

        m.set_notification_format("{}".into(), &mut out);
        m.unsubscribe(&mut out);
        assert_eq!(m.control(), Control::Trigger);
        assert_eq!(m.encode(RequestId::new(3), "dev"), None);

        let mut out = Vec::new();
        m.on_req_ok(RequestId::new(2), &mut out);
        assert_eq!(m.control(), Control::Unsubscribe);
        let req = m.encode(RequestId::new(4), "dev").unwrap();
        assert_eq!(req.op(), Some("deactivate"));

        let mut out = Vec::new();
        m.on_req_err(RequestId::new(4), 20, "not now", &mut out);
        assert_matches!(events(&out)[..], [MpnEvent::UnsubscriptionError { code: 20, .. }]);
        assert_eq!(m.control(), Control::Format);
    }

    #[test]
    fn abort_cascades_into_pending_modifications() {
        let mut m = active();
        let mut out = Vec::new();
        m.set_notification_format("{}".into(), &mut out);
        m.encode(RequestId::new(2), "dev");
        m.unsubscribe(&mut out);

        let mut out = Vec::new();
        m.abort(&mut out);
        assert_matches!(
            events(&out)[..],
            [
                MpnEvent::ModificationError { code: ABORTED, property: "notification_format", .. },
                MpnEvent::UnsubscriptionError { code: ABORTED, .. },
            ]
        );
        assert_eq!(m.control(), Control::Idle);

        let mut out = Vec::new();
        m.abort(&mut out);
        assert!(out.is_empty());
        m.on_req_ok(RequestId::new(2), &mut out);
        assert!(out.is_empty());
    }

    #[test]
    fn abort_while_activating_waits_for_device_again() {
        let mut m = manager();
        let mut out = Vec::new();
        m.device_ready(&mut out);
        m.encode(RequestId::new(1), "dev");
        m.abort(&mut out);
        assert_eq!(m.main(), Main::WaitingDevice);
    }

    #[test]
    fn modifications_between_sessions_wait_for_the_device() {
        let mut m = active();
        let mut out = Vec::new();
        m.abort(&mut out);

        let mut out = Vec::new();
        m.set_trigger(Some("x".into()), &mut out);
        m.unsubscribe(&mut out);
        assert!(out.is_empty());
        assert_eq!(m.control(), Control::Idle);
        assert_eq!(m.encode(RequestId::new(2), "dev"), None);

        m.device_ready(&mut out);
        assert_eq!(out, vec![MpnOutput::RequestReady]);
        assert_eq!(m.control(), Control::Unsubscribe);
        let req = m.encode(RequestId::new(2), "dev").unwrap();
        assert_eq!(req.op(), Some("deactivate"));
    }

    #[test]
    fn deletion_finalizes_like_unsubscribe() {
        let mut m = active();
        let mut out = Vec::new();
        m.on_deleted(&mut out);
        assert_eq!(
            out,
            vec![
                MpnOutput::Event(MpnEvent::Unsubscribed),
                MpnOutput::CloseStatus,
                MpnOutput::Finalized(Terminal::Deleted),
            ]
        );
        assert!(m.is_finalized());
    }

    #[test]
    fn unsubscribe_before_activation_sends_nothing() {
        let mut m = manager();
        let mut out = Vec::new();
        m.unsubscribe(&mut out);
        assert_eq!(out, vec![MpnOutput::Finalized(Terminal::Deleted)]);
    }

    #[test]
    fn cleared_trigger_is_sent_empty() {
        let mut m = active();
        let mut out = Vec::new();
        m.set_trigger(None, &mut out);
        let req = m.encode(RequestId::new(2), "dev").unwrap();
        assert_eq!(req.get("PN_trigger"), Some(""));
    }
}
