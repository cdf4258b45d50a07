//! The engine: single owner of every manager of one client.
//!
//! Managers never call each other. Each operation returns a batch of
//! outputs that the engine resolves through a work queue: listener
//! notifications go to the [`CallbackQueue`], request readiness goes to the
//! FIFO read by [`Engine::next_request`], and cross-manager effects (nested
//! second-level subscriptions, MPN status items) are looked up by id and
//! applied in turn.
//!
//! # Example
//!
//! ```rust
//! use std::sync::Arc;
//! use tlcp_client::config::{EngineConfig, SubscriptionConfig, Transport};
//! use tlcp_client::core::types::SubscriptionMode;
//! use tlcp_client::engine::Engine;
//! use tlcp_client::listener::SubscriptionListener;
//! use tlcp_client::update::ItemUpdate;
//!
//! struct Printer;
//!
//! impl SubscriptionListener for Printer {
//!     fn on_item_update(&self, update: &ItemUpdate) {
//!         println!("{:?}", update.value_by_name("last_price"));
//!     }
//! }
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let mut engine = Engine::new(EngineConfig::default().with_manual_dispatch(true))?;
//! let config = SubscriptionConfig::new(SubscriptionMode::Merge)
//!     .with_items(["item1"])
//!     .with_fields(["last_price"]);
//! engine.subscribe(config, Some(Arc::new(Printer)))?;
//!
//! engine.on_session_started(Transport::Http);
//! let add = engine.next_request().expect("add request");
//! assert_eq!(add.op(), Some("add"));
//!
//! engine.handle_line(&format!("REQOK,{}", add.req_id))?;
//! engine.handle_line("SUBOK,1,1,1")?;
//! engine.handle_line("U,1,1,12.5")?;
//! engine.callbacks().drain();
//! # Ok(())
//! # }
//! ```

use parking_lot::{Mutex, MutexGuard};
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::Arc;
use tracing::Span;
use tlcp_core::line::{ServerMessage, parse_line};
use tlcp_core::request::ControlRequest;
use tlcp_core::types::{
    IdGenerator, MessageHandle, MpnHandle, RequestId, RequestedMaxFrequency, SubscriptionHandle,
    SubscriptionId,
};

use crate::config::{
    EngineConfig, MessageOptions, MpnDeviceConfig, MpnSubscriptionConfig, SubscriptionConfig, Transport,
};
use crate::dispatch::CallbackQueue;
use crate::error::{ClientError, ClientResult};
use crate::listener::{ClientMessageListener, MpnDeviceListener, MpnSubscriptionListener, SubscriptionListener};
use crate::message::{MessageEvent, MessageFlow, MessageManager};
use crate::mpn::{
    DeviceEvent, DeviceStatus, Main, MpnDevice, MpnEvent, MpnOutput, MpnSubscriptionManager,
    MpnSubscriptionStatus,
};
use crate::subscription::{
    Output, SubscriptionEvent, SubscriptionManager, SubscriptionStatus, Terminal,
};

/// Finished subscription ids remembered to tell late events from zombies.
const RETIRED_WINDOW: usize = 1024;

/// Who a subscription manager works for.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Owner {
    User(SubscriptionHandle),
    SecondLevel {
        parent: SubscriptionId,
        item: usize,
        key: String,
    },
    MpnStatus(MpnHandle),
}

/// A manager with a request to encode.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Requester {
    Subscription(SubscriptionId),
    Message(MessageHandle),
    Device,
    Mpn(MpnHandle),
    Zombie(SubscriptionId),
}

enum Work {
    Sub(SubscriptionId, Vec<Output>),
    Mpn(MpnHandle, Vec<MpnOutput>),
}

struct SubEntry {
    manager: SubscriptionManager,
    owner: Owner,
}

struct UserSubscription {
    config: SubscriptionConfig,
    listener: Option<Arc<dyn SubscriptionListener>>,
    /// Current manager; `None` until re-created after an abort.
    sub_id: Option<SubscriptionId>,
}

struct MessageEntry {
    manager: MessageManager,
    listener: Option<Arc<dyn ClientMessageListener>>,
}

struct MpnEntry {
    manager: MpnSubscriptionManager,
    listener: Option<Arc<dyn MpnSubscriptionListener>>,
    status_sub: Option<SubscriptionId>,
}

/// Registry of every manager of one client instance.
pub struct Engine {
    config: EngineConfig,
    request_ids: IdGenerator,
    sub_ids: IdGenerator,
    handles: IdGenerator,
    /// Highest handle issued. Lower handles missing from the maps were released.
    last_handle: u64,
    transport: Option<Transport>,
    subscriptions: BTreeMap<SubscriptionId, SubEntry>,
    users: BTreeMap<SubscriptionHandle, UserSubscription>,
    second_levels: BTreeMap<(SubscriptionId, usize, String), SubscriptionId>,
    messages: BTreeMap<MessageHandle, MessageEntry>,
    by_prog: HashMap<(String, u64), MessageHandle>,
    sequences: HashMap<String, u64>,
    device: Option<MpnDevice>,
    device_listener: Option<Arc<dyn MpnDeviceListener>>,
    mpn: BTreeMap<MpnHandle, MpnEntry>,
    mpn_by_sub_id: HashMap<SubscriptionId, MpnHandle>,
    pending: HashMap<RequestId, Requester>,
    ready: VecDeque<Requester>,
    zombies: BTreeSet<SubscriptionId>,
    retired: BTreeSet<SubscriptionId>,
    callbacks: CallbackQueue,
    span: Span,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("transport", &self.transport)
            .field("subscriptions", &self.subscriptions.len())
            .field("messages", &self.messages.len())
            .field("mpn", &self.mpn.len())
            .field("ready", &self.ready.len())
            .finish()
    }
}

impl Engine {
    /// Create an engine with its own `tlcp_engine` span.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::Dispatcher`] if the callback thread cannot be
    /// started.
    pub fn new(config: EngineConfig) -> ClientResult<Self> {
        Self::with_span(config, tracing::info_span!("tlcp_engine"))
    }

    /// Create an engine logging under `span`.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::Dispatcher`] if the callback thread cannot be
    /// started.
    pub fn with_span(config: EngineConfig, span: Span) -> ClientResult<Self> {
        let callbacks = if config.manual_dispatch {
            CallbackQueue::manual()
        } else {
            CallbackQueue::spawn(&config.dispatcher_thread_name)?
        };
        Ok(Self {
            config,
            request_ids: IdGenerator::new(),
            sub_ids: IdGenerator::new(),
            handles: IdGenerator::new(),
            last_handle: 0,
            transport: None,
            subscriptions: BTreeMap::new(),
            users: BTreeMap::new(),
            second_levels: BTreeMap::new(),
            messages: BTreeMap::new(),
            by_prog: HashMap::new(),
            sequences: HashMap::new(),
            device: None,
            device_listener: None,
            mpn: BTreeMap::new(),
            mpn_by_sub_id: HashMap::new(),
            pending: HashMap::new(),
            ready: VecDeque::new(),
            zombies: BTreeSet::new(),
            retired: BTreeSet::new(),
            callbacks,
            span,
        })
    }

    /// Queue running listener callbacks.
    pub fn callbacks(&self) -> &CallbackQueue {
        &self.callbacks
    }

    /// Transport of the open session, if any.
    pub fn transport(&self) -> Option<Transport> {
        self.transport
    }

    fn next_handle<T: From<u64>>(&mut self) -> T {
        let raw: u64 = self.handles.next();
        self.last_handle = raw;
        T::from(raw)
    }

    fn issued(&self, raw: u64) -> bool {
        raw != 0 && raw <= self.last_handle
    }

    fn retire(&mut self, sub_id: SubscriptionId) {
        self.retired.insert(sub_id);
        if self.retired.len() > RETIRED_WINDOW {
            self.retired.pop_first();
        }
    }

    // ---- subscriptions ----

    /// Add a subscription. It activates now if a session is open, otherwise
    /// on the next [`on_session_started`](Self::on_session_started).
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::InvalidConfig`] if `config` does not validate.
    pub fn subscribe(
        &mut self,
        config: SubscriptionConfig,
        listener: Option<Arc<dyn SubscriptionListener>>,
    ) -> ClientResult<SubscriptionHandle> {
        config.validate()?;
        let handle: SubscriptionHandle = self.next_handle();
        if let Some(listener) = listener.clone() {
            self.callbacks.enqueue(move || listener.on_listen_start());
        }
        self.users.insert(
            handle,
            UserSubscription {
                config: config.clone(),
                listener,
                sub_id: None,
            },
        );
        let sub_id = self.create_subscription(config, Owner::User(handle));
        tracing::debug!(parent: &self.span, %handle, %sub_id, "subscription added");
        Ok(handle)
    }

    /// The user subscription behind `handle`; `None` once it terminated.
    fn user(&self, handle: SubscriptionHandle) -> ClientResult<Option<&UserSubscription>> {
        match self.users.get(&handle) {
            Some(user) => Ok(Some(user)),
            None if self.issued(handle.get()) => Ok(None),
            None => Err(ClientError::UnknownSubscription(handle)),
        }
    }

    fn user_manager(&self, handle: SubscriptionHandle) -> ClientResult<Option<&SubscriptionManager>> {
        Ok(self
            .user(handle)?
            .and_then(|user| user.sub_id)
            .and_then(|id| self.subscriptions.get(&id))
            .map(|e| &e.manager))
    }

    /// Remove a subscription. Removing a terminated one does nothing.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::UnknownSubscription`] for a handle this engine
    /// never issued.
    pub fn unsubscribe(&mut self, handle: SubscriptionHandle) -> ClientResult<()> {
        let Some(sub_id) = self.user(handle)?.map(|user| user.sub_id) else {
            return Ok(());
        };
        match sub_id {
            Some(sub_id) => {
                let mut out = Vec::new();
                if let Some(entry) = self.subscriptions.get_mut(&sub_id) {
                    entry.manager.unsubscribe(&mut out);
                }
                self.drive(Work::Sub(sub_id, out));
            }
            None => {
                let listener = self.users.remove(&handle).and_then(|user| user.listener);
                tracing::debug!(parent: &self.span, %handle, "subscription removed between sessions");
                if let Some(listener) = listener {
                    self.callbacks.enqueue(move || listener.on_listen_end());
                }
            }
        }
        Ok(())
    }

    /// Change the requested max frequency of a live subscription and of its
    /// second-level subscriptions.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::UnknownSubscription`] or
    /// [`ClientError::InvalidConfig`] for an invalid frequency.
    pub fn set_requested_max_frequency(
        &mut self,
        handle: SubscriptionHandle,
        frequency: Option<RequestedMaxFrequency>,
    ) -> ClientResult<()> {
        let issued = self.issued(handle.get());
        let Some(user) = self.users.get_mut(&handle) else {
            return if issued {
                Ok(())
            } else {
                Err(ClientError::UnknownSubscription(handle))
            };
        };
        let mut candidate = user.config.clone();
        candidate.max_frequency = frequency;
        candidate.validate()?;
        user.config = candidate;
        let Some(sub_id) = user.sub_id else {
            return Ok(());
        };
        let nested: Vec<SubscriptionId> = self
            .second_levels
            .iter()
            .filter(|((parent, _, _), _)| *parent == sub_id)
            .map(|(_, id)| *id)
            .collect();
        for id in std::iter::once(sub_id).chain(nested) {
            let mut out = Vec::new();
            if let Some(entry) = self.subscriptions.get_mut(&id) {
                entry.manager.set_requested_max_frequency(frequency, &mut out);
            }
            self.drive(Work::Sub(id, out));
        }
        Ok(())
    }

    /// Lifecycle of a subscription.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::UnknownSubscription`].
    pub fn subscription_status(&self, handle: SubscriptionHandle) -> ClientResult<SubscriptionStatus> {
        if self.user(handle)?.is_none() {
            return Ok(SubscriptionStatus::Terminated);
        }
        Ok(self
            .user_manager(handle)?
            .map_or(SubscriptionStatus::Inactive, SubscriptionManager::status))
    }

    /// Current value of a field (1-based positions).
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::UnknownSubscription`].
    pub fn value(&self, handle: SubscriptionHandle, item: usize, field: usize) -> ClientResult<Option<String>> {
        Ok(self
            .user_manager(handle)?
            .and_then(SubscriptionManager::strategy)
            .and_then(|s| s.value(item, field)))
    }

    /// Current value of a field of a COMMAND row.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::UnknownSubscription`].
    pub fn command_value(
        &self,
        handle: SubscriptionHandle,
        item: usize,
        key: &str,
        field: usize,
    ) -> ClientResult<Option<String>> {
        Ok(self
            .user_manager(handle)?
            .and_then(SubscriptionManager::strategy)
            .and_then(|s| s.command_value(item, key, field)))
    }

    /// Position of the `key` field of a COMMAND subscription, once subscribed.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::UnknownSubscription`].
    pub fn key_position(&self, handle: SubscriptionHandle) -> ClientResult<Option<usize>> {
        Ok(self
            .user_manager(handle)?
            .and_then(SubscriptionManager::strategy)
            .and_then(|s| s.key_position()))
    }

    /// Position of the `command` field of a COMMAND subscription, once
    /// subscribed.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::UnknownSubscription`].
    pub fn command_position(&self, handle: SubscriptionHandle) -> ClientResult<Option<usize>> {
        Ok(self
            .user_manager(handle)?
            .and_then(SubscriptionManager::strategy)
            .and_then(|s| s.command_position()))
    }

    fn create_subscription(&mut self, config: SubscriptionConfig, owner: Owner) -> SubscriptionId {
        let sub_id: SubscriptionId = self.sub_ids.next();
        let span = tracing::debug_span!(parent: &self.span, "subscription", %sub_id);
        if let Owner::User(handle) = &owner {
            if let Some(user) = self.users.get_mut(handle) {
                user.sub_id = Some(sub_id);
            }
        }
        let mut entry = SubEntry {
            manager: SubscriptionManager::new(sub_id, config, span),
            owner,
        };
        let mut out = Vec::new();
        if self.transport.is_some() {
            entry.manager.activate(&mut out);
        }
        self.subscriptions.insert(sub_id, entry);
        self.drive(Work::Sub(sub_id, out));
        sub_id
    }

    // ---- messages ----

    /// Send a message. Without an open session the message is aborted
    /// right away.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::InvalidSequence`] for a bad sequence name.
    pub fn send_message(
        &mut self,
        text: impl Into<String>,
        options: MessageOptions,
        listener: Option<Arc<dyn ClientMessageListener>>,
    ) -> ClientResult<MessageHandle> {
        options.validate()?;
        let handle: MessageHandle = self.next_handle();
        let flow = MessageFlow::new(listener.is_some(), options.sequence.is_some());
        let sequence = options
            .sequence
            .clone()
            .unwrap_or_else(|| tlcp_core::line::UNORDERED_MESSAGES.to_string());
        let prog = flow.is_progressive().then(|| {
            let counter = self.sequences.entry(sequence.clone()).or_insert(0);
            *counter += 1;
            *counter
        });
        let span = tracing::debug_span!(parent: &self.span, "message", %handle);
        let mut manager = MessageManager::new(text, options.sequence, prog, options.delay_timeout, flow, span);

        if self.transport.is_none() {
            tracing::debug!(parent: &self.span, %handle, "no session, message aborted");
            if let Some(event) = manager.abort() {
                self.notify_message(listener.as_ref(), manager.text(), event);
            }
            return Ok(handle);
        }
        if let Some(prog) = manager.prog() {
            self.by_prog.insert((manager.sequence().to_string(), prog), handle);
        }
        self.messages.insert(handle, MessageEntry { manager, listener });
        self.ready.push_back(Requester::Message(handle));
        Ok(handle)
    }

    fn notify_message(
        &self,
        listener: Option<&Arc<dyn ClientMessageListener>>,
        text: &str,
        event: MessageEvent,
    ) {
        let Some(listener) = listener.cloned() else {
            return;
        };
        let text = text.to_string();
        self.callbacks.enqueue(move || match event {
            MessageEvent::Processed { response } => listener.on_processed(&text, &response),
            MessageEvent::Discarded => listener.on_discarded(&text),
            MessageEvent::Denied { code, message } => listener.on_deny(&text, code, &message),
            MessageEvent::Failed => listener.on_error(&text),
            MessageEvent::Aborted { sent_on_network } => listener.on_abort(&text, sent_on_network),
        });
    }

    fn settle_message(&mut self, handle: MessageHandle, event: Option<MessageEvent>) {
        let Some(entry) = self.messages.get(&handle) else {
            return;
        };
        if let Some(event) = event {
            self.notify_message(entry.listener.as_ref(), entry.manager.text(), event);
        }
        if entry.manager.is_finished() {
            if let Some(entry) = self.messages.remove(&handle) {
                if let Some(prog) = entry.manager.prog() {
                    self.by_prog.remove(&(entry.manager.sequence().to_string(), prog));
                }
            }
        }
    }

    // ---- MPN ----

    /// Register the device for push notifications. MPN subscriptions
    /// activate once the server confirms the registration.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::InvalidConfig`] for an incomplete device.
    pub fn register_device(
        &mut self,
        config: MpnDeviceConfig,
        listener: Option<Arc<dyn MpnDeviceListener>>,
    ) -> ClientResult<()> {
        config.validate()?;
        let span = tracing::debug_span!(parent: &self.span, "mpn_device", platform = %config.platform);
        let mut device = MpnDevice::new(config, span);
        if self.transport.is_some() && device.register() {
            self.ready.push_back(Requester::Device);
        }
        self.device = Some(device);
        self.device_listener = listener;
        Ok(())
    }

    /// Device registration status, once a device was given.
    pub fn device_status(&self) -> Option<DeviceStatus> {
        self.device.as_ref().map(MpnDevice::status)
    }

    /// Add an MPN subscription.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::DeviceNotRegistered`] before
    /// [`register_device`](Self::register_device), or
    /// [`ClientError::InvalidConfig`].
    pub fn mpn_subscribe(
        &mut self,
        config: MpnSubscriptionConfig,
        listener: Option<Arc<dyn MpnSubscriptionListener>>,
    ) -> ClientResult<MpnHandle> {
        config.validate()?;
        let Some(device) = &self.device else {
            return Err(ClientError::DeviceNotRegistered);
        };
        let registered = device.registration().is_some();
        let handle: MpnHandle = self.next_handle();
        let sub_id: SubscriptionId = self.sub_ids.next();
        let span = tracing::debug_span!(parent: &self.span, "mpn_subscription", %handle, %sub_id);
        if let Some(listener) = listener.clone() {
            self.callbacks.enqueue(move || listener.on_listen_start());
        }
        let mut manager = MpnSubscriptionManager::new(sub_id, config, span);
        let mut out = Vec::new();
        if registered && self.transport.is_some() {
            manager.device_ready(&mut out);
        }
        self.mpn_by_sub_id.insert(sub_id, handle);
        self.mpn.insert(
            handle,
            MpnEntry {
                manager,
                listener,
                status_sub: None,
            },
        );
        self.drive(Work::Mpn(handle, out));
        Ok(handle)
    }

    /// Run `f` on a live MPN subscription. Finalized ones are left alone.
    fn with_mpn<F>(&mut self, handle: MpnHandle, f: F) -> ClientResult<()>
    where
        F: FnOnce(&mut MpnSubscriptionManager, &mut Vec<MpnOutput>),
    {
        let issued = self.issued(handle.get());
        let Some(entry) = self.mpn.get_mut(&handle) else {
            return if issued {
                Ok(())
            } else {
                Err(ClientError::UnknownMpnSubscription(handle))
            };
        };
        let mut out = Vec::new();
        f(&mut entry.manager, &mut out);
        self.drive(Work::Mpn(handle, out));
        Ok(())
    }

    /// Deactivate an MPN subscription.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::UnknownMpnSubscription`].
    pub fn mpn_unsubscribe(&mut self, handle: MpnHandle) -> ClientResult<()> {
        self.with_mpn(handle, |m, out| m.unsubscribe(out))
    }

    /// Change the notification format.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::UnknownMpnSubscription`].
    pub fn set_notification_format(&mut self, handle: MpnHandle, format: impl Into<String>) -> ClientResult<()> {
        let format = format.into();
        self.with_mpn(handle, |m, out| m.set_notification_format(format, out))
    }

    /// Change or clear the trigger expression.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::UnknownMpnSubscription`].
    pub fn set_trigger(&mut self, handle: MpnHandle, trigger: Option<String>) -> ClientResult<()> {
        self.with_mpn(handle, |m, out| m.set_trigger(trigger, out))
    }

    /// Lifecycle of an MPN subscription.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::UnknownMpnSubscription`].
    pub fn mpn_status(&self, handle: MpnHandle) -> ClientResult<MpnSubscriptionStatus> {
        match self.mpn.get(&handle) {
            Some(entry) => Ok(entry.manager.status()),
            None if self.issued(handle.get()) => Ok(MpnSubscriptionStatus::Terminated),
            None => Err(ClientError::UnknownMpnSubscription(handle)),
        }
    }

    fn open_status(&mut self, handle: MpnHandle, mpn_sub_id: &str) {
        let Some((_, adapter)) = self.device.as_ref().and_then(MpnDevice::registration) else {
            tracing::warn!(parent: &self.span, %handle, "no device adapter for the MPN status item");
            return;
        };
        let config = MpnSubscriptionManager::status_config(mpn_sub_id, adapter);
        let sub_id = self.create_subscription(config, Owner::MpnStatus(handle));
        if let Some(entry) = self.mpn.get_mut(&handle) {
            entry.status_sub = Some(sub_id);
            entry.manager.status_reopened();
        }
    }

    fn device_registered(&mut self) {
        let handles: Vec<MpnHandle> = self.mpn.keys().copied().collect();
        for handle in handles {
            let mut reopen = None;
            let mut out = Vec::new();
            if let Some(entry) = self.mpn.get_mut(&handle) {
                entry.manager.device_ready(&mut out);
                if entry.manager.main() == Main::Active && entry.status_sub.is_none() {
                    reopen = entry.manager.mpn_sub_id().map(str::to_string);
                }
            }
            if let Some(mpn_sub_id) = reopen {
                self.open_status(handle, &mpn_sub_id);
            }
            self.drive(Work::Mpn(handle, out));
        }
    }

    fn device_failed(&mut self, code: i32, message: &str) {
        let handles: Vec<MpnHandle> = self.mpn.keys().copied().collect();
        for handle in handles {
            let mut out = Vec::new();
            if let Some(entry) = self.mpn.get_mut(&handle) {
                entry.manager.device_failed(code, message, &mut out);
            }
            self.drive(Work::Mpn(handle, out));
        }
    }

    fn notify_device(&self, event: DeviceEvent) {
        let Some(listener) = self.device_listener.clone() else {
            return;
        };
        self.callbacks.enqueue(move || match event {
            DeviceEvent::Registered { device_id } => listener.on_registered(&device_id),
            DeviceEvent::Failed { code, message } => listener.on_registration_failed(code, &message),
        });
    }

    // ---- session ----

    /// A session is open: activate everything waiting for one.
    pub fn on_session_started(&mut self, transport: Transport) {
        tracing::info!(parent: &self.span, ?transport, "session started");
        self.transport = Some(transport);
        self.sequences.clear();

        if let Some(device) = self.device.as_mut() {
            if device.register() {
                self.ready.push_back(Requester::Device);
            }
        }

        let recreate: Vec<(SubscriptionHandle, SubscriptionConfig)> = self
            .users
            .iter()
            .filter(|(_, u)| u.sub_id.is_none())
            .map(|(h, u)| (*h, u.config.clone()))
            .collect();
        let idle: Vec<SubscriptionId> = self.subscriptions.keys().copied().collect();
        for sub_id in idle {
            let mut out = Vec::new();
            if let Some(entry) = self.subscriptions.get_mut(&sub_id) {
                entry.manager.activate(&mut out);
            }
            self.drive(Work::Sub(sub_id, out));
        }
        for (handle, config) in recreate {
            let sub_id = self.create_subscription(config, Owner::User(handle));
            tracing::debug!(parent: &self.span, %handle, %sub_id, "subscription re-created");
        }
    }

    /// The session is gone: abort every manager. Subscriptions and MPN
    /// subscriptions resume on the next session.
    pub fn on_session_closed(&mut self) {
        tracing::info!(parent: &self.span, "session closed");
        self.transport = None;

        let ids: Vec<SubscriptionId> = self.subscriptions.keys().copied().collect();
        for sub_id in ids {
            let mut out = Vec::new();
            match self.subscriptions.get_mut(&sub_id) {
                Some(entry) => entry.manager.abort(&mut out),
                None => continue,
            }
            self.drive(Work::Sub(sub_id, out));
        }
        // nested subscriptions follow their parent, which starts over
        let orphans: Vec<SubscriptionId> = self
            .subscriptions
            .iter()
            .filter(|(_, e)| matches!(e.owner, Owner::SecondLevel { .. }))
            .map(|(id, _)| *id)
            .collect();
        for sub_id in orphans {
            self.subscriptions.remove(&sub_id);
            self.retire(sub_id);
        }
        self.second_levels.clear();

        let handles: Vec<MpnHandle> = self.mpn.keys().copied().collect();
        for handle in handles {
            let mut out = Vec::new();
            if let Some(entry) = self.mpn.get_mut(&handle) {
                entry.manager.abort(&mut out);
                entry.status_sub = None;
            }
            self.drive(Work::Mpn(handle, out));
        }
        if let Some(device) = self.device.as_mut() {
            device.abort();
        }

        let messages: Vec<MessageHandle> = self.messages.keys().copied().collect();
        for handle in messages {
            let event = self.messages.get_mut(&handle).and_then(|e| e.manager.abort());
            self.settle_message(handle, event);
        }
        self.messages.clear();
        self.by_prog.clear();

        self.pending.clear();
        self.ready.clear();
        self.zombies.clear();
    }

    /// Next control request to send, in the order managers became ready.
    /// `None` without a session.
    pub fn next_request(&mut self) -> Option<ControlRequest> {
        let transport = self.transport?;
        while let Some(requester) = self.ready.pop_front() {
            let req_id: RequestId = self.request_ids.next();
            let request = match &requester {
                Requester::Subscription(id) => self
                    .subscriptions
                    .get_mut(id)
                    .and_then(|e| e.manager.encode(req_id, transport)),
                Requester::Message(handle) => {
                    let request = self
                        .messages
                        .get_mut(handle)
                        .and_then(|e| e.manager.encode(req_id, transport));
                    if request.is_some() {
                        self.settle_message(*handle, None);
                    }
                    request
                }
                Requester::Device => self.device.as_mut().and_then(|d| d.encode(req_id)),
                Requester::Mpn(handle) => {
                    let device_id = self
                        .device
                        .as_ref()
                        .and_then(MpnDevice::registration)
                        .map(|(id, _)| id.to_string());
                    match (device_id, self.mpn.get_mut(handle)) {
                        (Some(device_id), Some(entry)) => entry.manager.encode(req_id, &device_id),
                        _ => None,
                    }
                }
                Requester::Zombie(id) => Some(
                    ControlRequest::new(req_id)
                        .param("LS_op", "delete")
                        .param("LS_subId", id)
                        .param("LS_cause", "zombie")
                        .param_if(transport.is_stream(), "LS_ack", "false"),
                ),
            };
            if let Some(request) = request {
                tracing::debug!(parent: &self.span, %req_id, ?requester, "request ready");
                // no response reaches a message already settled or an unacked zombie delete
                let tracked = match &requester {
                    Requester::Message(handle) => self.messages.contains_key(handle),
                    Requester::Zombie(_) => !transport.is_stream(),
                    _ => true,
                };
                if tracked {
                    self.pending.insert(req_id, requester);
                }
                return Some(request);
            }
        }
        None
    }

    // ---- inbound ----

    /// Parse and handle one server line.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::Protocol`] when the line cannot be decoded or
    /// its values cannot be reconciled. The managers stay as they were.
    pub fn handle_line(&mut self, line: &str) -> ClientResult<()> {
        let message = parse_line(line).inspect_err(|error| {
            tracing::warn!(parent: &self.span, %error, "malformed server line");
        })?;
        self.handle_message(message)
    }

    /// Handle one parsed server message.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::Protocol`] when an update cannot be applied.
    pub fn handle_message(&mut self, message: ServerMessage) -> ClientResult<()> {
        match message {
            ServerMessage::Update(update) => self.with_subscription(update.sub_id, |m, out| {
                m.on_update(update.item, &update.deltas, out)
            }),
            ServerMessage::SubOk { sub_id, items, fields } => {
                self.with_subscription(sub_id, |m, out| m.on_sub_ok(items, fields, out))
            }
            ServerMessage::SubCmd {
                sub_id,
                items,
                fields,
                key_pos,
                cmd_pos,
            } => self.with_subscription(sub_id, |m, out| m.on_sub_cmd(items, fields, key_pos, cmd_pos, out)),
            ServerMessage::Unsub { sub_id } => {
                if self.subscriptions.contains_key(&sub_id) {
                    self.with_subscription(sub_id, |m, out| {
                        m.on_unsub(out);
                        Ok(())
                    })
                } else {
                    tracing::trace!(parent: &self.span, %sub_id, "UNSUB for unknown subscription");
                    Ok(())
                }
            }
            ServerMessage::EndOfSnapshot { sub_id, item } => {
                self.with_subscription(sub_id, |m, out| m.on_end_of_snapshot(item, out))
            }
            ServerMessage::ClearSnapshot { sub_id, item } => {
                self.with_subscription(sub_id, |m, out| m.on_clear_snapshot(item, out))
            }
            ServerMessage::Overflow { sub_id, item, lost } => {
                self.with_subscription(sub_id, |m, out| m.on_overflow(item, lost, out))
            }
            ServerMessage::Conf { sub_id, frequency, .. } => self.with_subscription(sub_id, |m, out| {
                m.on_conf(frequency, out);
                Ok(())
            }),
            ServerMessage::ReqOk { req_id } => {
                self.on_req_ok(req_id);
                Ok(())
            }
            ServerMessage::ReqErr { req_id, code, message } => {
                self.on_req_err(req_id, code, &message);
                Ok(())
            }
            ServerMessage::MsgDone {
                sequence,
                prog,
                response,
            } => {
                if let Some(handle) = self.by_prog.get(&(sequence, prog)).copied() {
                    let event = self.messages.get_mut(&handle).and_then(|e| e.manager.on_done(&response));
                    self.settle_message(handle, event);
                }
                Ok(())
            }
            ServerMessage::MsgFail {
                sequence,
                prog,
                code,
                message,
            } => {
                if let Some(handle) = self.by_prog.get(&(sequence, prog)).copied() {
                    let event = self
                        .messages
                        .get_mut(&handle)
                        .and_then(|e| e.manager.on_fail(code, &message));
                    self.settle_message(handle, event);
                }
                Ok(())
            }
            ServerMessage::MpnReg { device_id, adapter } => {
                let event = self
                    .device
                    .as_mut()
                    .and_then(|d| d.on_registered(&device_id, &adapter));
                if let Some(event) = event {
                    self.notify_device(event);
                    self.device_registered();
                }
                Ok(())
            }
            ServerMessage::MpnOk { sub_id, mpn_sub_id } => {
                if let Some(handle) = self.mpn_by_sub_id.get(&sub_id).copied() {
                    self.with_mpn(handle, |m, out| m.on_mpn_ok(&mpn_sub_id, out))?;
                }
                Ok(())
            }
            ServerMessage::MpnDel { mpn_sub_id } => {
                let handle = self
                    .mpn
                    .iter()
                    .find(|(_, e)| e.manager.mpn_sub_id() == Some(mpn_sub_id.as_str()) && !e.manager.is_finalized())
                    .map(|(h, _)| *h);
                if let Some(handle) = handle {
                    self.with_mpn(handle, |m, out| m.on_deleted(out))?;
                }
                Ok(())
            }
            ServerMessage::Unhandled { tag } => {
                tracing::trace!(parent: &self.span, %tag, "line left to the session layer");
                Ok(())
            }
        }
    }

    fn with_subscription<F>(&mut self, sub_id: SubscriptionId, f: F) -> ClientResult<()>
    where
        F: FnOnce(&mut SubscriptionManager, &mut Vec<Output>) -> tlcp_core::ProtocolResult<()>,
    {
        let Some(entry) = self.subscriptions.get_mut(&sub_id) else {
            self.unknown_subscription(sub_id);
            return Ok(());
        };
        let mut out = Vec::new();
        let result = f(&mut entry.manager, &mut out);
        self.drive(Work::Sub(sub_id, out));
        result.map_err(|error| {
            tracing::warn!(parent: &self.span, %sub_id, %error, "server line rejected");
            ClientError::from(error)
        })
    }

    fn unknown_subscription(&mut self, sub_id: SubscriptionId) {
        if self.retired.contains(&sub_id) || self.mpn_by_sub_id.contains_key(&sub_id) {
            tracing::trace!(parent: &self.span, %sub_id, "event for a finished subscription");
            return;
        }
        if self.config.delete_zombies && self.transport.is_some() && self.zombies.insert(sub_id) {
            tracing::debug!(parent: &self.span, %sub_id, "deleting zombie subscription");
            self.ready.push_back(Requester::Zombie(sub_id));
        }
    }

    fn on_req_ok(&mut self, req_id: RequestId) {
        let Some(requester) = self.pending.remove(&req_id) else {
            tracing::trace!(parent: &self.span, %req_id, "REQOK for unknown request");
            return;
        };
        match requester {
            Requester::Subscription(id) => {
                let mut out = Vec::new();
                if let Some(entry) = self.subscriptions.get_mut(&id) {
                    entry.manager.on_req_ok(req_id, &mut out);
                }
                self.drive(Work::Sub(id, out));
            }
            Requester::Message(handle) => {
                if let Some(entry) = self.messages.get_mut(&handle) {
                    entry.manager.on_req_ok(req_id);
                }
                self.settle_message(handle, None);
            }
            Requester::Mpn(handle) => {
                if let Err(error) = self.with_mpn(handle, |m, out| m.on_req_ok(req_id, out)) {
                    tracing::trace!(parent: &self.span, %handle, %error, "REQOK for a dropped MPN subscription");
                }
            }
            Requester::Device | Requester::Zombie(_) => {}
        }
    }

    fn on_req_err(&mut self, req_id: RequestId, code: i32, message: &str) {
        let Some(requester) = self.pending.remove(&req_id) else {
            tracing::trace!(parent: &self.span, %req_id, "REQERR for unknown request");
            return;
        };
        match requester {
            Requester::Subscription(id) => {
                let mut out = Vec::new();
                if let Some(entry) = self.subscriptions.get_mut(&id) {
                    entry.manager.on_req_err(req_id, code, message, &mut out);
                }
                self.drive(Work::Sub(id, out));
            }
            Requester::Message(handle) => {
                let event = self
                    .messages
                    .get_mut(&handle)
                    .and_then(|e| e.manager.on_req_err(req_id, code, message));
                self.settle_message(handle, event);
            }
            Requester::Device => {
                let event = self.device.as_mut().and_then(|d| d.on_req_err(req_id, code, message));
                if let Some(event) = event {
                    self.notify_device(event);
                    self.device_failed(code, message);
                }
            }
            Requester::Mpn(handle) => {
                if let Err(error) = self.with_mpn(handle, |m, out| m.on_req_err(req_id, code, message, out)) {
                    tracing::trace!(parent: &self.span, %handle, %error, "REQERR for a dropped MPN subscription");
                }
            }
            Requester::Zombie(sub_id) => {
                tracing::debug!(parent: &self.span, %sub_id, code, reason = message, "zombie delete refused");
            }
        }
    }

    // ---- work queue ----

    fn drive(&mut self, first: Work) {
        let mut queue = VecDeque::from([first]);
        while let Some(work) = queue.pop_front() {
            match work {
                Work::Sub(sub_id, outputs) => {
                    let Some(owner) = self.subscriptions.get(&sub_id).map(|e| e.owner.clone()) else {
                        continue;
                    };
                    for output in outputs {
                        self.subscription_output(sub_id, &owner, output, &mut queue);
                    }
                }
                Work::Mpn(handle, outputs) => {
                    for output in outputs {
                        self.mpn_output(handle, output, &mut queue);
                    }
                }
            }
        }
    }

    fn subscription_output(
        &mut self,
        sub_id: SubscriptionId,
        owner: &Owner,
        output: Output,
        queue: &mut VecDeque<Work>,
    ) {
        match output {
            Output::RequestReady => {
                if self.transport.is_some() {
                    self.ready.push_back(Requester::Subscription(sub_id));
                }
            }
            Output::Event(event) => match owner {
                Owner::User(handle) => {
                    if let Some(listener) = self.users.get(handle).and_then(|u| u.listener.clone()) {
                        notify_subscription(&self.callbacks, listener, event);
                    }
                }
                Owner::SecondLevel { parent, item, key } => {
                    self.second_level_event(*parent, *item, key, event, queue);
                }
                Owner::MpnStatus(handle) => {
                    if let SubscriptionEvent::Update(update) = event {
                        if let Some(entry) = self.mpn.get_mut(handle) {
                            let mut out = Vec::new();
                            entry.manager.on_status_update(&update, &mut out);
                            queue.push_back(Work::Mpn(*handle, out));
                        }
                    }
                }
            },
            Output::OpenSecondLevel { item, key } => {
                let config = self
                    .subscriptions
                    .get(&sub_id)
                    .and_then(|e| e.manager.config().second_level_config(&key));
                if let Some(config) = config {
                    let owner = Owner::SecondLevel {
                        parent: sub_id,
                        item,
                        key: key.clone(),
                    };
                    let nested = self.create_subscription(config, owner);
                    tracing::debug!(parent: &self.span, %sub_id, item, %key, %nested, "second level opened");
                    self.second_levels.insert((sub_id, item, key), nested);
                }
            }
            Output::CloseSecondLevel { item, key } => {
                if let Some(nested) = self.second_levels.remove(&(sub_id, item, key)) {
                    let mut out = Vec::new();
                    if let Some(entry) = self.subscriptions.get_mut(&nested) {
                        entry.manager.unsubscribe(&mut out);
                    }
                    queue.push_back(Work::Sub(nested, out));
                }
            }
            Output::Finalized(terminal) => self.subscription_finalized(sub_id, owner, terminal, queue),
        }
    }

    fn second_level_event(
        &mut self,
        parent: SubscriptionId,
        item: usize,
        key: &str,
        event: SubscriptionEvent,
        queue: &mut VecDeque<Work>,
    ) {
        let Some(entry) = self.subscriptions.get_mut(&parent) else {
            return;
        };
        let manager = &mut entry.manager;
        let mut out = Vec::new();
        match event {
            SubscriptionEvent::Update(update) => manager.on_second_level_update(item, key, &update.values, &mut out),
            SubscriptionEvent::Error { code, message } => {
                manager.on_second_level_error(item, key, code, &message, &mut out);
            }
            SubscriptionEvent::RealMaxFrequency(frequency) => {
                manager.on_second_level_frequency(item, key, frequency, &mut out);
            }
            SubscriptionEvent::LostUpdates { lost, .. } => manager.on_second_level_lost_updates(key, lost, &mut out),
            _ => {}
        }
        queue.push_back(Work::Sub(parent, out));
    }

    fn subscription_finalized(
        &mut self,
        sub_id: SubscriptionId,
        owner: &Owner,
        terminal: Terminal,
        queue: &mut VecDeque<Work>,
    ) {
        self.subscriptions.remove(&sub_id);
        self.retire(sub_id);
        self.pending
            .retain(|_, r| *r != Requester::Subscription(sub_id));
        tracing::debug!(parent: &self.span, %sub_id, ?terminal, "subscription finalized");
        match owner {
            Owner::User(handle) => {
                if terminal == Terminal::Aborted {
                    if let Some(user) = self.users.get_mut(handle) {
                        user.sub_id = None;
                    }
                } else if let Some(listener) = self.users.remove(handle).and_then(|user| user.listener) {
                    self.callbacks.enqueue(move || listener.on_listen_end());
                }
            }
            Owner::SecondLevel { parent, item, key } => {
                let index = (*parent, *item, key.clone());
                if self.second_levels.get(&index) == Some(&sub_id) {
                    self.second_levels.remove(&index);
                }
            }
            Owner::MpnStatus(handle) => {
                if let Some(entry) = self.mpn.get_mut(handle) {
                    if entry.status_sub == Some(sub_id) {
                        entry.status_sub = None;
                        if terminal == Terminal::Deleted {
                            let mut out = Vec::new();
                            entry.manager.on_status_end(&mut out);
                            queue.push_back(Work::Mpn(*handle, out));
                        }
                    }
                }
            }
        }
    }

    fn mpn_output(&mut self, handle: MpnHandle, output: MpnOutput, queue: &mut VecDeque<Work>) {
        match output {
            MpnOutput::Event(event) => {
                if let Some(listener) = self.mpn.get(&handle).and_then(|e| e.listener.clone()) {
                    notify_mpn(&self.callbacks, listener, event);
                }
            }
            MpnOutput::RequestReady => {
                if self.transport.is_some() {
                    self.ready.push_back(Requester::Mpn(handle));
                }
            }
            MpnOutput::OpenStatus { mpn_sub_id } => self.open_status(handle, &mpn_sub_id),
            MpnOutput::CloseStatus => {
                let status = self.mpn.get_mut(&handle).and_then(|e| e.status_sub.take());
                if let Some(status) = status {
                    let mut out = Vec::new();
                    if let Some(entry) = self.subscriptions.get_mut(&status) {
                        entry.manager.unsubscribe(&mut out);
                    }
                    queue.push_back(Work::Sub(status, out));
                }
            }
            MpnOutput::Finalized(terminal) => {
                if let Some(entry) = self.mpn.remove(&handle) {
                    let sub_id = entry.manager.sub_id();
                    self.mpn_by_sub_id.remove(&sub_id);
                    self.retire(sub_id);
                }
                self.pending.retain(|_, r| *r != Requester::Mpn(handle));
                tracing::debug!(parent: &self.span, %handle, ?terminal, "mpn subscription finalized");
            }
        }
    }
}

fn notify_subscription(callbacks: &CallbackQueue, listener: Arc<dyn SubscriptionListener>, event: SubscriptionEvent) {
    callbacks.enqueue(move || match event {
        SubscriptionEvent::Subscribed => listener.on_subscription(),
        SubscriptionEvent::Error { code, message } => listener.on_subscription_error(code, &message),
        SubscriptionEvent::Unsubscribed => listener.on_unsubscription(),
        SubscriptionEvent::Update(update) => listener.on_item_update(&update),
        SubscriptionEvent::EndOfSnapshot { item_pos, item_name } => {
            listener.on_end_of_snapshot(item_name.as_deref(), item_pos);
        }
        SubscriptionEvent::ClearSnapshot { item_pos, item_name } => {
            listener.on_clear_snapshot(item_name.as_deref(), item_pos);
        }
        SubscriptionEvent::LostUpdates {
            item_pos,
            item_name,
            lost,
        } => listener.on_item_lost_updates(item_name.as_deref(), item_pos, lost),
        SubscriptionEvent::RealMaxFrequency(frequency) => listener.on_real_max_frequency(frequency),
        SubscriptionEvent::SecondLevelError { code, message, key } => {
            listener.on_second_level_subscription_error(code, &message, &key);
        }
        SubscriptionEvent::SecondLevelLostUpdates { lost, key } => {
            listener.on_second_level_lost_updates(lost, &key);
        }
    });
}

fn notify_mpn(callbacks: &CallbackQueue, listener: Arc<dyn MpnSubscriptionListener>, event: MpnEvent) {
    callbacks.enqueue(move || match event {
        MpnEvent::Subscribed => listener.on_subscription(),
        MpnEvent::Unsubscribed => listener.on_unsubscription(),
        MpnEvent::SubscriptionError { code, message } => listener.on_subscription_error(code, &message),
        MpnEvent::UnsubscriptionError { code, message } => listener.on_unsubscription_error(code, &message),
        MpnEvent::Triggered => listener.on_triggered(),
        MpnEvent::StatusChanged { status, timestamp } => listener.on_status_changed(&status, timestamp),
        MpnEvent::PropertyChanged(property) => listener.on_property_changed(property),
        MpnEvent::ModificationError {
            code,
            message,
            property,
        } => listener.on_modification_error(code, &message, property),
    });
}

/// Thread-safe handle to an [`Engine`].
///
/// Every operation locks the engine for its duration. Managers return their
/// effects instead of calling each other, so the lock is never re-entered.
/// Listener callbacks run on the callback queue after the lock is released.
#[derive(Clone)]
pub struct SharedEngine {
    inner: Arc<Mutex<Engine>>,
    callbacks: CallbackQueue,
}

impl std::fmt::Debug for SharedEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedEngine").finish_non_exhaustive()
    }
}

impl SharedEngine {
    /// Wrap a new engine.
    ///
    /// # Errors
    ///
    /// See [`Engine::new`].
    pub fn new(config: EngineConfig) -> ClientResult<Self> {
        Ok(Self::from(Engine::new(config)?))
    }

    /// Lock the engine.
    pub fn lock(&self) -> MutexGuard<'_, Engine> {
        self.inner.lock()
    }

    /// See [`Engine::subscribe`].
    ///
    /// # Errors
    ///
    /// See [`Engine::subscribe`].
    pub fn subscribe(
        &self,
        config: SubscriptionConfig,
        listener: Option<Arc<dyn SubscriptionListener>>,
    ) -> ClientResult<SubscriptionHandle> {
        self.lock().subscribe(config, listener)
    }

    /// See [`Engine::unsubscribe`].
    ///
    /// # Errors
    ///
    /// See [`Engine::unsubscribe`].
    pub fn unsubscribe(&self, handle: SubscriptionHandle) -> ClientResult<()> {
        self.lock().unsubscribe(handle)
    }

    /// See [`Engine::send_message`].
    ///
    /// # Errors
    ///
    /// See [`Engine::send_message`].
    pub fn send_message(
        &self,
        text: impl Into<String>,
        options: MessageOptions,
        listener: Option<Arc<dyn ClientMessageListener>>,
    ) -> ClientResult<MessageHandle> {
        self.lock().send_message(text, options, listener)
    }

    /// See [`Engine::handle_line`].
    ///
    /// # Errors
    ///
    /// See [`Engine::handle_line`].
    pub fn handle_line(&self, line: &str) -> ClientResult<()> {
        self.lock().handle_line(line)
    }

    /// See [`Engine::next_request`].
    pub fn next_request(&self) -> Option<ControlRequest> {
        self.lock().next_request()
    }

    /// See [`Engine::on_session_started`].
    pub fn on_session_started(&self, transport: Transport) {
        self.lock().on_session_started(transport);
    }

    /// See [`Engine::on_session_closed`].
    pub fn on_session_closed(&self) {
        self.lock().on_session_closed();
    }

    /// Wait until every queued callback has run. Runs without the engine
    /// lock, so callbacks may use this handle.
    pub fn flush_callbacks(&self) {
        self.callbacks.flush();
    }
}

impl From<Engine> for SharedEngine {
    fn from(engine: Engine) -> Self {
        let callbacks = engine.callbacks.clone();
        Self {
            inner: Arc::new(Mutex::new(engine)),
            callbacks,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tlcp_core::types::SubscriptionMode;

    fn engine() -> Engine {
        Engine::new(EngineConfig::default().with_manual_dispatch(true)).unwrap()
    }

    fn merge() -> SubscriptionConfig {
        SubscriptionConfig::new(SubscriptionMode::Merge)
            .with_items(["item1"])
            .with_fields(["a", "b"])
    }

    #[test]
    fn requests_wait_for_a_session() {
        let mut e = engine();
        let handle = e.subscribe(merge(), None).unwrap();
        assert_eq!(e.next_request(), None);
        assert_eq!(e.subscription_status(handle).unwrap(), SubscriptionStatus::Inactive);

        e.on_session_started(Transport::Http);
        let req = e.next_request().unwrap();
        assert_eq!(req.op(), Some("add"));
        assert_eq!(e.subscription_status(handle).unwrap(), SubscriptionStatus::Activating);
        assert_eq!(e.next_request(), None);
    }

    #[test]
    fn unknown_handles_are_errors() {
        let mut e = engine();
        assert!(matches!(
            e.unsubscribe(SubscriptionHandle::new(99)),
            Err(ClientError::UnknownSubscription(_))
        ));
        assert!(matches!(
            e.mpn_status(MpnHandle::new(5)),
            Err(ClientError::UnknownMpnSubscription(_))
        ));
    }

    #[test]
    fn retired_ids_are_not_zombies() {
        let mut e = engine();
        let handle = e.subscribe(merge(), None).unwrap();
        e.on_session_started(Transport::Http);
        let add = e.next_request().unwrap();
        e.handle_line(&format!("REQOK,{}", add.req_id)).unwrap();
        e.handle_line("SUBOK,1,1,2").unwrap();
        e.unsubscribe(handle).unwrap();
        let delete = e.next_request().unwrap();
        e.handle_line(&format!("REQOK,{}", delete.req_id)).unwrap();
        assert_eq!(e.subscription_status(handle).unwrap(), SubscriptionStatus::Terminated);

        e.handle_line("U,1,1,x|y").unwrap();
        assert_eq!(e.next_request(), None);
    }

    #[test]
    fn terminated_subscriptions_are_released() {
        let mut e = engine();
        let handle = e.subscribe(merge(), None).unwrap();
        e.unsubscribe(handle).unwrap();
        assert!(e.users.is_empty());
        assert!(e.subscriptions.is_empty());

        assert_eq!(e.subscription_status(handle).unwrap(), SubscriptionStatus::Terminated);
        assert_eq!(e.value(handle, 1, 1).unwrap(), None);
        assert!(e.unsubscribe(handle).is_ok());
        assert!(e.set_requested_max_frequency(handle, None).is_ok());
    }

    #[test]
    fn subscription_removed_between_sessions_is_released() {
        let mut e = engine();
        let handle = e.subscribe(merge(), None).unwrap();
        e.on_session_started(Transport::Http);
        let add = e.next_request().unwrap();
        e.handle_line(&format!("REQOK,{}", add.req_id)).unwrap();
        e.handle_line("SUBOK,1,1,2").unwrap();
        e.on_session_closed();

        e.unsubscribe(handle).unwrap();
        assert!(e.users.is_empty());
        e.on_session_started(Transport::Http);
        assert_eq!(e.next_request(), None);
    }

    #[test]
    fn finalized_mpn_subscriptions_are_released() {
        let mut e = engine();
        e.register_device(MpnDeviceConfig::new("Apple", "app", "tok"), None).unwrap();
        let handle = e
            .mpn_subscribe(MpnSubscriptionConfig::new(SubscriptionMode::Merge, "item1", "f", "fmt"), None)
            .unwrap();
        e.mpn_unsubscribe(handle).unwrap();
        assert!(e.mpn.is_empty());
        assert!(e.mpn_by_sub_id.is_empty());

        assert_eq!(e.mpn_status(handle).unwrap(), MpnSubscriptionStatus::Terminated);
        assert!(e.set_trigger(handle, None).is_ok());
        assert!(e.mpn_unsubscribe(handle).is_ok());
    }

    #[test]
    fn retired_ids_are_bounded() {
        let mut e = engine();
        for raw in 1..=(RETIRED_WINDOW as u64 + 10) {
            e.retire(SubscriptionId::new(raw));
        }
        assert_eq!(e.retired.len(), RETIRED_WINDOW);
        assert!(!e.retired.contains(&SubscriptionId::new(10)));
        assert!(e.retired.contains(&SubscriptionId::new(11)));
    }

    #[test]
    fn unacknowledged_requests_are_not_tracked() {
        let mut e = engine();
        e.on_session_started(Transport::Stream);
        e.send_message("hello", MessageOptions::new(), None).unwrap();
        let send = e.next_request().unwrap();
        assert_eq!(send.get("LS_ack"), Some("false"));

        e.handle_line("U,7,1,a").unwrap();
        let zombie = e.next_request().unwrap();
        assert_eq!(zombie.get("LS_cause"), Some("zombie"));
        assert!(e.pending.is_empty());
        assert!(e.messages.is_empty());
    }

    #[test]
    fn malformed_line_is_reported() {
        let mut e = engine();
        assert!(matches!(e.handle_line("U,1"), Err(ClientError::Protocol(_))));
    }
}
