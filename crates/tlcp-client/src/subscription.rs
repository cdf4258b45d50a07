//! Subscription manager: the control-request lifecycle of one subscription.
//!
//! ```text
//! Idle ──activate──▶ AddPending ──REQOK──▶ Added ──SUBOK──▶ Subscribed ──unsubscribe──▶ DeletePending
//!   ▲                  │    └──────────SUBOK──────────────────▲                           │ REQOK/REQERR/UNSUB
//!   └──────abort───────┴──────────────────┘                                               ▼
//!                                                                                Finalized(Deleted)
//! ```
//!
//! While subscribed, a configuration sub-machine keeps at most one `reconf`
//! in flight and re-checks the requested frequency after every round trip,
//! so rapid changes coalesce into the last value.
//!
//! The manager never calls other managers or listeners. Everything it wants
//! to happen is pushed as an [`Output`] and resolved by the engine.

use tracing::Span;
use tlcp_core::codec::DeltaMap;
use tlcp_core::error::ProtocolResult;
use tlcp_core::request::ControlRequest;
use tlcp_core::types::{RealMaxFrequency, RequestId, RequestedMaxFrequency, SubscriptionId};
use tlcp_core::values::ValueTable;

use crate::config::{SubscriptionConfig, Transport};
use crate::strategy::ModeStrategy;
use crate::update::ItemUpdate;

/// Listener-facing event produced by a subscription.
#[derive(Debug, Clone)]
pub(crate) enum SubscriptionEvent {
    Subscribed,
    Error {
        code: i32,
        message: String,
    },
    Unsubscribed,
    Update(ItemUpdate),
    EndOfSnapshot {
        item_pos: usize,
        item_name: Option<String>,
    },
    ClearSnapshot {
        item_pos: usize,
        item_name: Option<String>,
    },
    LostUpdates {
        item_pos: usize,
        item_name: Option<String>,
        lost: u64,
    },
    RealMaxFrequency(Option<RealMaxFrequency>),
    SecondLevelError {
        code: i32,
        message: String,
        key: String,
    },
    SecondLevelLostUpdates {
        lost: u64,
        key: String,
    },
}

/// How a manager ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Terminal {
    /// Deleted by the client or the server.
    Deleted,
    /// Refused by the server.
    Failed,
    /// The session ended while subscribed.
    Aborted,
}

/// Work for the engine.
#[derive(Debug)]
pub(crate) enum Output {
    Event(SubscriptionEvent),
    /// The manager has a request to encode.
    RequestReady,
    OpenSecondLevel {
        item: usize,
        key: String,
    },
    CloseSecondLevel {
        item: usize,
        key: String,
    },
    Finalized(Terminal),
}

/// Public view of the subscription lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionStatus {
    /// Waiting for a session.
    Inactive,
    /// Subscribe request queued or in flight.
    Activating,
    /// The server confirmed the subscription.
    Subscribed,
    /// Unsubscribe request queued or in flight.
    Unsubscribing,
    /// No longer active.
    Terminated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SubState {
    Idle,
    AddPending { req_id: Option<RequestId> },
    Added,
    Subscribed,
    DeletePending { req_id: Option<RequestId> },
    Finalized(Terminal),
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) enum ConfState {
    Idle,
    Pending {
        req_id: Option<RequestId>,
        frequency: Option<RequestedMaxFrequency>,
    },
}

#[derive(Debug)]
pub(crate) struct SubscriptionManager {
    sub_id: SubscriptionId,
    config: SubscriptionConfig,
    state: SubState,
    conf: ConfState,
    /// Frequency the server was last told about.
    sent_frequency: Option<RequestedMaxFrequency>,
    strategy: Option<ModeStrategy>,
    span: Span,
}

impl SubscriptionManager {
    pub(crate) fn new(sub_id: SubscriptionId, config: SubscriptionConfig, span: Span) -> Self {
        Self {
            sub_id,
            config,
            state: SubState::Idle,
            conf: ConfState::Idle,
            sent_frequency: None,
            strategy: None,
            span,
        }
    }

    pub(crate) fn config(&self) -> &SubscriptionConfig {
        &self.config
    }

    #[cfg(test)]
    pub(crate) fn state(&self) -> SubState {
        self.state
    }

    pub(crate) fn strategy(&self) -> Option<&ModeStrategy> {
        self.strategy.as_ref()
    }

    pub(crate) fn status(&self) -> SubscriptionStatus {
        match self.state {
            SubState::Idle => SubscriptionStatus::Inactive,
            SubState::AddPending { .. } | SubState::Added => SubscriptionStatus::Activating,
            SubState::Subscribed => SubscriptionStatus::Subscribed,
            SubState::DeletePending { .. } => SubscriptionStatus::Unsubscribing,
            SubState::Finalized(_) => SubscriptionStatus::Terminated,
        }
    }

    pub(crate) fn is_finalized(&self) -> bool {
        matches!(self.state, SubState::Finalized(_))
    }

    fn transition(&mut self, to: SubState) {
        tracing::debug!(parent: &self.span, from = ?self.state, to = ?to, "subscription transition");
        self.state = to;
    }

    fn finalize(&mut self, terminal: Terminal, out: &mut Vec<Output>) {
        self.transition(SubState::Finalized(terminal));
        self.conf = ConfState::Idle;
        out.push(Output::Finalized(terminal));
    }

    /// A session is available: queue the add request.
    pub(crate) fn activate(&mut self, out: &mut Vec<Output>) {
        if self.state == SubState::Idle {
            self.transition(SubState::AddPending { req_id: None });
            out.push(Output::RequestReady);
        }
    }

    /// User unsubscribe.
    pub(crate) fn unsubscribe(&mut self, out: &mut Vec<Output>) {
        match self.state {
            SubState::Idle | SubState::AddPending { req_id: None } => {
                self.finalize(Terminal::Deleted, out);
            }
            SubState::AddPending { req_id: Some(_) } | SubState::Added => {
                self.transition(SubState::DeletePending { req_id: None });
                out.push(Output::RequestReady);
            }
            SubState::Subscribed => {
                self.conf = ConfState::Idle;
                if let Some(strategy) = self.strategy.as_mut() {
                    strategy.dispose(out);
                }
                self.transition(SubState::DeletePending { req_id: None });
                out.push(Output::Event(SubscriptionEvent::Unsubscribed));
                out.push(Output::RequestReady);
            }
            SubState::DeletePending { .. } | SubState::Finalized(_) => {
                tracing::trace!(parent: &self.span, state = ?self.state, "unsubscribe ignored");
            }
        }
    }

    /// Change the requested max frequency. Sent right away when subscribed
    /// and no `reconf` is in flight, otherwise after the current round trip.
    pub(crate) fn set_requested_max_frequency(
        &mut self,
        frequency: Option<RequestedMaxFrequency>,
        out: &mut Vec<Output>,
    ) {
        self.config.max_frequency = frequency;
        if self.needs_reconf() {
            out.push(Output::RequestReady);
        }
    }

    fn needs_reconf(&self) -> bool {
        self.state == SubState::Subscribed
            && self.conf == ConfState::Idle
            && self.config.max_frequency.is_some()
            && self.config.max_frequency != self.sent_frequency
    }

    /// Build the pending request, if any. Exactly one of add, delete or
    /// reconf is produced.
    pub(crate) fn encode(&mut self, req_id: RequestId, transport: Transport) -> Option<ControlRequest> {
        let request = match self.state {
            SubState::AddPending { req_id: None } => {
                self.sent_frequency = self.config.max_frequency;
                self.transition(SubState::AddPending { req_id: Some(req_id) });
                self.add_request(req_id, transport)
            }
            SubState::DeletePending { req_id: None } => {
                self.transition(SubState::DeletePending { req_id: Some(req_id) });
                ControlRequest::new(req_id)
                    .param("LS_op", "delete")
                    .param("LS_subId", self.sub_id)
                    .param_if(transport.is_stream(), "LS_ack", "false")
            }
            _ if self.needs_reconf() => {
                let frequency = self.config.max_frequency?;
                self.conf = ConfState::Pending {
                    req_id: Some(req_id),
                    frequency: Some(frequency),
                };
                ControlRequest::new(req_id)
                    .param("LS_op", "reconf")
                    .param("LS_subId", self.sub_id)
                    .param("LS_requested_max_frequency", frequency)
            }
            _ => return None,
        };
        tracing::debug!(parent: &self.span, req_id = %req_id, op = ?request.op(), "encoded subscription request");
        Some(request)
    }

    fn add_request(&self, req_id: RequestId, transport: Transport) -> ControlRequest {
        let c = &self.config;
        ControlRequest::new(req_id)
            .param("LS_op", "add")
            .param("LS_subId", self.sub_id)
            .param("LS_mode", c.mode)
            .param_opt("LS_group", c.group_value())
            .param_opt("LS_schema", c.schema_value())
            .param_opt("LS_data_adapter", c.data_adapter.as_deref())
            .param_opt("LS_selector", c.selector.as_deref())
            .param_if(c.snapshot.is_requested(), "LS_snapshot", c.snapshot.wire_value())
            .param_opt("LS_requested_max_frequency", c.max_frequency)
            .param_opt("LS_requested_buffer_size", c.buffer_size)
            .param_if(transport.is_stream(), "LS_ack", "false")
    }

    pub(crate) fn on_req_ok(&mut self, req_id: RequestId, out: &mut Vec<Output>) {
        match self.state {
            SubState::AddPending { req_id: Some(r) } if r == req_id => {
                self.transition(SubState::Added);
            }
            SubState::DeletePending { req_id: Some(r) } if r == req_id => {
                self.finalize(Terminal::Deleted, out);
            }
            _ => match self.conf {
                ConfState::Pending { req_id: Some(r), frequency } if r == req_id => {
                    self.sent_frequency = frequency;
                    self.conf = ConfState::Idle;
                    if self.needs_reconf() {
                        out.push(Output::RequestReady);
                    }
                }
                _ => tracing::trace!(parent: &self.span, %req_id, "stale REQOK ignored"),
            },
        }
    }

    pub(crate) fn on_req_err(&mut self, req_id: RequestId, code: i32, message: &str, out: &mut Vec<Output>) {
        match self.state {
            SubState::AddPending { req_id: Some(r) } if r == req_id => {
                tracing::warn!(parent: &self.span, code, reason = message, "subscription refused");
                out.push(Output::Event(SubscriptionEvent::Error {
                    code,
                    message: message.to_string(),
                }));
                self.finalize(Terminal::Failed, out);
            }
            SubState::DeletePending { req_id: Some(r) } if r == req_id => {
                tracing::debug!(parent: &self.span, code, reason = message, "delete refused, finalizing anyway");
                self.finalize(Terminal::Deleted, out);
            }
            _ => match self.conf {
                ConfState::Pending { req_id: Some(r), frequency } if r == req_id => {
                    tracing::warn!(parent: &self.span, code, reason = message, "reconfiguration refused");
                    // the refused value is not retried
                    self.sent_frequency = frequency;
                    self.conf = ConfState::Idle;
                    if self.needs_reconf() {
                        out.push(Output::RequestReady);
                    }
                }
                _ => tracing::trace!(parent: &self.span, %req_id, "stale REQERR ignored"),
            },
        }
    }

    fn can_subscribe(&self) -> bool {
        match self.state {
            SubState::Added => true,
            SubState::AddPending { req_id: Some(_) } => true,
            _ => false,
        }
    }

    fn subscribed(&mut self, strategy: ModeStrategy, out: &mut Vec<Output>) {
        self.strategy = Some(strategy);
        self.transition(SubState::Subscribed);
        out.push(Output::Event(SubscriptionEvent::Subscribed));
        if self.needs_reconf() {
            out.push(Output::RequestReady);
        }
    }

    /// `SUBOK`.
    pub(crate) fn on_sub_ok(&mut self, items: usize, fields: usize, out: &mut Vec<Output>) -> ProtocolResult<()> {
        if !self.can_subscribe() {
            tracing::trace!(parent: &self.span, state = ?self.state, "SUBOK ignored");
            return Ok(());
        }
        let strategy = ModeStrategy::on_sub(&self.config, items, fields)?;
        self.subscribed(strategy, out);
        Ok(())
    }

    /// `SUBCMD`.
    pub(crate) fn on_sub_cmd(
        &mut self,
        items: usize,
        fields: usize,
        key_pos: usize,
        cmd_pos: usize,
        out: &mut Vec<Output>,
    ) -> ProtocolResult<()> {
        if !self.can_subscribe() {
            tracing::trace!(parent: &self.span, state = ?self.state, "SUBCMD ignored");
            return Ok(());
        }
        let strategy = ModeStrategy::on_sub_cmd(&self.config, items, fields, key_pos, cmd_pos)?;
        self.subscribed(strategy, out);
        Ok(())
    }

    /// `UNSUB`: the server ended the subscription.
    pub(crate) fn on_unsub(&mut self, out: &mut Vec<Output>) {
        match self.state {
            SubState::Subscribed => {
                if let Some(strategy) = self.strategy.as_mut() {
                    strategy.dispose(out);
                }
                out.push(Output::Event(SubscriptionEvent::Unsubscribed));
                self.finalize(Terminal::Deleted, out);
            }
            SubState::AddPending { req_id: Some(_) } | SubState::Added | SubState::DeletePending { .. } => {
                self.finalize(Terminal::Deleted, out);
            }
            _ => tracing::trace!(parent: &self.span, state = ?self.state, "UNSUB ignored"),
        }
    }

    fn live_strategy(&mut self) -> Option<&mut ModeStrategy> {
        if self.state == SubState::Subscribed {
            self.strategy.as_mut()
        } else {
            None
        }
    }

    pub(crate) fn on_update(&mut self, item: usize, deltas: &DeltaMap, out: &mut Vec<Output>) -> ProtocolResult<()> {
        match self.live_strategy() {
            Some(strategy) => strategy.update(item, deltas, out),
            None => Ok(()),
        }
    }

    pub(crate) fn on_end_of_snapshot(&mut self, item: usize, out: &mut Vec<Output>) -> ProtocolResult<()> {
        match self.live_strategy() {
            Some(strategy) => strategy.end_of_snapshot(item, out),
            None => Ok(()),
        }
    }

    pub(crate) fn on_clear_snapshot(&mut self, item: usize, out: &mut Vec<Output>) -> ProtocolResult<()> {
        match self.live_strategy() {
            Some(strategy) => strategy.clear_snapshot(item, out),
            None => Ok(()),
        }
    }

    pub(crate) fn on_overflow(&mut self, item: usize, lost: u64, out: &mut Vec<Output>) -> ProtocolResult<()> {
        match self.live_strategy() {
            Some(strategy) => strategy.lost_updates(item, lost, out),
            None => Ok(()),
        }
    }

    pub(crate) fn on_conf(&mut self, frequency: RealMaxFrequency, out: &mut Vec<Output>) {
        if let Some(strategy) = self.live_strategy() {
            strategy.on_conf(frequency, out);
        }
    }

    pub(crate) fn on_second_level_update(&mut self, item: usize, key: &str, nested: &ValueTable, out: &mut Vec<Output>) {
        if let Some(strategy) = self.live_strategy() {
            strategy.second_level_update(item, key, nested, out);
        }
    }

    pub(crate) fn on_second_level_error(
        &mut self,
        item: usize,
        key: &str,
        code: i32,
        message: &str,
        out: &mut Vec<Output>,
    ) {
        if let Some(strategy) = self.live_strategy() {
            strategy.second_level_failed(item, key, code, message, out);
        }
    }

    pub(crate) fn on_second_level_frequency(
        &mut self,
        item: usize,
        key: &str,
        frequency: Option<RealMaxFrequency>,
        out: &mut Vec<Output>,
    ) {
        if let Some(strategy) = self.live_strategy() {
            strategy.second_level_frequency(item, key, frequency, out);
        }
    }

    pub(crate) fn on_second_level_lost_updates(&mut self, key: &str, lost: u64, out: &mut Vec<Output>) {
        if self.state == SubState::Subscribed {
            out.push(Output::Event(SubscriptionEvent::SecondLevelLostUpdates {
                lost,
                key: key.to_string(),
            }));
        }
    }

    /// The session ended.
    pub(crate) fn abort(&mut self, out: &mut Vec<Output>) {
        match self.state {
            SubState::AddPending { .. } | SubState::Added => {
                self.transition(SubState::Idle);
            }
            SubState::Subscribed => {
                if let Some(strategy) = self.strategy.as_mut() {
                    strategy.abort(out);
                }
                out.push(Output::Event(SubscriptionEvent::Unsubscribed));
                self.finalize(Terminal::Aborted, out);
            }
            SubState::DeletePending { .. } => {
                // nothing left to delete once the session is gone
                self.transition(SubState::Finalized(Terminal::Deleted));
                self.conf = ConfState::Idle;
                out.push(Output::Finalized(Terminal::Deleted));
            }
            SubState::Idle | SubState::Finalized(_) => {}
        }
    }

    #[cfg(test)]
    pub(crate) fn conf_state(&self) -> ConfState {
        self.conf
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use tlcp_core::types::{SnapshotRequest, SubscriptionMode};

    fn config() -> SubscriptionConfig {
        SubscriptionConfig::new(SubscriptionMode::Merge)
            .with_items(["item1"])
            .with_fields(["bid", "ask"])
            .with_snapshot(SnapshotRequest::Yes)
    }

    fn manager() -> SubscriptionManager {
        SubscriptionManager::new(SubscriptionId::new(1), config(), Span::none())
    }

    fn subscribed() -> SubscriptionManager {
        let mut m = manager();
        let mut out = vec![];
        m.activate(&mut out);
        m.encode(RequestId::new(1), Transport::Http).unwrap();
        m.on_req_ok(RequestId::new(1), &mut out);
        m.on_sub_ok(1, 2, &mut out).unwrap();
        m
    }

    fn events(out: &[Output]) -> Vec<&SubscriptionEvent> {
        out.iter()
            .filter_map(|o| match o {
                Output::Event(e) => Some(e),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn add_request_parameters() {
        let mut m = SubscriptionManager::new(
            SubscriptionId::new(7),
            config().with_data_adapter("QUOTES"),
            Span::none(),
        );
        let mut out = vec![];
        m.activate(&mut out);
        assert_matches!(&out[..], [Output::RequestReady]);
        let req = m.encode(RequestId::new(3), Transport::Stream).unwrap();
        assert_eq!(
            req.to_query_string(),
            "LS_reqId=3&LS_op=add&LS_subId=7&LS_mode=MERGE&LS_group=item1&LS_schema=bid%20ask\
             &LS_data_adapter=QUOTES&LS_snapshot=true&LS_ack=false"
        );
        assert!(m.encode(RequestId::new(4), Transport::Stream).is_none());
    }

    #[test]
    fn suback_without_reqok_over_stream() {
        let mut m = manager();
        let mut out = vec![];
        m.activate(&mut out);
        m.encode(RequestId::new(1), Transport::Stream);
        m.on_sub_ok(1, 2, &mut out).unwrap();
        assert_eq!(m.status(), SubscriptionStatus::Subscribed);
        assert_matches!(events(&out)[..], [SubscriptionEvent::Subscribed]);
    }

    #[test]
    fn unsubscribe_before_encoding_sends_nothing() {
        let mut m = manager();
        let mut out = vec![];
        m.activate(&mut out);
        m.unsubscribe(&mut out);
        assert!(m.is_finalized());
        assert!(m.encode(RequestId::new(1), Transport::Http).is_none());
    }

    #[test]
    fn unsubscribe_while_subscribed() {
        let mut m = subscribed();
        let mut out = vec![];
        m.unsubscribe(&mut out);
        assert_matches!(events(&out)[..], [SubscriptionEvent::Unsubscribed]);
        let req = m.encode(RequestId::new(2), Transport::Http).unwrap();
        assert_eq!(req.op(), Some("delete"));
        assert!(!req.params.contains("LS_ack"));

        m.on_req_ok(RequestId::new(2), &mut out);
        assert_matches!(out.last(), Some(Output::Finalized(Terminal::Deleted)));
    }

    #[test]
    fn stale_responses_are_ignored() {
        let mut m = subscribed();
        let mut out = vec![];
        m.unsubscribe(&mut out);
        m.encode(RequestId::new(5), Transport::Http).unwrap();
        out.clear();
        m.on_req_ok(RequestId::new(3), &mut out);
        m.on_req_err(RequestId::new(4), 17, "nope", &mut out);
        assert_eq!(m.state(), SubState::DeletePending { req_id: Some(RequestId::new(5)) });
        assert!(out.is_empty());
    }

    #[test]
    fn add_refusal_is_fatal() {
        let mut m = manager();
        let mut out = vec![];
        m.activate(&mut out);
        m.encode(RequestId::new(1), Transport::Http);
        m.on_req_err(RequestId::new(1), 21, "bad group", &mut out);
        assert_matches!(
            events(&out)[..],
            [SubscriptionEvent::Error { code: 21, .. }]
        );
        assert_matches!(m.state(), SubState::Finalized(Terminal::Failed));
        m.on_sub_ok(1, 2, &mut out).unwrap();
        assert!(m.is_finalized());
    }

    #[test]
    fn reconfigurations_coalesce() {
        let mut m = subscribed();
        let mut out = vec![];
        m.set_requested_max_frequency(Some(RequestedMaxFrequency::Limited(1.0)), &mut out);
        assert_matches!(&out[..], [Output::RequestReady]);
        let first = m.encode(RequestId::new(2), Transport::Http).unwrap();
        assert_eq!(first.get("LS_requested_max_frequency"), Some("1"));

        out.clear();
        m.set_requested_max_frequency(Some(RequestedMaxFrequency::Limited(2.0)), &mut out);
        m.set_requested_max_frequency(Some(RequestedMaxFrequency::Limited(3.0)), &mut out);
        assert!(out.is_empty());
        assert!(m.encode(RequestId::new(3), Transport::Http).is_none());

        m.on_req_ok(RequestId::new(2), &mut out);
        assert_matches!(&out[..], [Output::RequestReady]);
        let second = m.encode(RequestId::new(4), Transport::Http).unwrap();
        assert_eq!(second.get("LS_requested_max_frequency"), Some("3"));

        out.clear();
        m.on_req_ok(RequestId::new(4), &mut out);
        assert!(out.is_empty());
        assert_eq!(m.conf_state(), ConfState::Idle);
    }

    #[test]
    fn abort_while_adding_reverts_to_idle() {
        let mut m = manager();
        let mut out = vec![];
        m.activate(&mut out);
        m.encode(RequestId::new(1), Transport::Http);
        m.abort(&mut out);
        assert_eq!(m.state(), SubState::Idle);
        m.activate(&mut out);
        assert!(m.encode(RequestId::new(2), Transport::Http).is_some());
    }

    #[test]
    fn abort_while_subscribed_terminates() {
        let mut m = subscribed();
        let mut out = vec![];
        m.abort(&mut out);
        assert_matches!(events(&out)[..], [SubscriptionEvent::Unsubscribed]);
        assert_matches!(out.last(), Some(Output::Finalized(Terminal::Aborted)));
    }

    #[test]
    fn server_unsub_finalizes() {
        let mut m = subscribed();
        let mut out = vec![];
        m.on_unsub(&mut out);
        assert_matches!(events(&out)[..], [SubscriptionEvent::Unsubscribed]);
        assert!(m.is_finalized());
        m.on_update(1, &tlcp_core::codec::parse_fields("a|b").unwrap(), &mut out).unwrap();
        assert!(!events(&out).iter().any(|e| matches!(e, SubscriptionEvent::Update(_))));
    }
}
