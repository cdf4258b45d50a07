//! Message manager: one client-to-server message.
//!
//! The flow is fixed at construction from whether a listener is attached and
//! whether the message belongs to a sequence:
//!
//! | listener | sequence | flow |
//! |---|---|---|
//! | yes | yes | `LS_sequence` + `LS_msg_prog`, outcome via `MSGDONE`/`MSGFAIL` |
//! | yes | no  | same, in the `UNORDERED_MESSAGES` sequence |
//! | no  | yes | `LS_outcome=false`, still progressive |
//! | no  | no  | fire-and-forget: `LS_outcome=false`, no progressive |

use tracing::Span;
use tlcp_core::line::UNORDERED_MESSAGES;
use tlcp_core::request::ControlRequest;
use tlcp_core::types::RequestId;

use crate::config::Transport;

/// How a server error code is reported for a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageFailure {
    /// Late response for a message already settled; not reported.
    Suppressed,
    /// Discarded by the server (codes 38 and 39).
    Discarded,
    /// Refused by the metadata adapter (codes ≤ 0).
    Denied,
    /// Any other failure.
    Failed,
}

impl MessageFailure {
    /// Classify a `REQERR`/`MSGFAIL` code.
    pub fn classify(code: i32) -> Self {
        match code {
            38 | 39 => MessageFailure::Discarded,
            32 | 33 => MessageFailure::Suppressed,
            c if c <= 0 => MessageFailure::Denied,
            _ => MessageFailure::Failed,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum MessageFlow {
    ListenedOrdered,
    ListenedUnordered,
    OrderedNoListener,
    FireAndForget,
}

impl MessageFlow {
    pub(crate) fn new(has_listener: bool, ordered: bool) -> Self {
        match (has_listener, ordered) {
            (true, true) => MessageFlow::ListenedOrdered,
            (true, false) => MessageFlow::ListenedUnordered,
            (false, true) => MessageFlow::OrderedNoListener,
            (false, false) => MessageFlow::FireAndForget,
        }
    }

    pub(crate) fn has_listener(self) -> bool {
        matches!(self, MessageFlow::ListenedOrdered | MessageFlow::ListenedUnordered)
    }

    /// Whether the message takes a progressive number.
    pub(crate) fn is_progressive(self) -> bool {
        self != MessageFlow::FireAndForget
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum MessageState {
    Idle,
    Sent { req_id: RequestId, acked: bool },
    Done,
    Failed,
    Aborted,
}

/// Listener-facing outcome.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum MessageEvent {
    Processed { response: String },
    Discarded,
    Denied { code: i32, message: String },
    Failed,
    Aborted { sent_on_network: bool },
}

#[derive(Debug)]
pub(crate) struct MessageManager {
    text: String,
    sequence: String,
    prog: Option<u64>,
    delay_timeout: Option<u64>,
    flow: MessageFlow,
    state: MessageState,
    span: Span,
}

impl MessageManager {
    /// `prog` must be set for every flow but fire-and-forget.
    pub(crate) fn new(
        text: impl Into<String>,
        sequence: Option<String>,
        prog: Option<u64>,
        delay_timeout: Option<u64>,
        flow: MessageFlow,
        span: Span,
    ) -> Self {
        Self {
            text: text.into(),
            sequence: sequence.unwrap_or_else(|| UNORDERED_MESSAGES.to_string()),
            prog,
            delay_timeout,
            flow,
            state: MessageState::Idle,
            span,
        }
    }

    pub(crate) fn text(&self) -> &str {
        &self.text
    }

    pub(crate) fn sequence(&self) -> &str {
        &self.sequence
    }

    pub(crate) fn prog(&self) -> Option<u64> {
        self.prog
    }

    #[cfg(test)]
    pub(crate) fn state(&self) -> MessageState {
        self.state
    }

    pub(crate) fn is_finished(&self) -> bool {
        matches!(
            self.state,
            MessageState::Done | MessageState::Failed | MessageState::Aborted
        )
    }

    fn transition(&mut self, to: MessageState) {
        tracing::debug!(parent: &self.span, from = ?self.state, to = ?to, "message transition");
        self.state = to;
    }

    /// Build the send request. A fire-and-forget message over the stream
    /// transport expects no response and is done once encoded.
    pub(crate) fn encode(&mut self, req_id: RequestId, transport: Transport) -> Option<ControlRequest> {
        if self.state != MessageState::Idle {
            return None;
        }
        let progressive = self.flow.is_progressive();
        let request = ControlRequest::new(req_id)
            .param("LS_message", &self.text)
            .param_if(!self.flow.has_listener(), "LS_outcome", "false")
            .param_if(progressive, "LS_sequence", &self.sequence)
            .param_opt("LS_msg_prog", self.prog.filter(|_| progressive))
            .param_opt("LS_max_wait", self.delay_timeout.filter(|_| progressive))
            .param_if(
                self.flow == MessageFlow::FireAndForget && transport.is_stream(),
                "LS_ack",
                "false",
            );
        if self.flow == MessageFlow::FireAndForget && transport.is_stream() {
            self.transition(MessageState::Done);
        } else {
            self.transition(MessageState::Sent { req_id, acked: false });
        }
        Some(request)
    }

    pub(crate) fn on_req_ok(&mut self, req_id: RequestId) {
        match self.state {
            MessageState::Sent { req_id: r, .. } if r == req_id => {
                if self.flow.has_listener() {
                    self.transition(MessageState::Sent { req_id, acked: true });
                } else {
                    self.transition(MessageState::Done);
                }
            }
            _ => tracing::trace!(parent: &self.span, %req_id, "stale REQOK ignored"),
        }
    }

    pub(crate) fn on_req_err(&mut self, req_id: RequestId, code: i32, message: &str) -> Option<MessageEvent> {
        match self.state {
            MessageState::Sent { req_id: r, .. } if r == req_id => self.fail(code, message),
            _ => {
                tracing::trace!(parent: &self.span, %req_id, "stale REQERR ignored");
                None
            }
        }
    }

    /// `MSGDONE` for this message's sequence and progressive.
    pub(crate) fn on_done(&mut self, response: &str) -> Option<MessageEvent> {
        if !matches!(self.state, MessageState::Sent { .. }) {
            return None;
        }
        self.transition(MessageState::Done);
        self.flow.has_listener().then(|| MessageEvent::Processed {
            response: response.to_string(),
        })
    }

    /// `MSGFAIL` for this message's sequence and progressive.
    pub(crate) fn on_fail(&mut self, code: i32, message: &str) -> Option<MessageEvent> {
        if !matches!(self.state, MessageState::Sent { .. }) {
            return None;
        }
        self.fail(code, message)
    }

    fn fail(&mut self, code: i32, message: &str) -> Option<MessageEvent> {
        let failure = MessageFailure::classify(code);
        if failure == MessageFailure::Suppressed {
            tracing::debug!(parent: &self.span, code, "late message response suppressed");
            return None;
        }
        tracing::warn!(parent: &self.span, code, reason = message, ?failure, "message failed");
        self.transition(MessageState::Failed);
        if !self.flow.has_listener() {
            return None;
        }
        Some(match failure {
            MessageFailure::Discarded => MessageEvent::Discarded,
            MessageFailure::Denied => MessageEvent::Denied {
                code,
                message: message.to_string(),
            },
            _ => MessageEvent::Failed,
        })
    }

    /// The session ended before the outcome arrived.
    pub(crate) fn abort(&mut self) -> Option<MessageEvent> {
        let sent_on_network = match self.state {
            MessageState::Idle => false,
            MessageState::Sent { .. } => true,
            _ => return None,
        };
        self.transition(MessageState::Aborted);
        self.flow
            .has_listener()
            .then_some(MessageEvent::Aborted { sent_on_network })
    }
}
