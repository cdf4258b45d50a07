//! Inbound TLCP lines handled by the client engine.
//!
//! Session-level lines (`CONOK`, `PROBE`, `LOOP`, ...) belong to the outer
//! session machine; they parse to [`ServerMessage::Unhandled`] so the caller
//! can route them elsewhere.

use crate::codec::{UpdateLine, parse_update, percent_decode};
use crate::error::{ProtocolError, ProtocolResult};
use crate::types::{RealMaxFrequency, RequestId, SubscriptionId};

/// Sequence name used for messages sent without an explicit sequence.
pub const UNORDERED_MESSAGES: &str = "UNORDERED_MESSAGES";

/// A decoded server line.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerMessage {
    /// `U`: item update.
    Update(UpdateLine),
    /// `SUBOK,<subId>,<nItems>,<nFields>`.
    SubOk {
        /// Subscription id.
        sub_id: SubscriptionId,
        /// Number of items.
        items: usize,
        /// Number of fields.
        fields: usize,
    },
    /// `SUBCMD,<subId>,<nItems>,<nFields>,<keyPos>,<cmdPos>`.
    SubCmd {
        /// Subscription id.
        sub_id: SubscriptionId,
        /// Number of items.
        items: usize,
        /// Number of fields.
        fields: usize,
        /// 1-based position of the `key` field.
        key_pos: usize,
        /// 1-based position of the `command` field.
        cmd_pos: usize,
    },
    /// `UNSUB,<subId>`.
    Unsub {
        /// Subscription id.
        sub_id: SubscriptionId,
    },
    /// `EOS,<subId>,<item>`.
    EndOfSnapshot {
        /// Subscription id.
        sub_id: SubscriptionId,
        /// 1-based item index.
        item: usize,
    },
    /// `CS,<subId>,<item>`.
    ClearSnapshot {
        /// Subscription id.
        sub_id: SubscriptionId,
        /// 1-based item index.
        item: usize,
    },
    /// `OV,<subId>,<item>,<lost>`.
    Overflow {
        /// Subscription id.
        sub_id: SubscriptionId,
        /// 1-based item index.
        item: usize,
        /// Number of updates the server dropped.
        lost: u64,
    },
    /// `CONF,<subId>,<freq>,<filtered|unfiltered>`.
    Conf {
        /// Subscription id.
        sub_id: SubscriptionId,
        /// Frequency the server applies.
        frequency: RealMaxFrequency,
        /// Whether the subscription is filtered.
        filtered: bool,
    },
    /// `REQOK,<reqId>`.
    ReqOk {
        /// Acknowledged request.
        req_id: RequestId,
    },
    /// `REQERR,<reqId>,<code>,<message>`.
    ReqErr {
        /// Refused request.
        req_id: RequestId,
        /// Server error code.
        code: i32,
        /// Server error message.
        message: String,
    },
    /// `MSGDONE,<sequence>,<prog>,<response>`.
    MsgDone {
        /// Message sequence.
        sequence: String,
        /// Progressive number within the sequence.
        prog: u64,
        /// Response from the metadata adapter, possibly empty.
        response: String,
    },
    /// `MSGFAIL,<sequence>,<prog>,<code>,<message>`.
    MsgFail {
        /// Message sequence.
        sequence: String,
        /// Progressive number within the sequence.
        prog: u64,
        /// Server error code.
        code: i32,
        /// Server error message.
        message: String,
    },
    /// `MPNREG,<deviceId>,<adapterName>`.
    MpnReg {
        /// Server-side device id.
        device_id: String,
        /// Adapter serving the MPN status items.
        adapter: String,
    },
    /// `MPNOK,<subId>,<mpnSubId>`.
    MpnOk {
        /// Client-side id sent with the activation.
        sub_id: SubscriptionId,
        /// Server-side MPN subscription id.
        mpn_sub_id: String,
    },
    /// `MPNDEL,<mpnSubId>`.
    MpnDel {
        /// Server-side MPN subscription id.
        mpn_sub_id: String,
    },
    /// Any line this engine does not consume.
    Unhandled {
        /// Tag before the first comma.
        tag: String,
    },
}

/// Parse a single server line, trailing line terminators allowed.
///
/// # Errors
///
/// Returns [`ProtocolError::MalformedLine`] when a known tag has missing or
/// unparsable arguments.
pub fn parse_line(line: &str) -> ProtocolResult<ServerMessage> {
    let line = line.trim_end_matches(['\r', '\n']);
    let tag = line.split(',').next().unwrap_or_default();
    if tag == "U" {
        return parse_update(line).map(ServerMessage::Update);
    }
    let args = Args::new(line);
    let msg = match tag {
        "SUBOK" => {
            let [sub_id, items, fields] = args.take::<3>()?;
            ServerMessage::SubOk {
                sub_id: args.id(sub_id)?,
                items: args.count(items)?,
                fields: args.count(fields)?,
            }
        }
        "SUBCMD" => {
            let [sub_id, items, fields, key_pos, cmd_pos] = args.take::<5>()?;
            ServerMessage::SubCmd {
                sub_id: args.id(sub_id)?,
                items: args.count(items)?,
                fields: args.count(fields)?,
                key_pos: args.count(key_pos)?,
                cmd_pos: args.count(cmd_pos)?,
            }
        }
        "UNSUB" => {
            let [sub_id] = args.take::<1>()?;
            ServerMessage::Unsub {
                sub_id: args.id(sub_id)?,
            }
        }
        "EOS" => {
            let [sub_id, item] = args.take::<2>()?;
            ServerMessage::EndOfSnapshot {
                sub_id: args.id(sub_id)?,
                item: args.count(item)?,
            }
        }
        "CS" => {
            let [sub_id, item] = args.take::<2>()?;
            ServerMessage::ClearSnapshot {
                sub_id: args.id(sub_id)?,
                item: args.count(item)?,
            }
        }
        "OV" => {
            let [sub_id, item, lost] = args.take::<3>()?;
            ServerMessage::Overflow {
                sub_id: args.id(sub_id)?,
                item: args.count(item)?,
                lost: args.id::<u64>(lost)?,
            }
        }
        "CONF" => {
            let [sub_id, frequency, filtered] = args.take::<3>()?;
            ServerMessage::Conf {
                sub_id: args.id(sub_id)?,
                frequency: RealMaxFrequency::parse(frequency)?,
                filtered: match filtered {
                    "filtered" => true,
                    "unfiltered" => false,
                    _ => return Err(ProtocolError::malformed(line, "invalid filtering flag")),
                },
            }
        }
        "REQOK" => {
            let [req_id] = args.take::<1>()?;
            ServerMessage::ReqOk {
                req_id: args.id(req_id)?,
            }
        }
        "REQERR" => {
            let [req_id, code, message] = args.take::<3>()?;
            ServerMessage::ReqErr {
                req_id: args.id(req_id)?,
                code: args.code(code)?,
                message: percent_decode(message)?,
            }
        }
        "MSGDONE" => {
            let [sequence, prog, response] = args.take::<3>()?;
            ServerMessage::MsgDone {
                sequence: sequence_name(sequence),
                prog: args.id(prog)?,
                response: percent_decode(response)?,
            }
        }
        "MSGFAIL" => {
            let [sequence, prog, code, message] = args.take::<4>()?;
            ServerMessage::MsgFail {
                sequence: sequence_name(sequence),
                prog: args.id(prog)?,
                code: args.code(code)?,
                message: percent_decode(message)?,
            }
        }
        "MPNREG" => {
            let [device_id, adapter] = args.take::<2>()?;
            ServerMessage::MpnReg {
                device_id: percent_decode(device_id)?,
                adapter: percent_decode(adapter)?,
            }
        }
        "MPNOK" => {
            let [sub_id, mpn_sub_id] = args.take::<2>()?;
            ServerMessage::MpnOk {
                sub_id: args.id(sub_id)?,
                mpn_sub_id: percent_decode(mpn_sub_id)?,
            }
        }
        "MPNDEL" => {
            let [mpn_sub_id] = args.take::<1>()?;
            ServerMessage::MpnDel {
                mpn_sub_id: percent_decode(mpn_sub_id)?,
            }
        }
        other => ServerMessage::Unhandled {
            tag: other.to_string(),
        },
    };
    Ok(msg)
}

fn sequence_name(token: &str) -> String {
    if token == "*" {
        UNORDERED_MESSAGES.to_string()
    } else {
        token.to_string()
    }
}

/// Comma-separated arguments following the tag. The last argument keeps any
/// embedded commas, which only occur in free-text fields.
struct Args<'a> {
    line: &'a str,
}

impl<'a> Args<'a> {
    fn new(line: &'a str) -> Self {
        Self { line }
    }

    fn take<const N: usize>(&self) -> ProtocolResult<[&'a str; N]> {
        let rest = self
            .line
            .split_once(',')
            .map(|(_, rest)| rest)
            .ok_or_else(|| ProtocolError::malformed(self.line, "missing arguments"))?;
        let mut out = [""; N];
        let mut parts = rest.splitn(N, ',');
        for slot in &mut out {
            *slot = parts.next().ok_or_else(|| {
                ProtocolError::malformed(self.line, format!("expected {N} arguments"))
            })?;
        }
        Ok(out)
    }

    fn id<T: std::str::FromStr>(&self, token: &str) -> ProtocolResult<T> {
        token
            .parse()
            .map_err(|_| ProtocolError::malformed(self.line, format!("invalid number '{token}'")))
    }

    fn count(&self, token: &str) -> ProtocolResult<usize> {
        self.id(token)
    }

    fn code(&self, token: &str) -> ProtocolResult<i32> {
        self.id(token)
    }
}
