//! Wire-level vocabulary of the TLCP push protocol: identifiers, the update
//! codec, the diff decoder, value reconciliation, inbound lines and outbound
//! requests. Nothing in this crate holds session state.

pub mod codec;
pub mod diff;
pub mod error;
pub mod line;
pub mod request;
pub mod types;
pub mod values;

pub use error::{ProtocolError, ProtocolResult};
pub use line::{ServerMessage, parse_line};
pub use request::ControlRequest;
pub use values::{FieldValue, ValueTable};

/// Re-export to ensure the same type is used
pub use serde_json::Value as JsonValue;
