//! Errors surfaced by the client engine's public operations.
//!
//! Server-reported failures (`REQERR`, `MSGFAIL`) never show up here: they are
//! classified by the owning manager and delivered to its listener. What is
//! left are caller mistakes, lookups of finished handles, and decoding errors
//! from inbound lines.
//!
//! # Example
//!
//! ```rust
//! use tlcp_client::config::SubscriptionConfig;
//! use tlcp_client::error::ClientError;
//! use tlcp_client::core::types::SubscriptionMode;
//!
//! let config = SubscriptionConfig::new(SubscriptionMode::Merge).with_fields(["last"]);
//! match config.validate() {
//!     Err(ClientError::InvalidConfig(reason)) => tracing::warn!(%reason, "rejected"),
//!     other => panic!("unexpected: {other:?}"),
//! }
//! ```

use thiserror::Error;
use tlcp_core::ProtocolError;
use tlcp_core::types::{MpnHandle, SubscriptionHandle};

/// Errors returned by [`Engine`](crate::engine::Engine) operations.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum ClientError {
    /// A configuration failed validation.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// The handle does not name a live subscription.
    #[error("unknown subscription {0}")]
    UnknownSubscription(SubscriptionHandle),

    /// The handle does not name a live MPN subscription.
    #[error("unknown MPN subscription {0}")]
    UnknownMpnSubscription(MpnHandle),

    /// Message sequence names are restricted to `[A-Za-z0-9_]+`.
    #[error("invalid message sequence name '{0}'")]
    InvalidSequence(String),

    /// MPN operations need a device registered through
    /// [`Engine::register_device`](crate::engine::Engine::register_device).
    #[error("no MPN device registered")]
    DeviceNotRegistered,

    /// The callback dispatcher thread could not be started.
    #[error("failed to start callback dispatcher: {0}")]
    Dispatcher(#[from] std::io::Error),

    /// An inbound line could not be decoded or applied.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

impl ClientError {
    /// Shorthand for [`ClientError::InvalidConfig`].
    pub(crate) fn config(reason: impl Into<String>) -> Self {
        Self::InvalidConfig(reason.into())
    }
}

/// Result type alias for client operations.
pub type ClientResult<T> = Result<T, ClientError>;
