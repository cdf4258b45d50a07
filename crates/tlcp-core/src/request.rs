//! Outbound control requests.
//!
//! A request is an ordered list of `key=value` parameters, always starting
//! with `LS_reqId`. Values are percent-encoded when the request is rendered,
//! so callers push raw strings.
//!
//! ```rust
//! use tlcp_core::request::ControlRequest;
//! use tlcp_core::types::RequestId;
//!
//! let req = ControlRequest::new(RequestId::new(4))
//!     .param("LS_op", "add")
//!     .param("LS_group", "item 1+2");
//! assert_eq!(req.to_query_string(), "LS_reqId=4&LS_op=add&LS_group=item%201%2B2");
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::types::RequestId;

/// Ordered request parameters.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RequestParams(Vec<(String, String)>);

impl RequestParams {
    /// Empty parameter list.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a parameter.
    pub fn push(&mut self, key: &str, value: impl fmt::Display) {
        self.0.push((key.to_string(), value.to_string()));
    }

    /// First value for `key`.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Whether `key` is present.
    pub fn contains(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    /// Parameters in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> + '_ {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Number of parameters.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether there are no parameters.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// A control request ready to be handed to the sender.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControlRequest {
    /// Correlation id, echoed by `REQOK`/`REQERR`.
    pub req_id: RequestId,
    /// Parameters, `LS_reqId` first.
    pub params: RequestParams,
}

impl ControlRequest {
    /// Start a request carrying `LS_reqId`.
    pub fn new(req_id: RequestId) -> Self {
        let mut params = RequestParams::new();
        params.push("LS_reqId", req_id);
        Self { req_id, params }
    }

    /// Append a parameter.
    #[must_use]
    pub fn param(mut self, key: &str, value: impl fmt::Display) -> Self {
        self.params.push(key, value);
        self
    }

    /// Append a parameter when `value` is present.
    #[must_use]
    pub fn param_opt<V: fmt::Display>(self, key: &str, value: Option<V>) -> Self {
        match value {
            Some(value) => self.param(key, value),
            None => self,
        }
    }

    /// Append a parameter when `cond` holds.
    #[must_use]
    pub fn param_if(self, cond: bool, key: &str, value: impl fmt::Display) -> Self {
        if cond { self.param(key, value) } else { self }
    }

    /// Value of `key`.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.params.get(key)
    }

    /// Value of `LS_op`, if any.
    pub fn op(&self) -> Option<&str> {
        self.get("LS_op")
    }

    /// Render as `key=value&...` with percent-encoded values.
    pub fn to_query_string(&self) -> String {
        self.params
            .iter()
            .map(|(k, v)| format!("{k}={}", urlencoding::encode(v)))
            .collect::<Vec<_>>()
            .join("&")
    }
}

impl fmt::Display for ControlRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_query_string())
    }
}
