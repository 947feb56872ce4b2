//! Wire format constants and the small value types shared by every message.
//!
//! ```text
//! {"jsonrpc":"2.0","id":7,"method":"tools/call","params":{"_meta":{"progressToken":7},"name":"x"}}
//!  └ version tag   └ id    └ method               └ reserved meta  └ open fields (flattened)
//! ```

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Protocol version tag stamped on every outbound message.
pub const JSONRPC_VERSION: &str = "2.0";

/// Reserved key carrying out-of-band metadata in `params` and `result`.
pub const META_KEY: &str = "_meta";

/// Key inside `_meta` holding the progress token.
pub const PROGRESS_TOKEN_KEY: &str = "progressToken";

/// Default maximum size of a single framed message (64 MiB).
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 64 * 1024 * 1024;

/// Method names the engine itself understands.
pub mod methods {
    /// Peer abandoned a request it sent earlier.
    pub const CANCELLED: &str = "notifications/cancelled";
    /// Out-of-band progress for a request carrying a progress token.
    pub const PROGRESS: &str = "notifications/progress";
    /// Liveness check.
    pub const PING: &str = "ping";
}

/// Identifier correlating a request with its reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(pub i64);

impl RequestId {
    #[inline]
    pub fn value(self) -> i64 {
        self.0
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i64> for RequestId {
    fn from(id: i64) -> Self {
        RequestId(id)
    }
}

/// Standard and SDK-level error codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    ParseError,
    InvalidRequest,
    MethodNotFound,
    InvalidParams,
    InternalError,
    ConnectionClosed,
    RequestTimeout,
}

impl ErrorCode {
    /// Numeric code as sent on the wire.
    pub const fn code(self) -> i32 {
        match self {
            ErrorCode::ParseError => -32700,
            ErrorCode::InvalidRequest => -32600,
            ErrorCode::MethodNotFound => -32601,
            ErrorCode::InvalidParams => -32602,
            ErrorCode::InternalError => -32603,
            ErrorCode::ConnectionClosed => -32000,
            ErrorCode::RequestTimeout => -32001,
        }
    }

    /// Reverse lookup; `None` for application-defined codes.
    pub fn from_code(code: i32) -> Option<Self> {
        match code {
            -32700 => Some(ErrorCode::ParseError),
            -32600 => Some(ErrorCode::InvalidRequest),
            -32601 => Some(ErrorCode::MethodNotFound),
            -32602 => Some(ErrorCode::InvalidParams),
            -32603 => Some(ErrorCode::InternalError),
            -32000 => Some(ErrorCode::ConnectionClosed),
            -32001 => Some(ErrorCode::RequestTimeout),
            _ => None,
        }
    }
}

/// The `error` member of an error reply.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorObject {
    pub code: i32,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl ErrorObject {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code: code.code(),
            message: message.into(),
            data: None,
        }
    }

    /// Attach a `data` member.
    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }

    /// Known error code, if this is one of the standard ones.
    pub fn kind(&self) -> Option<ErrorCode> {
        ErrorCode::from_code(self.code)
    }
}

impl fmt::Display for ErrorObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "JSON-RPC error {}: {}", self.code, self.message)
    }
}
