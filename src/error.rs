//! Error types for rpcwire.

use thiserror::Error;

use crate::protocol::{ErrorCode, ErrorObject, RequestId};

/// Main error type for all rpcwire operations.
///
/// Timeouts and cancellations are their own variants so a caller can tell
/// them apart from a structured error sent back by the peer ([`RpcError::Rpc`]).
#[derive(Debug, Error)]
pub enum RpcError {
    /// I/O error on a pipe, socket or child process.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// HTTP error from the event-stream transport.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Invalid URL (event-stream base URL or announced endpoint).
    #[error("invalid URL: {0}")]
    Url(#[from] url::ParseError),

    /// Bytes on the wire were not well-formed JSON or framing.
    #[error("parse error: {0}")]
    Parse(String),

    /// Well-formed JSON that is not a valid message.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// A message could not be encoded (e.g. a param field collides with `_meta`).
    #[error("encode error: {0}")]
    Encode(String),

    /// Structured JSON-RPC error, either received from the peer or produced
    /// by a handler that wants its own code on the wire.
    #[error("{0}")]
    Rpc(ErrorObject),

    /// Send attempted before `connect` or after `close`.
    #[error("not connected")]
    NotConnected,

    /// `connect` called on an engine that already has a transport.
    #[error("already connected")]
    AlreadyConnected,

    /// `start` called twice on a transport.
    #[error("transport already started")]
    AlreadyStarted,

    /// The connection closed while the request was in flight.
    #[error("connection closed")]
    ConnectionClosed,

    /// The request deadline expired before a reply arrived.
    #[error("request timed out")]
    Timeout,

    /// The caller (or the peer, for inbound handlers) cancelled the request.
    #[error("request cancelled")]
    Cancelled,

    /// The frame decoder was used after `close`.
    #[error("read buffer has been closed")]
    BufferClosed,

    /// A reply named a request ID with no pending entry.
    #[error("received response for unknown request ID: {0}")]
    UnknownRequestId(RequestId),

    /// A progress notification named a token with no registered sink.
    #[error("received a progress notification for an unknown token: {0}")]
    UnknownProgressToken(RequestId),

    /// The capability policy refused the method.
    #[error("method {method} not supported by peer: {reason}")]
    Capability { method: String, reason: String },

    /// Transport-level failure that is not a plain I/O error.
    #[error("transport error: {0}")]
    Transport(String),
}

impl RpcError {
    /// Shorthand for a structured error with the given code.
    pub fn rpc(code: ErrorCode, message: impl Into<String>) -> Self {
        RpcError::Rpc(ErrorObject::new(code, message))
    }

    /// Wire error code that best describes this error.
    pub fn code(&self) -> i32 {
        match self {
            RpcError::Rpc(obj) => obj.code,
            RpcError::Parse(_) | RpcError::Json(_) => ErrorCode::ParseError.code(),
            RpcError::InvalidRequest(_) => ErrorCode::InvalidRequest.code(),
            RpcError::ConnectionClosed | RpcError::NotConnected => {
                ErrorCode::ConnectionClosed.code()
            }
            RpcError::Timeout => ErrorCode::RequestTimeout.code(),
            _ => ErrorCode::InternalError.code(),
        }
    }

    /// Error object to send back when a handler fails.
    ///
    /// Structured errors keep their own code; everything else becomes
    /// `InternalError` carrying the display text.
    pub fn to_error_object(&self) -> ErrorObject {
        match self {
            RpcError::Rpc(obj) => obj.clone(),
            other => ErrorObject::new(ErrorCode::InternalError, other.to_string()),
        }
    }

    /// True for the local lifecycle outcomes (timeout or cancellation).
    pub fn is_lifecycle(&self) -> bool {
        matches!(self, RpcError::Timeout | RpcError::Cancelled)
    }
}

impl From<ErrorObject> for RpcError {
    fn from(obj: ErrorObject) -> Self {
        RpcError::Rpc(obj)
    }
}

/// Result type alias using RpcError.
pub type Result<T> = std::result::Result<T, RpcError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_structured_error_keeps_code() {
        let err = RpcError::rpc(ErrorCode::InvalidParams, "bad params");
        assert_eq!(err.code(), -32602);
        assert_eq!(err.to_error_object().message, "bad params");
    }

    #[test]
    fn test_plain_error_becomes_internal() {
        let err = RpcError::Transport("pipe gone".into());
        let obj = err.to_error_object();
        assert_eq!(obj.code, -32603);
        assert!(obj.message.contains("pipe gone"));
    }

    #[test]
    fn test_lifecycle_codes() {
        assert_eq!(RpcError::Timeout.code(), -32001);
        assert_eq!(RpcError::ConnectionClosed.code(), -32000);
        assert!(RpcError::Timeout.is_lifecycle());
        assert!(RpcError::Cancelled.is_lifecycle());
        assert!(!RpcError::ConnectionClosed.is_lifecycle());
    }

    #[test]
    fn test_unknown_id_names_the_id() {
        let err = RpcError::UnknownRequestId(RequestId(99));
        assert!(err.to_string().contains("99"));
    }
}
