//! Protocol module - message model, wire constants and framing.
//!
//! This module implements the JSON-RPC data model:
//! - four message kinds with a single discrimination rule
//! - `_meta`-aware payloads for params and results
//! - typed params for the cancellation and progress notifications
//! - read buffer for accumulating partial reads from a byte stream

mod message;
mod notifications;
mod read_buffer;
mod wire_format;

pub use message::{ErrorMessage, Message, Notification, Payload, Request, Response};
pub use notifications::{CancelledNotification, ProgressNotification};
pub use read_buffer::ReadBuffer;
pub use wire_format::{
    methods, ErrorCode, ErrorObject, RequestId, DEFAULT_MAX_MESSAGE_SIZE, JSONRPC_VERSION,
    META_KEY, PROGRESS_TOKEN_KEY,
};
