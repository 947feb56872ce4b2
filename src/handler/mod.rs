//! Handler module - inbound request and notification handling.
//!
//! Provides:
//! - [`HandlerRegistry`] - maps method names to handlers, with fallbacks
//! - [`RequestContext`] - request ID, `_meta`, cancellation and progress for a handler
//! - [`TypedHandler`] / [`FnHandler`] - adapters from closures to [`RequestHandler`]

mod context;
mod registry;

pub use context::RequestContext;
pub use registry::{
    FnHandler, FnNotificationHandler, HandlerRegistry, NotificationHandler, RequestHandler,
    TypedHandler, TypedNotificationHandler,
};
