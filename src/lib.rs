//! # rpcwire
//!
//! Transport-agnostic JSON-RPC 2.0 engine for tool-calling protocols.
//!
//! Either side of a connection may send requests and notifications; the
//! engine correlates replies by ID, dispatches inbound traffic to registered
//! handlers, and fails every outstanding request when the connection closes.
//!
//! ## Architecture
//!
//! - **Protocol**: message model and the [`ReadBuffer`] frame decoder
//!   (newline-delimited JSON and `Content-Length` framing)
//! - **Transports**: child-process stdio, SSE client and server, byte
//!   streams and an in-memory pair for tests
//! - **Engine**: pending-request table, handler dispatch, close sweep
//! - **Lifecycle**: timeouts, `notifications/cancelled` and
//!   `notifications/progress` on top of the engine
//!
//! ## Example
//!
//! ```ignore
//! use rpcwire::{RequestOptions, Session, StdioClientTransport, StdioServerParameters};
//!
//! #[tokio::main]
//! async fn main() -> rpcwire::Result<()> {
//!     let session = Session::builder().build();
//!     let server = StdioServerParameters::new("my-tool-server").arg("--stdio");
//!     session.connect(StdioClientTransport::new(server)).await?;
//!
//!     let tools: serde_json::Value = session
//!         .send_request("tools/list", &(), RequestOptions::default())
//!         .await?;
//!     println!("{tools}");
//!
//!     session.close().await
//! }
//! ```

pub mod capability;
pub mod engine;
pub mod error;
pub mod handler;
pub mod lifecycle;
pub mod protocol;
pub mod transport;
pub mod writer;

pub use capability::{CapabilityPolicy, MethodAllowList};
pub use engine::{Engine, EngineBuilder, EngineHooks};
pub use error::{Result, RpcError};
pub use handler::RequestContext;
pub use lifecycle::{RequestOptions, Session, SessionBuilder};
pub use protocol::{ErrorCode, ErrorObject, Message, Payload, ReadBuffer, RequestId};
pub use transport::{
    InMemoryTransport, SseClientTransport, SseServer, SseServerTransport, StdioClientTransport,
    StdioServerParameters, StreamTransport, Transport,
};
