//! # peerwire
//!
//! Bidirectional RPC over a single persistent binary-framed connection.
//!
//! Either peer may call methods the other registered: the server can call
//! back into a client over the same socket. Calls are multiplexed and
//! correlated by request id, payload encoding is pluggable per connection,
//! and each side runs a keepalive scheme (client emits probes, server
//! watches for them).
//!
//! ## Architecture
//!
//! - **Wire**: 16-byte sentinel-delimited header + method name + body, with
//!   a resynchronizing decoder that recovers alignment on noisy streams
//! - **Engine**: per-connection receive/send/dispatch workers over bounded
//!   queues, torn down through a single CAS-guarded close sequence
//! - **Lifecycle**: client auto-reconnect and server keepalive watchdog,
//!   composed with the engine through a watcher contract and named hooks
//!
//! ## Example
//!
//! ```ignore
//! use peerwire::{ByteOrder, PayloadCodec, RpcClient, RpcServer};
//!
//! #[tokio::main]
//! async fn main() -> peerwire::Result<()> {
//!     let server = RpcServer::new(ByteOrder::Big, PayloadCodec::Json);
//!     server.register_func("global", "Hello", |_conn, name: String| async move {
//!         Ok(format!("你好哈:{name}"))
//!     })?;
//!     server.start("127.0.0.1:50001").await?;
//!
//!     let client = RpcClient::new(ByteOrder::Big, PayloadCodec::Json);
//!     client.start("127.0.0.1:50001", true).await?;
//!
//!     let say: String = client.call("global_Hello", "qqnihao").await?;
//!     assert_eq!(say, "你好哈:qqnihao");
//!     Ok(())
//! }
//! ```

pub mod codec;
pub mod protocol;

mod client;
mod connection;
mod error;
mod pending;
mod registry;
mod server;
mod watcher;

pub use client::{RpcClient, DEFAULT_KEEPALIVE_INTERVAL, RECONNECT_INTERVAL};
pub use codec::PayloadCodec;
pub use connection::{CallHandle, Connection, DEFAULT_REQUEST_EXPIRY, QUEUE_CAPACITY};
pub use error::{Result, RpcError};
pub use pending::{PendingRequest, PendingTable};
pub use protocol::{ByteOrder, Frame};
pub use registry::{Handler, MethodRegistry, Service, TypedHandler};
pub use server::{RpcServer, DEFAULT_CONNECTION_TIMEOUT};
pub use watcher::{ConnectionWatcher, HookRegistry, HookWatcher};
