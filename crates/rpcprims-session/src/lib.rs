//! Multiplexed RPC sessions over rpcprims transports.
//!
//! This is the "just works" layer. A [`Session`] owns one duplex stream,
//! multiplexes any number of concurrent calls over it by sequence id, and
//! dispatches inbound Calls and Notifies to a [`Router`]. [`Client`],
//! [`Server`] and [`ClientPool`] manage sessions for the dialing and
//! accepting sides.
//!
//! ```ignore
//! let server = Server::new();
//! server.handler().handle("/echo", |ctx: Context| async move {
//!     let body: String = ctx.bind().unwrap_or_default();
//!     let _ = ctx.write(&body).await;
//! });
//! tokio::spawn(async move { server.run_tcp("127.0.0.1:9000").await });
//!
//! let client = Client::new(TcpDialer::new("127.0.0.1:9000"));
//! client.run().await?;
//! let reply: String = client.call("/echo", &"hi", Duration::from_secs(1)).await?;
//! ```

pub mod client;
pub mod codec;
pub mod config;
pub mod context;
pub mod error;
mod pending;
pub mod pool;
pub mod router;
pub mod server;
pub mod session;

pub use client::Client;
pub use codec::{decode_payload, encode_payload, Codec, JsonCodec};
pub use config::{
    ClientConfig, ReconnectPolicy, ServerConfig, SessionConfig, DEFAULT_SEND_QUEUE_SIZE,
};
pub use context::Context;
pub use error::{CodecError, Result, RpcError, SendError};
pub use pending::Callback;
pub use pool::ClientPool;
pub use router::{reply_not_found, Handler, Router};
pub use server::Server;
pub use session::Session;

pub use rpcprims_frame::{ErrorCode, MessageKind};
pub use tokio_util::sync::CancellationToken;
