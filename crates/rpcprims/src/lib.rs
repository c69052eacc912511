//! Async bidirectional RPC over duplex streams.
//!
//! rpcprims multiplexes request/response calls, fire-and-forget notifies
//! and server-initiated calls over one connection, routed by method name.
//!
//! # Crate Structure
//!
//! - [`transport`]: Duplex stream transports (TCP, Unix sockets, in-memory)
//! - [`frame`]: Self-delimiting message framing
//! - [`session`]: Sessions, routing, clients, servers and client pools
//!
//! The most common types are re-exported at the crate root.

/// Re-export transport types.
pub mod transport {
    pub use rpcprims_transport::*;
}

/// Re-export frame types.
pub mod frame {
    pub use rpcprims_frame::*;
}

/// Re-export session types.
pub mod session {
    pub use rpcprims_session::*;
}

pub use rpcprims_session::{
    CancellationToken, Client, ClientConfig, ClientPool, Codec, Context, JsonCodec, Result,
    RpcError, Router, Server, ServerConfig, Session, SessionConfig,
};
pub use rpcprims_transport::{dialer_fn, Dialer, Listener, RpcStream, TcpAcceptor, TcpDialer};
