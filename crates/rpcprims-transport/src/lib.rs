//! Duplex stream transports for rpcprims.
//!
//! Provides a unified async stream type over:
//! - TCP
//! - Unix domain sockets (Linux/macOS)
//! - In-memory pipes
//!
//! plus the [`Dialer`] and [`Listener`] seams the client and server layers
//! are written against. This is the lowest layer of rpcprims; everything
//! else builds on top of the [`RpcStream`] type provided here.

pub mod dial;
pub mod error;
pub mod memory;
pub mod stream;
pub mod tcp;

#[cfg(unix)]
pub mod uds;

pub use dial::{dialer_fn, DialFn, Dialer, Listener};
pub use error::{Result, TransportError};
pub use memory::{MemoryDialer, MemoryListener};
pub use stream::RpcStream;
pub use tcp::{TcpAcceptor, TcpDialer};

#[cfg(unix)]
pub use uds::{UnixAcceptor, UnixDialer};
