use std::net::SocketAddr;
use std::time::Duration;

use futures_core::future::BoxFuture;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info};

use crate::dial::{Dialer, Listener};
use crate::error::{Result, TransportError};
use crate::stream::RpcStream;

/// Default connect timeout for [`TcpDialer`].
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Dials a TCP address with a bounded connect timeout.
#[derive(Debug, Clone)]
pub struct TcpDialer {
    addr: String,
    connect_timeout: Duration,
    nodelay: bool,
}

impl TcpDialer {
    /// Dial `addr` (`host:port`) with the default timeout and `TCP_NODELAY` set.
    pub fn new(addr: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            nodelay: true,
        }
    }

    /// Override the connect timeout.
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Toggle `TCP_NODELAY` on dialed streams.
    pub fn with_nodelay(mut self, nodelay: bool) -> Self {
        self.nodelay = nodelay;
        self
    }

    /// Target address.
    pub fn addr(&self) -> &str {
        &self.addr
    }

    async fn connect(&self) -> Result<RpcStream> {
        let stream = tokio::time::timeout(self.connect_timeout, TcpStream::connect(&self.addr))
            .await
            .map_err(|_| TransportError::ConnectTimeout {
                addr: self.addr.clone(),
                timeout: self.connect_timeout,
            })?
            .map_err(|source| TransportError::Connect {
                addr: self.addr.clone(),
                source,
            })?;
        stream.set_nodelay(self.nodelay)?;
        debug!(addr = %self.addr, "connected over tcp");
        Ok(RpcStream::from_tcp(stream))
    }
}

impl Dialer for TcpDialer {
    fn dial(&self) -> BoxFuture<'_, Result<RpcStream>> {
        Box::pin(self.connect())
    }

    fn describe(&self) -> String {
        format!("tcp://{}", self.addr)
    }
}

/// Accepts TCP connections on a bound address.
#[derive(Debug)]
pub struct TcpAcceptor {
    listener: TcpListener,
    local_addr: SocketAddr,
    nodelay: bool,
}

impl TcpAcceptor {
    /// Bind and listen on `addr`. Use port `0` for an ephemeral port.
    pub async fn bind(addr: impl AsRef<str>) -> Result<Self> {
        let addr = addr.as_ref();
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| TransportError::Bind {
                addr: addr.to_string(),
                source,
            })?;
        let local_addr = listener.local_addr()?;
        info!(%local_addr, "listening on tcp");
        Ok(Self {
            listener,
            local_addr,
            nodelay: true,
        })
    }

    /// The bound local address (useful with ephemeral ports).
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    async fn accept_stream(&self) -> Result<RpcStream> {
        let (stream, peer) = self
            .listener
            .accept()
            .await
            .map_err(TransportError::Accept)?;
        stream.set_nodelay(self.nodelay)?;
        debug!(%peer, "accepted tcp connection");
        Ok(RpcStream::from_tcp(stream))
    }
}

impl Listener for TcpAcceptor {
    fn accept(&self) -> BoxFuture<'_, Result<RpcStream>> {
        Box::pin(self.accept_stream())
    }

    fn describe(&self) -> String {
        format!("tcp://{}", self.local_addr)
    }
}
