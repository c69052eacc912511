//! In-process transport built on [`tokio::io::duplex`].
//!
//! Useful for tests and for wiring a client and server inside one process
//! without touching the network.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures_core::future::BoxFuture;
use tokio::sync::{mpsc, Mutex};
use tracing::debug;

use crate::dial::{Dialer, Listener};
use crate::error::{Result, TransportError};
use crate::stream::RpcStream;

/// Default per-direction pipe buffer.
pub const DEFAULT_PIPE_CAPACITY: usize = 64 * 1024;

/// Accepts streams produced by paired [`MemoryDialer`]s.
#[derive(Debug)]
pub struct MemoryListener {
    incoming: Mutex<mpsc::Receiver<RpcStream>>,
    name: String,
}

/// Opens a new in-memory pipe and hands the far end to the paired listener.
#[derive(Debug, Clone)]
pub struct MemoryDialer {
    outgoing: mpsc::Sender<RpcStream>,
    name: String,
    capacity: usize,
    next_id: Arc<AtomicU64>,
}

/// Create a connected listener/dialer pair.
pub fn channel(name: impl Into<String>) -> (MemoryListener, MemoryDialer) {
    channel_with_capacity(name, DEFAULT_PIPE_CAPACITY)
}

/// Create a connected pair with an explicit pipe buffer size.
pub fn channel_with_capacity(
    name: impl Into<String>,
    capacity: usize,
) -> (MemoryListener, MemoryDialer) {
    let name = name.into();
    let (tx, rx) = mpsc::channel(16);
    (
        MemoryListener {
            incoming: Mutex::new(rx),
            name: name.clone(),
        },
        MemoryDialer {
            outgoing: tx,
            name,
            capacity,
            next_id: Arc::new(AtomicU64::new(1)),
        },
    )
}

impl MemoryDialer {
    async fn connect(&self) -> Result<RpcStream> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (near, far) = tokio::io::duplex(self.capacity);
        let far = RpcStream::from_memory(far, format!("memory:{}#{id}/dialer", self.name));
        self.outgoing
            .send(far)
            .await
            .map_err(|_| TransportError::Connect {
                addr: format!("memory:{}", self.name),
                source: std::io::Error::new(
                    std::io::ErrorKind::ConnectionRefused,
                    "memory listener dropped",
                ),
            })?;
        debug!(name = %self.name, id, "opened memory pipe");
        Ok(RpcStream::from_memory(
            near,
            format!("memory:{}#{id}/listener", self.name),
        ))
    }
}

impl Dialer for MemoryDialer {
    fn dial(&self) -> BoxFuture<'_, Result<RpcStream>> {
        Box::pin(self.connect())
    }

    fn describe(&self) -> String {
        format!("memory://{}", self.name)
    }
}

impl MemoryListener {
    async fn accept_stream(&self) -> Result<RpcStream> {
        self.incoming
            .lock()
            .await
            .recv()
            .await
            .ok_or(TransportError::Shutdown)
    }
}

impl Listener for MemoryListener {
    fn accept(&self) -> BoxFuture<'_, Result<RpcStream>> {
        Box::pin(self.accept_stream())
    }

    fn describe(&self) -> String {
        format!("memory://{}", self.name)
    }
}
