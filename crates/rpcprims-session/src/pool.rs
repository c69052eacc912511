use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use rpcprims_transport::Dialer;
use tracing::{debug, info, warn};

use crate::client::Client;
use crate::codec::{Codec, JsonCodec};
use crate::config::ClientConfig;
use crate::error::{Result, RpcError};
use crate::router::Router;

/// A fixed set of clients to one endpoint, handed out round-robin.
///
/// Every member shares the pool's router, codec and dialer. Construction is
/// all-or-nothing: if any member fails to dial, the members already started
/// are stopped and the dial error is returned.
pub struct ClientPool<C: Codec = JsonCodec> {
    clients: Vec<Client<C>>,
    router: Router<C>,
    cursor: AtomicUsize,
}

impl ClientPool<JsonCodec> {
    /// `size` JSON clients with default settings, all connected.
    pub async fn new(dialer: impl Dialer, size: usize) -> Result<Self> {
        Self::with_config(dialer, size, Router::new(), JsonCodec, ClientConfig::default()).await
    }
}

impl<C: Codec> ClientPool<C> {
    pub async fn with_config(
        dialer: impl Dialer,
        size: usize,
        router: Router<C>,
        codec: C,
        config: ClientConfig,
    ) -> Result<Self> {
        if size == 0 {
            return Err(RpcError::InvalidPoolSize);
        }
        let dialer: Arc<dyn Dialer> = Arc::new(dialer);
        let codec = Arc::new(codec);

        let mut clients: Vec<Client<C>> = Vec::with_capacity(size);
        for index in 0..size {
            let client = Client::from_shared(
                Arc::clone(&dialer),
                router.clone(),
                Arc::clone(&codec),
                config.clone(),
            );
            if let Err(err) = client.run().await {
                warn!(
                    target_addr = %dialer.describe(),
                    member = index,
                    size,
                    error = %err,
                    "pool member failed to start; unwinding"
                );
                // The dial error is the one reported.
                for started in &clients {
                    if let Err(err) = started.stop().await {
                        debug!(error = %err, "pool member stop failed during unwind");
                    }
                }
                return Err(err);
            }
            clients.push(client);
        }

        info!(target_addr = %dialer.describe(), size, "client pool ready");
        Ok(Self {
            clients,
            router,
            cursor: AtomicUsize::new(0),
        })
    }

    pub fn size(&self) -> usize {
        self.clients.len()
    }

    /// Member `index % size`.
    pub fn get(&self, index: usize) -> &Client<C> {
        &self.clients[index % self.clients.len()]
    }

    /// The next member in round-robin order.
    pub fn next(&self) -> &Client<C> {
        // The cursor stays below `size`, so it never wraps mid-lap.
        let len = self.clients.len();
        let index = self
            .cursor
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |cur| Some((cur + 1) % len))
            .unwrap_or_else(|cur| cur);
        &self.clients[index]
    }

    /// Router shared by every member.
    pub fn handler(&self) -> &Router<C> {
        &self.router
    }

    pub fn clients(&self) -> &[Client<C>] {
        &self.clients
    }

    /// Run every member. All are attempted; the first error is returned.
    pub async fn run(&self) -> Result<()> {
        let mut first = None;
        for client in &self.clients {
            if let Err(err) = client.run().await {
                warn!(error = %err, "pool member failed to run");
                first.get_or_insert(err);
            }
        }
        first.map_or(Ok(()), Err)
    }

    /// Stop every member. All are attempted; the first error is returned.
    pub async fn stop(&self) -> Result<()> {
        let mut first = None;
        for client in &self.clients {
            if let Err(err) = client.stop().await {
                warn!(error = %err, "pool member failed to stop");
                first.get_or_insert(err);
            }
        }
        first.map_or(Ok(()), Err)
    }
}

impl<C: Codec> std::fmt::Debug for ClientPool<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientPool")
            .field("size", &self.clients.len())
            .field("cursor", &self.cursor.load(Ordering::Relaxed))
            .finish()
    }
}
