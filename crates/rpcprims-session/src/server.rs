use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use rpcprims_transport::{Listener, RpcStream, TcpAcceptor, TransportError};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::codec::{Codec, JsonCodec};
use crate::config::ServerConfig;
use crate::error::{Result, RpcError};
use crate::router::Router;
use crate::session::Session;

/// Accepting side: turns every accepted stream into a [`Session`] bound to
/// one shared router.
///
/// A server is single-use; after [`stop`](Server::stop) further `serve`
/// calls return immediately.
pub struct Server<C: Codec = JsonCodec> {
    inner: Arc<ServerInner<C>>,
}

impl<C: Codec> Clone for Server<C> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

struct Registry<C: Codec> {
    sessions: HashMap<u64, Session<C>>,
    /// Slots held by connections admitted but not yet registered.
    reserved: usize,
    stopping: bool,
}

struct ServerInner<C: Codec> {
    router: Router<C>,
    codec: Arc<C>,
    config: ServerConfig,
    registry: Mutex<Registry<C>>,
    shutdown: CancellationToken,
    tasks: TaskTracker,
}

impl Server<JsonCodec> {
    pub fn new() -> Self {
        Self::with_config(Router::new(), JsonCodec, ServerConfig::default())
    }
}

impl Default for Server<JsonCodec> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C: Codec> Server<C> {
    pub fn with_config(router: Router<C>, codec: C, config: ServerConfig) -> Self {
        Self {
            inner: Arc::new(ServerInner {
                router,
                codec: Arc::new(codec),
                config,
                registry: Mutex::new(Registry {
                    sessions: HashMap::new(),
                    reserved: 0,
                    stopping: false,
                }),
                shutdown: CancellationToken::new(),
                tasks: TaskTracker::new(),
            }),
        }
    }

    /// Router shared by every session this server accepts.
    pub fn handler(&self) -> &Router<C> {
        &self.inner.router
    }

    pub fn config(&self) -> &ServerConfig {
        &self.inner.config
    }

    /// Live sessions, for server-initiated calls.
    pub fn sessions(&self) -> Vec<Session<C>> {
        self.inner.registry().sessions.values().cloned().collect()
    }

    pub fn session_count(&self) -> usize {
        self.inner.registry().sessions.len()
    }

    /// Bind `addr` over TCP and serve until [`stop`](Server::stop).
    pub async fn run_tcp(&self, addr: impl AsRef<str>) -> Result<()> {
        let acceptor = TcpAcceptor::bind(addr).await?;
        self.serve(acceptor).await
    }

    /// Accept connections from `listener` until [`stop`](Server::stop).
    ///
    /// Transient accept errors are logged and retried after
    /// `accept_backoff`. A listener that reports shutdown ends the loop
    /// cleanly; any other accept error is returned.
    pub async fn serve<L: Listener>(&self, listener: L) -> Result<()> {
        let _running = self.inner.tasks.token();
        let local = listener.describe();
        info!(listener = %local, "server accepting connections");

        let outcome = loop {
            let accepted = tokio::select! {
                _ = self.inner.shutdown.cancelled() => break Ok(()),
                accepted = listener.accept() => accepted,
            };
            match accepted {
                Ok(stream) => self.admit(stream),
                Err(TransportError::Shutdown) => break Ok(()),
                Err(err) if err.is_transient() => {
                    warn!(listener = %local, error = %err, "accept failed; retrying");
                    tokio::select! {
                        _ = self.inner.shutdown.cancelled() => break Ok(()),
                        _ = tokio::time::sleep(self.inner.config.accept_backoff) => {}
                    }
                }
                Err(err) => break Err(RpcError::Transport(err)),
            }
        };

        info!(listener = %local, "server stopped accepting");
        outcome
    }

    fn admit(&self, stream: RpcStream) {
        let peer = stream.peer().to_string();
        {
            let mut registry = self.inner.registry();
            if let Err(reason) = registry.can_admit(self.inner.config.max_sessions) {
                drop(registry);
                warn!(%peer, reason, "rejecting connection");
                return;
            }
            registry.reserved += 1;
        }

        // Connect hooks may lock the registry.
        let session = Session::spawn(
            stream,
            self.inner.router.clone(),
            Arc::clone(&self.inner.codec),
            self.inner.config.session.clone(),
        );

        {
            let mut registry = self.inner.registry();
            registry.reserved -= 1;
            if registry.stopping {
                drop(registry);
                debug!(session_id = session.id(), %peer, "server stopped during admission");
                session.close();
                return;
            }
            registry.sessions.insert(session.id(), session.clone());
        }
        debug!(session_id = session.id(), %peer, "session registered");

        let inner = Arc::clone(&self.inner);
        self.inner.tasks.spawn(async move {
            session.closed().await;
            inner.registry().sessions.remove(&session.id());
            debug!(session_id = session.id(), "session unregistered");
        });
    }

    /// Stop accepting, close every live session and wait for all tasks.
    pub async fn stop(&self) {
        let sessions: Vec<Session<C>> = {
            let mut registry = self.inner.registry();
            registry.stopping = true;
            registry.sessions.values().cloned().collect()
        };
        info!(sessions = sessions.len(), "stopping server");

        self.inner.shutdown.cancel();
        for session in &sessions {
            session.close();
        }
        for session in &sessions {
            session.closed().await;
        }
        self.inner.tasks.close();
        self.inner.tasks.wait().await;
        debug!("server stopped");
    }
}

impl<C: Codec> ServerInner<C> {
    fn registry(&self) -> MutexGuard<'_, Registry<C>> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<C: Codec> Registry<C> {
    fn can_admit(&self, max_sessions: Option<usize>) -> std::result::Result<(), &'static str> {
        if self.stopping {
            return Err("server stopping");
        }
        if max_sessions.is_some_and(|max| self.sessions.len() + self.reserved >= max) {
            return Err("session limit reached");
        }
        Ok(())
    }
}

impl<C: Codec> std::fmt::Debug for Server<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("sessions", &self.session_count())
            .field("routes", &self.inner.router.routes())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use rpcprims_transport::memory;

    use super::*;
    use crate::client::Client;
    use crate::context::Context;

    fn echo_server(config: ServerConfig) -> Server {
        let server = Server::with_config(Router::new(), JsonCodec, config);
        server.handler().handle("/echo", |ctx: Context| async move {
            let body: String = ctx.bind().unwrap();
            ctx.write(&body).await.unwrap();
        });
        server
    }

    #[tokio::test]
    async fn serves_memory_clients_and_tracks_sessions() {
        let server = echo_server(ServerConfig::default());
        let (listener, dialer) = memory::channel("server");
        let serving = tokio::spawn({
            let server = server.clone();
            async move { server.serve(listener).await }
        });

        let client = Client::new(dialer);
        client.run().await.unwrap();
        let reply: String = client
            .call("/echo", &"hi", Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(reply, "hi");
        assert_eq!(server.session_count(), 1);

        client.stop().await.unwrap();
        tokio::time::timeout(Duration::from_secs(1), async {
            while server.session_count() > 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        server.stop().await;
        serving.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn max_sessions_rejects_extra_connections() {
        let server = echo_server(ServerConfig {
            max_sessions: Some(1),
            ..ServerConfig::default()
        });
        let connected = Arc::new(AtomicUsize::new(0));
        let disconnected = Arc::new(AtomicUsize::new(0));
        {
            let connected = Arc::clone(&connected);
            server.handler().on_connected(move |_session| {
                connected.fetch_add(1, Ordering::SeqCst);
            });
            let disconnected = Arc::clone(&disconnected);
            server.handler().on_disconnected(move |_session| {
                disconnected.fetch_add(1, Ordering::SeqCst);
            });
        }
        let (listener, dialer) = memory::channel("limited");
        tokio::spawn({
            let server = server.clone();
            async move { server.serve(listener).await }
        });

        let first = Client::new(dialer.clone());
        first.run().await.unwrap();
        let _: String = first
            .call("/echo", &"one", Duration::from_secs(1))
            .await
            .unwrap();

        let second = Client::new(dialer);
        second.run().await.unwrap();
        let rejected = second.session().unwrap();
        tokio::time::timeout(Duration::from_secs(1), rejected.closed())
            .await
            .unwrap();
        let err = second
            .call::<_, String>("/echo", &"two", Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, RpcError::ConnectionClosed));
        assert_eq!(server.session_count(), 1);
        assert_eq!(connected.load(Ordering::SeqCst), 1);
        assert_eq!(disconnected.load(Ordering::SeqCst), 0);

        server.stop().await;
        assert_eq!(disconnected.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn stop_fails_outstanding_client_calls() {
        let server = Server::new();
        server.handler().handle("/hang", |_ctx: Context| async {
            tokio::time::sleep(Duration::from_secs(30)).await;
        });
        let (listener, dialer) = memory::channel("stopping");
        tokio::spawn({
            let server = server.clone();
            async move { server.serve(listener).await }
        });

        let client = Client::new(dialer);
        client.run().await.unwrap();
        let waiting = {
            let client = client.clone();
            tokio::spawn(async move {
                client
                    .call::<_, String>("/hang", &"x", Duration::from_secs(30))
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(30)).await;

        tokio::time::timeout(Duration::from_secs(2), server.stop())
            .await
            .unwrap();
        let outcome = tokio::time::timeout(Duration::from_secs(2), waiting)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(outcome, Err(RpcError::ConnectionClosed)));
        assert_eq!(server.session_count(), 0);
    }

    #[tokio::test]
    async fn server_can_call_connected_clients() {
        let server = Server::new();
        let (listener, dialer) = memory::channel("push");
        tokio::spawn({
            let server = server.clone();
            async move { server.serve(listener).await }
        });

        let client = Client::new(dialer);
        client.handler().handle("/ping", |ctx: Context| async move {
            ctx.write(&"pong").await.unwrap();
        });
        client.run().await.unwrap();

        let session = tokio::time::timeout(Duration::from_secs(1), async {
            loop {
                if let Some(session) = server.sessions().pop() {
                    break session;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        let reply: String = session
            .call("/ping", &"", Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(reply, "pong");
        server.stop().await;
    }
}
