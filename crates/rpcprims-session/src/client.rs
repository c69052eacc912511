use std::any::Any;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use rpcprims_transport::{Dialer, RpcStream};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::codec::{Codec, JsonCodec};
use crate::config::{ClientConfig, ReconnectPolicy};
use crate::context::Context;
use crate::error::{Result, RpcError};
use crate::router::Router;
use crate::session::Session;

/// Dialing side of a connection.
///
/// Constructed idle; [`run`](Client::run) dials and starts a session. The
/// client owns a [`Router`] too, so the server can call back into it.
pub struct Client<C: Codec = JsonCodec> {
    inner: Arc<ClientInner<C>>,
}

impl<C: Codec> Clone for Client<C> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

struct ClientInner<C: Codec> {
    dialer: Arc<dyn Dialer>,
    router: Router<C>,
    codec: Arc<C>,
    config: ClientConfig,
    session: RwLock<Option<Session<C>>>,
    running: Mutex<Option<RunState>>,
}

struct RunState {
    stop: CancellationToken,
    supervisor: Option<JoinHandle<()>>,
}

impl Client<JsonCodec> {
    /// A client with its own router, JSON payloads and default settings.
    pub fn new(dialer: impl Dialer) -> Self {
        Self::with_config(dialer, Router::new(), JsonCodec, ClientConfig::default())
    }
}

impl<C: Codec> Client<C> {
    pub fn with_config(dialer: impl Dialer, router: Router<C>, codec: C, config: ClientConfig) -> Self {
        Self::from_shared(Arc::new(dialer), router, Arc::new(codec), config)
    }

    pub(crate) fn from_shared(
        dialer: Arc<dyn Dialer>,
        router: Router<C>,
        codec: Arc<C>,
        config: ClientConfig,
    ) -> Self {
        Self {
            inner: Arc::new(ClientInner {
                dialer,
                router,
                codec,
                config,
                session: RwLock::new(None),
                running: Mutex::new(None),
            }),
        }
    }

    /// Router serving calls the remote makes into this client.
    pub fn handler(&self) -> &Router<C> {
        &self.inner.router
    }

    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    /// The current session, if one is live or was live before a drop.
    pub fn session(&self) -> Option<Session<C>> {
        self.inner.current()
    }

    /// Whether a session is connected right now.
    pub fn is_running(&self) -> bool {
        self.inner.current().is_some_and(|session| !session.is_closed())
    }

    /// Dial and start a session.
    ///
    /// Idempotent while running. A client whose session dropped without a
    /// reconnect policy dials again.
    pub async fn run(&self) -> Result<()> {
        let mut running = self.inner.running.lock().await;
        if let Some(state) = running.as_ref() {
            let supervised = state
                .supervisor
                .as_ref()
                .is_some_and(|supervisor| !supervisor.is_finished());
            if supervised || self.is_running() {
                return Ok(());
            }
        }

        let session = self.inner.dial_session().await?;
        self.inner.replace(Some(session.clone()));

        let stop = CancellationToken::new();
        let supervisor = self.inner.config.reconnect.clone().map(|policy| {
            tokio::spawn(supervise(
                Arc::clone(&self.inner),
                session.clone(),
                policy,
                stop.clone(),
            ))
        });
        if let Some(previous) = running.replace(RunState { stop, supervisor }) {
            previous.stop.cancel();
        }

        info!(
            target_addr = %self.inner.dialer.describe(),
            session_id = session.id(),
            "client running"
        );
        Ok(())
    }

    /// Stop reconnecting, close the session and wait for it to finish.
    pub async fn stop(&self) -> Result<()> {
        let mut running = self.inner.running.lock().await;
        let Some(state) = running.take() else {
            return Ok(());
        };
        state.stop.cancel();
        if let Some(supervisor) = state.supervisor {
            if let Err(err) = supervisor.await {
                warn!(error = %err, "reconnect supervisor failed");
            }
        }
        if let Some(session) = self.inner.replace(None) {
            session.close();
            session.closed().await;
        }
        debug!(target_addr = %self.inner.dialer.describe(), "client stopped");
        Ok(())
    }

    fn live(&self) -> Result<Session<C>> {
        self.inner.current().ok_or(RpcError::NotRunning)
    }

    /// See [`Session::call`].
    pub async fn call<Req, Resp>(&self, method: &str, req: &Req, timeout: Duration) -> Result<Resp>
    where
        Req: Serialize + Any + Sync,
        Resp: DeserializeOwned + Any,
    {
        self.live()?.call(method, req, timeout).await
    }

    /// See [`Session::call_with`].
    pub async fn call_with<Req, Resp>(
        &self,
        token: &CancellationToken,
        method: &str,
        req: &Req,
    ) -> Result<Resp>
    where
        Req: Serialize + Any + Sync,
        Resp: DeserializeOwned + Any,
    {
        self.live()?.call_with(token, method, req).await
    }

    /// See [`Session::call_async`].
    pub async fn call_async<Req, F>(
        &self,
        method: &str,
        req: &Req,
        callback: F,
        timeout: Duration,
    ) -> Result<()>
    where
        Req: Serialize + Any + Sync,
        F: FnOnce(Result<Context<C>>) + Send + 'static,
    {
        self.live()?.call_async(method, req, callback, timeout).await
    }

    /// See [`Session::call_async_with`].
    pub async fn call_async_with<Req, F>(
        &self,
        token: &CancellationToken,
        method: &str,
        req: &Req,
        callback: F,
    ) -> Result<()>
    where
        Req: Serialize + Any + Sync,
        F: FnOnce(Result<Context<C>>) + Send + 'static,
    {
        self.live()?
            .call_async_with(token, method, req, callback)
            .await
    }

    /// See [`Session::notify`].
    pub async fn notify<Req>(&self, method: &str, req: &Req, timeout: Duration) -> Result<()>
    where
        Req: Serialize + Any + Sync,
    {
        self.live()?.notify(method, req, timeout).await
    }

    /// See [`Session::notify_with`].
    pub async fn notify_with<Req>(
        &self,
        token: &CancellationToken,
        method: &str,
        req: &Req,
    ) -> Result<()>
    where
        Req: Serialize + Any + Sync,
    {
        self.live()?.notify_with(token, method, req).await
    }
}

impl<C: Codec> ClientInner<C> {
    fn current(&self) -> Option<Session<C>> {
        self.session
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn replace(&self, session: Option<Session<C>>) -> Option<Session<C>> {
        let mut slot = self.session.write().unwrap_or_else(PoisonError::into_inner);
        std::mem::replace(&mut *slot, session)
    }

    fn start(&self, stream: RpcStream) -> Session<C> {
        Session::spawn(
            stream,
            self.router.clone(),
            Arc::clone(&self.codec),
            self.config.session.clone(),
        )
    }

    async fn dial_session(&self) -> Result<Session<C>> {
        let attempts = self.config.dial_attempts.max(1);
        let mut attempt = 1;
        loop {
            match self.dialer.dial().await {
                Ok(stream) => return Ok(self.start(stream)),
                Err(err) if attempt < attempts => {
                    warn!(
                        target_addr = %self.dialer.describe(),
                        attempt,
                        attempts,
                        error = %err,
                        "dial failed; retrying"
                    );
                    tokio::time::sleep(self.config.dial_backoff).await;
                    attempt += 1;
                }
                Err(err) => return Err(RpcError::Transport(err)),
            }
        }
    }
}

/// Re-dial whenever the live session drops, until `stop` fires.
async fn supervise<C: Codec>(
    inner: Arc<ClientInner<C>>,
    mut session: Session<C>,
    policy: ReconnectPolicy,
    stop: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = stop.cancelled() => return,
            _ = session.closed() => {}
        }
        warn!(
            session_id = session.id(),
            target_addr = %inner.dialer.describe(),
            "session lost; reconnecting"
        );

        let mut backoff = policy.initial_backoff;
        let mut attempt: u32 = 0;
        session = loop {
            if policy.max_attempts.is_some_and(|max| attempt >= max) {
                warn!(attempts = attempt, "giving up on reconnect");
                return;
            }
            attempt += 1;
            tokio::select! {
                _ = stop.cancelled() => return,
                _ = tokio::time::sleep(backoff) => {}
            }
            let dialed = tokio::select! {
                _ = stop.cancelled() => return,
                dialed = inner.dialer.dial() => dialed,
            };
            match dialed {
                Ok(stream) => break inner.start(stream),
                Err(err) => {
                    debug!(attempt, error = %err, "reconnect attempt failed");
                    backoff = policy.next_backoff(backoff);
                }
            }
        };

        inner.replace(Some(session.clone()));
        info!(session_id = session.id(), attempt, "reconnected");
    }
}

impl<C: Codec> std::fmt::Debug for Client<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("target", &self.inner.dialer.describe())
            .field("session", &self.inner.current().map(|s| s.id()))
            .finish()
    }
}
