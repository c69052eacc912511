//! One multiplexed RPC connection.
//!
//! ```text
//!   callers ──► outbound queue ──► writer task ──► stream
//!                                                    │
//!   pending table ◄── replies ◄── reader task ◄──────┘
//!                                     │
//!                     requests ──► dispatch task per message ──► Router
//! ```
//!
//! Only the reader task reads from the stream and only the writer task
//! writes to it. Every other path talks to them through the pending table
//! and the outbound queue.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{FutureExt, SinkExt, StreamExt};
use rpcprims_frame::{validate_message, ErrorCode, Message, MessageCodec, MessageKind};
use rpcprims_transport::RpcStream;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{ReadHalf, WriteHalf};
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, trace, warn};

use crate::codec::{decode_payload, encode_payload, Codec, JsonCodec};
use crate::config::SessionConfig;
use crate::context::Context;
use crate::error::{Result, RpcError, SendError};
use crate::pending::{Callback, PendingCall, PendingGuard, PendingTable};
use crate::router::Router;

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

/// Stand-in deadline for limits too large to add to `Instant::now()`.
const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365 * 30);

struct Outbound {
    message: Message,
    ack: oneshot::Sender<std::result::Result<(), SendError>>,
}

/// What bounds a send and the wait that follows it.
#[derive(Clone, Copy)]
enum Bound<'a> {
    Deadline { at: Instant, limit: Duration },
    Token(&'a CancellationToken),
}

impl<'a> Bound<'a> {
    fn timeout(limit: Duration) -> Self {
        let now = Instant::now();
        Bound::Deadline {
            at: now.checked_add(limit).unwrap_or(now + FAR_FUTURE),
            limit,
        }
    }

    fn is_canceled(&self) -> bool {
        matches!(self, Bound::Token(token) if token.is_cancelled())
    }

    /// Resolves when the bound expires, yielding the error to report.
    async fn expired(self) -> RpcError {
        match self {
            Bound::Deadline { at, limit } => {
                tokio::time::sleep_until(at).await;
                RpcError::Timeout(limit)
            }
            Bound::Token(token) => {
                token.cancelled().await;
                RpcError::Canceled
            }
        }
    }

    fn into_owned(self) -> OwnedBound {
        match self {
            Bound::Deadline { at, limit } => OwnedBound::Deadline { at, limit },
            Bound::Token(token) => OwnedBound::Token(token.clone()),
        }
    }
}

enum OwnedBound {
    Deadline { at: Instant, limit: Duration },
    Token(CancellationToken),
}

impl OwnedBound {
    fn as_bound(&self) -> Bound<'_> {
        match self {
            OwnedBound::Deadline { at, limit } => Bound::Deadline {
                at: *at,
                limit: *limit,
            },
            OwnedBound::Token(token) => Bound::Token(token),
        }
    }
}

struct SessionInner<C: Codec> {
    id: u64,
    peer: String,
    transport: &'static str,
    codec: Arc<C>,
    router: Router<C>,
    config: SessionConfig,
    pending: PendingTable<C>,
    next_seq: AtomicU64,
    outbound: mpsc::Sender<Outbound>,
    closing: AtomicBool,
    shutdown: CancellationToken,
    closed: CancellationToken,
    tasks: TaskTracker,
}

/// Handle to a running connection. Cheap to clone.
pub struct Session<C: Codec = JsonCodec> {
    inner: Arc<SessionInner<C>>,
}

impl<C: Codec> Clone for Session<C> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<C: Codec> Session<C> {
    /// Start a session over `stream`.
    ///
    /// Spawns the reader and writer tasks, then fires the router's
    /// `on_connected` hook. Must be called from within a tokio runtime.
    pub fn spawn(stream: RpcStream, router: Router<C>, codec: Arc<C>, config: SessionConfig) -> Self {
        let id = NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed);
        let peer = stream.peer().to_string();
        let transport = stream.transport_name();
        let (read_half, write_half) = tokio::io::split(stream);
        let (outbound, queue) = mpsc::channel(config.send_queue_size.max(1));

        let reader = FramedRead::new(read_half, MessageCodec::new(config.frame.clone()));
        let writer = FramedWrite::new(write_half, MessageCodec::new(config.frame.clone()));

        let session = Self {
            inner: Arc::new(SessionInner {
                id,
                peer,
                transport,
                codec,
                router,
                config,
                pending: PendingTable::new(),
                next_seq: AtomicU64::new(1),
                outbound,
                closing: AtomicBool::new(false),
                shutdown: CancellationToken::new(),
                closed: CancellationToken::new(),
                tasks: TaskTracker::new(),
            }),
        };

        info!(
            session_id = id,
            peer = %session.inner.peer,
            transport,
            "session opened"
        );

        session.inner.tasks.spawn(session.clone().write_loop(writer, queue));
        session.inner.tasks.spawn(session.clone().read_loop(reader));
        session.inner.tasks.close();

        session.inner.router.fire_connected(&session);
        session
    }

    /// Process-unique session id.
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    /// Peer label reported by the transport.
    pub fn peer(&self) -> &str {
        &self.inner.peer
    }

    /// Transport name reported by the stream.
    pub fn transport(&self) -> &'static str {
        self.inner.transport
    }

    pub fn router(&self) -> &Router<C> {
        &self.inner.router
    }

    pub fn codec(&self) -> &C {
        &self.inner.codec
    }

    pub fn config(&self) -> &SessionConfig {
        &self.inner.config
    }

    /// Number of calls waiting for a reply.
    pub fn pending_len(&self) -> usize {
        self.inner.pending.len()
    }

    /// Whether shutdown has begun.
    pub fn is_closed(&self) -> bool {
        self.inner.closing.load(Ordering::Acquire)
    }

    /// Call `method` and wait up to `timeout` for the reply.
    ///
    /// The timeout covers queuing and writing the request as well.
    pub async fn call<Req, Resp>(&self, method: &str, req: &Req, timeout: Duration) -> Result<Resp>
    where
        Req: Serialize + Any + Sync,
        Resp: DeserializeOwned + Any,
    {
        let reply = self.round_trip(method, req, Bound::timeout(timeout)).await?;
        self.decode_reply(&reply)
    }

    /// Call `method` and wait for the reply until `token` is canceled.
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
        let reply = self.round_trip(method, req, Bound::Token(token)).await?;
        self.decode_reply(&reply)
    }

    /// Send a Call and return once it is written.
    ///
    /// `callback` runs exactly once, on the session's reader task, with the
    /// reply context or with `Timeout`, `RouteNotFound`, `Remote` or
    /// `ConnectionClosed`. If this returns an error the callback never runs.
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
        self.submit(method, req, Box::new(callback), Bound::timeout(timeout))
            .await
    }

    /// As [`call_async`](Self::call_async), bounded by `token` instead of a
    /// timeout. A token that is already canceled yields `Err(Canceled)`
    /// without sending anything.
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
        self.submit(method, req, Box::new(callback), Bound::Token(token))
            .await
    }

    /// Send a Notify, waiting at most `timeout` for it to be written.
    pub async fn notify<Req>(&self, method: &str, req: &Req, timeout: Duration) -> Result<()>
    where
        Req: Serialize + Any + Sync,
    {
        self.send_notify(method, req, Bound::timeout(timeout)).await
    }

    /// Send a Notify, giving up when `token` is canceled.
    pub async fn notify_with<Req>(
        &self,
        token: &CancellationToken,
        method: &str,
        req: &Req,
    ) -> Result<()>
    where
        Req: Serialize + Any + Sync,
    {
        self.send_notify(method, req, Bound::Token(token)).await
    }

    /// Begin shutdown. Idempotent.
    ///
    /// Every pending call fails with `ConnectionClosed` before this returns.
    pub fn close(&self) {
        if self.inner.closing.swap(true, Ordering::AcqRel) {
            return;
        }
        let failed = self.inner.pending.drain();
        debug!(
            session_id = self.inner.id,
            pending = failed.len(),
            "closing session"
        );
        for call in failed {
            call.complete(Err(RpcError::ConnectionClosed), self);
        }
        self.inner.shutdown.cancel();
        self.inner.router.fire_disconnected(self);
        self.inner.closed.cancel();
        info!(session_id = self.inner.id, peer = %self.inner.peer, "session closed");
    }

    /// Wait until the session has closed and its tasks have finished.
    pub async fn closed(&self) {
        self.inner.closed.cancelled().await;
        self.inner.tasks.wait().await;
    }

    pub(crate) async fn send_reply(&self, message: Message) -> Result<()> {
        if self.is_closed() {
            return Err(RpcError::ConnectionClosed);
        }
        self.enqueue(message).await.map_err(RpcError::Send)
    }

    fn next_seq(&self) -> u64 {
        loop {
            let seq = self.inner.next_seq.fetch_add(1, Ordering::Relaxed);
            if seq != 0 {
                return seq;
            }
        }
    }

    fn decode_reply<Resp: DeserializeOwned + Any>(&self, reply: &Message) -> Result<Resp> {
        decode_payload(&*self.inner.codec, &reply.payload).map_err(RpcError::Decode)
    }

    async fn round_trip<Req>(&self, method: &str, req: &Req, bound: Bound<'_>) -> Result<Message>
    where
        Req: Serialize + Any + Sync,
    {
        let payload = encode_payload(&*self.inner.codec, req).map_err(RpcError::Encode)?;
        if bound.is_canceled() {
            return Err(RpcError::Canceled);
        }

        let (tx, mut rx) = oneshot::channel();
        let seq = self
            .inner
            .pending
            .register(|| self.next_seq(), PendingCall::waiter(method, tx))?;
        let mut guard = PendingGuard::new(&self.inner.pending, seq);

        self.send_bounded(Message::call(seq, method, payload), bound)
            .await?;
        trace!(session_id = self.inner.id, seq, %method, "call sent");

        let outcome = tokio::select! {
            outcome = &mut rx => outcome,
            err = bound.expired() => {
                if self.inner.pending.take(seq).is_some() {
                    guard.disarm();
                    debug!(session_id = self.inner.id, seq, %method, error = %err, "call abandoned");
                    return Err(err);
                }
                // The reply won the race and is already on its way.
                rx.await
            }
        };
        guard.disarm();
        outcome.unwrap_or(Err(RpcError::ConnectionClosed))
    }

    async fn submit<Req>(
        &self,
        method: &str,
        req: &Req,
        callback: Callback<C>,
        bound: Bound<'_>,
    ) -> Result<()>
    where
        Req: Serialize + Any + Sync,
    {
        let payload = encode_payload(&*self.inner.codec, req).map_err(RpcError::Encode)?;
        if bound.is_canceled() {
            return Err(RpcError::Canceled);
        }

        let settled = CancellationToken::new();
        let seq = self.inner.pending.register(
            || self.next_seq(),
            PendingCall::callback(method, callback, settled.clone()),
        )?;
        let mut guard = PendingGuard::new(&self.inner.pending, seq);

        self.send_bounded(Message::call(seq, method, payload), bound)
            .await?;
        guard.disarm();
        trace!(session_id = self.inner.id, seq, %method, "async call sent");

        self.spawn_expiry(seq, settled, bound.into_owned());
        Ok(())
    }

    fn spawn_expiry(&self, seq: u64, settled: CancellationToken, bound: OwnedBound) {
        let session = self.clone();
        self.inner.tasks.spawn(async move {
            let err = tokio::select! {
                _ = settled.cancelled() => return,
                _ = session.inner.shutdown.cancelled() => return,
                err = bound.as_bound().expired() => err,
            };
            if let Some(call) = session.inner.pending.take(seq) {
                debug!(
                    session_id = session.inner.id,
                    seq,
                    method = %call.method(),
                    error = %err,
                    "async call abandoned"
                );
                call.complete(Err(err), &session);
            }
        });
    }

    async fn send_notify<Req>(&self, method: &str, req: &Req, bound: Bound<'_>) -> Result<()>
    where
        Req: Serialize + Any + Sync,
    {
        let payload = encode_payload(&*self.inner.codec, req).map_err(RpcError::Encode)?;
        if bound.is_canceled() {
            return Err(RpcError::Canceled);
        }
        let seq = self.next_seq();
        self.send_bounded(Message::notify(seq, method, payload), bound)
            .await?;
        trace!(session_id = self.inner.id, seq, %method, "notify sent");
        Ok(())
    }

    async fn send_bounded(&self, message: Message, bound: Bound<'_>) -> Result<()> {
        if self.is_closed() {
            return Err(RpcError::ConnectionClosed);
        }
        let send = self.enqueue(message);
        match bound {
            Bound::Deadline { at, limit } => match tokio::time::timeout_at(at, send).await {
                Ok(sent) => sent.map_err(RpcError::Send),
                Err(_) => Err(RpcError::Send(SendError::DeadlineExceeded(limit))),
            },
            Bound::Token(token) => tokio::select! {
                biased;
                _ = token.cancelled() => Err(RpcError::Canceled),
                sent = send => sent.map_err(RpcError::Send),
            },
        }
    }

    /// Queue a message for the writer and wait until it reaches the stream.
    async fn enqueue(&self, message: Message) -> std::result::Result<(), SendError> {
        validate_message(&message, &self.inner.config.frame)?;
        let (ack, written) = oneshot::channel();
        self.inner
            .outbound
            .send(Outbound { message, ack })
            .await
            .map_err(|_| SendError::QueueClosed)?;
        written.await.map_err(|_| SendError::QueueClosed)?
    }

    async fn write_loop(
        self,
        mut sink: FramedWrite<WriteHalf<RpcStream>, MessageCodec>,
        mut queue: mpsc::Receiver<Outbound>,
    ) {
        let mut healthy = true;
        loop {
            let Outbound { message, ack } = tokio::select! {
                _ = self.inner.shutdown.cancelled() => break,
                next = queue.recv() => match next {
                    Some(outbound) => outbound,
                    None => break,
                },
            };
            let seq = message.seq;
            let written = match self.inner.config.write_timeout {
                Some(limit) => match tokio::time::timeout(limit, sink.send(message)).await {
                    Ok(sent) => sent.map_err(SendError::from),
                    Err(_) => Err(SendError::DeadlineExceeded(limit)),
                },
                None => sink.send(message).await.map_err(SendError::from),
            };
            match written {
                Ok(()) => {
                    trace!(session_id = self.inner.id, seq, "frame written");
                    let _ = ack.send(Ok(()));
                }
                Err(SendError::Frame(err)) if !err.is_fatal() => {
                    debug!(session_id = self.inner.id, seq, error = %err, "outbound frame rejected");
                    let _ = ack.send(Err(SendError::Frame(err)));
                }
                Err(err) => {
                    warn!(session_id = self.inner.id, seq, error = %err, "write failed; closing session");
                    let _ = ack.send(Err(err));
                    healthy = false;
                    break;
                }
            }
        }

        queue.close();
        while let Ok(Outbound { ack, .. }) = queue.try_recv() {
            let _ = ack.send(Err(SendError::QueueClosed));
        }
        if healthy {
            if let Err(err) = sink.close().await {
                debug!(session_id = self.inner.id, error = %err, "stream shutdown failed");
            }
        }
        self.close();
    }

    async fn read_loop(self, mut stream: FramedRead<ReadHalf<RpcStream>, MessageCodec>) {
        loop {
            let next = tokio::select! {
                _ = self.inner.shutdown.cancelled() => break,
                next = stream.next() => next,
            };
            match next {
                Some(Ok(message)) => self.route_inbound(message),
                Some(Err(err)) => {
                    warn!(session_id = self.inner.id, error = %err, "read failed; closing session");
                    break;
                }
                None => {
                    debug!(session_id = self.inner.id, peer = %self.inner.peer, "peer closed connection");
                    break;
                }
            }
        }
        self.close();
    }

    fn route_inbound(&self, message: Message) {
        trace!(
            session_id = self.inner.id,
            seq = message.seq,
            kind = %message.kind,
            "frame received"
        );
        if message.kind.is_reply() {
            match self.inner.pending.take(message.seq) {
                Some(call) => call.resolve(message, self),
                None => trace!(
                    session_id = self.inner.id,
                    seq = message.seq,
                    "discarding late or unknown reply"
                ),
            }
            return;
        }
        let session = self.clone();
        self.inner.tasks.spawn(session.dispatch(message));
    }

    async fn dispatch(self, message: Message) {
        let is_call = message.kind == MessageKind::Call;
        let seq = message.seq;
        let method = message.method.clone();
        let ctx = Context::new(message, self.clone());
        let responded = ctx.responded_flag();
        let router = self.inner.router.clone();

        let outcome = tokio::select! {
            _ = self.inner.shutdown.cancelled() => return,
            outcome = AssertUnwindSafe(router.dispatch(ctx)).catch_unwind() => outcome,
        };
        let Err(panic) = outcome else {
            return;
        };

        let reason = panic_message(panic.as_ref());
        warn!(session_id = self.inner.id, seq, %method, %reason, "handler panicked");
        if is_call && !responded.swap(true, Ordering::AcqRel) {
            let reply = Message::error(seq, ErrorCode::HandlerPanicked, &reason);
            if let Err(err) = self.send_reply(reply).await {
                debug!(session_id = self.inner.id, seq, error = %err, "failed to report handler panic");
            }
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&'static str>() {
        format!("handler panicked: {s}")
    } else if let Some(s) = panic.downcast_ref::<String>() {
        format!("handler panicked: {s}")
    } else {
        "handler panicked".to_string()
    }
}

impl<C: Codec> std::fmt::Debug for Session<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.inner.id)
            .field("peer", &self.inner.peer)
            .field("transport", &self.inner.transport)
            .field("codec", &self.inner.codec.name())
            .field("pending", &self.pending_len())
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use rpcprims_frame::FrameConfig;
    use tokio::io::AsyncWriteExt;

    use super::*;

    fn pair(server: Router) -> (Session, Session) {
        pair_with(server, SessionConfig::default())
    }

    fn pair_with(server: Router, config: SessionConfig) -> (Session, Session) {
        let (left, right) = tokio::io::duplex(256 * 1024);
        let client = Session::spawn(
            RpcStream::from_memory(left, "client"),
            Router::new(),
            Arc::new(JsonCodec),
            config.clone(),
        );
        let server = Session::spawn(
            RpcStream::from_memory(right, "server"),
            server,
            Arc::new(JsonCodec),
            config,
        );
        (client, server)
    }

    fn echo_router() -> Router {
        let router = Router::new();
        router.handle("/echo", |ctx: Context| async move {
            let body: String = ctx.bind().unwrap();
            ctx.write(&body).await.unwrap();
        });
        router.handle("/slow", |ctx: Context| async move {
            let delay: u64 = ctx.bind().unwrap();
            tokio::time::sleep(Duration::from_millis(delay)).await;
            let _ = ctx.write(&delay).await;
        });
        router
    }

    #[tokio::test]
    async fn call_returns_echoed_string() {
        let (client, _server) = pair(echo_router());
        let reply: String = client
            .call("/echo", &"test", Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(reply, "test");
        assert_eq!(client.pending_len(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_calls_match_out_of_order_replies() {
        let (client, _server) = pair(echo_router());

        let mut calls = Vec::new();
        for delay in [120u64, 10, 60, 0, 90] {
            let client = client.clone();
            calls.push(tokio::spawn(async move {
                let reply: u64 = client
                    .call("/slow", &delay, Duration::from_secs(2))
                    .await
                    .unwrap();
                (delay, reply)
            }));
        }
        for call in calls {
            let (sent, got) = call.await.unwrap();
            assert_eq!(sent, got);
        }
        assert_eq!(client.pending_len(), 0);
    }

    #[tokio::test]
    async fn silent_remote_times_out_after_deadline() {
        let router = Router::new();
        router.handle("/silent", |_ctx: Context| async {});
        let (client, _server) = pair(router);

        for _ in 0..3 {
            let started = Instant::now();
            let err = client
                .call::<_, String>("/silent", &"x", Duration::from_millis(50))
                .await
                .unwrap_err();
            assert!(matches!(err, RpcError::Timeout(_)));
            assert!(started.elapsed() >= Duration::from_millis(50));
        }
        assert_eq!(client.pending_len(), 0);
    }

    #[tokio::test]
    async fn call_with_cancel_removes_pending_entry() {
        let (client, _server) = pair(echo_router());
        let token = CancellationToken::new();

        let canceler = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            canceler.cancel();
        });

        let err = client
            .call_with::<_, u64>(&token, "/slow", &500u64)
            .await
            .unwrap_err();
        assert!(matches!(err, RpcError::Canceled));
        assert_eq!(client.pending_len(), 0);
    }

    #[tokio::test]
    async fn dropped_call_future_removes_pending_entry() {
        let (client, _server) = pair(echo_router());
        let call = client.call::<_, u64>("/slow", &500u64, Duration::from_secs(5));
        let _ = tokio::time::timeout(Duration::from_millis(30), call).await;
        assert_eq!(client.pending_len(), 0);
    }

    #[tokio::test]
    async fn call_async_delivers_reply_context() {
        let (client, _server) = pair(echo_router());
        let (tx, rx) = oneshot::channel();

        client
            .call_async(
                "/echo",
                &"async",
                move |reply: Result<Context>| {
                    let body: String = reply.and_then(|ctx| ctx.bind()).unwrap();
                    let _ = tx.send(body);
                },
                Duration::from_secs(1),
            )
            .await
            .unwrap();

        assert_eq!(rx.await.unwrap(), "async");
    }

    #[tokio::test]
    async fn call_async_timeout_wins_over_late_reply() {
        let (client, _server) = pair(echo_router());
        let fired = Arc::new(AtomicUsize::new(0));
        let (tx, rx) = oneshot::channel();

        let counter = Arc::clone(&fired);
        client
            .call_async(
                "/slow",
                &200u64,
                move |reply: Result<Context>| {
                    counter.fetch_add(1, Ordering::SeqCst);
                    let _ = tx.send(reply.map(|ctx| ctx.seq()));
                },
                Duration::from_millis(50),
            )
            .await
            .unwrap();

        let outcome = rx.await.unwrap();
        assert!(matches!(outcome, Err(RpcError::Timeout(_))));

        // Let the late reply arrive; it must be discarded.
        tokio::time::sleep(Duration::from_millis(250)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert_eq!(client.pending_len(), 0);
    }

    #[tokio::test]
    async fn call_async_with_canceled_token_never_invokes_callback() {
        let (client, _server) = pair(echo_router());
        let token = CancellationToken::new();
        token.cancel();
        let fired = Arc::new(AtomicBool::new(false));

        let flag = Arc::clone(&fired);
        let err = client
            .call_async_with(&token, "/echo", &"x", move |_reply: Result<Context>| {
                flag.store(true, Ordering::SeqCst);
            })
            .await
            .unwrap_err();

        assert!(matches!(err, RpcError::Canceled));
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!fired.load(Ordering::SeqCst));
        assert_eq!(client.pending_len(), 0);
    }

    #[tokio::test]
    async fn notify_reaches_handler_without_reply_channel() {
        let router = Router::new();
        let (tx, mut rx) = mpsc::channel(1);
        router.handle("/log", move |ctx: Context| {
            let tx = tx.clone();
            async move {
                let line: String = ctx.bind().unwrap();
                let write = ctx.write(&"ignored").await;
                let _ = tx.send((line, write)).await;
            }
        });
        let (client, _server) = pair(router);

        client
            .notify("/log", &"hello", Duration::from_secs(1))
            .await
            .unwrap();

        let (line, write) = rx.recv().await.unwrap();
        assert_eq!(line, "hello");
        assert!(matches!(write, Err(RpcError::NoReplyChannel)));
        assert_eq!(client.pending_len(), 0);
    }

    #[tokio::test]
    async fn unknown_method_reports_route_not_found() {
        let (client, _server) = pair(Router::new());
        let err = client
            .call::<_, String>("/missing", &"x", Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, RpcError::RouteNotFound(ref m) if m == "/missing"));
    }

    #[tokio::test]
    async fn handler_panic_is_reported_to_caller() {
        let router = Router::new();
        router.handle("/boom", |_ctx: Context| async {
            panic!("kaboom");
        });
        let (client, server) = pair(router);

        let err = client
            .call::<_, String>("/boom", &"x", Duration::from_secs(1))
            .await
            .unwrap_err();
        match err {
            RpcError::Remote { code, message } => {
                assert_eq!(code, ErrorCode::HandlerPanicked.as_u8());
                assert!(message.contains("kaboom"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert!(!server.is_closed());
    }

    #[tokio::test]
    async fn second_write_is_rejected() {
        let router = Router::new();
        let (tx, mut rx) = mpsc::channel(1);
        router.handle("/twice", move |ctx: Context| {
            let tx = tx.clone();
            async move {
                ctx.write(&"first").await.unwrap();
                let again = ctx.write(&"second").await;
                let error = ctx.write_error("late").await;
                let _ = tx.send((again, error)).await;
            }
        });
        let (client, _server) = pair(router);

        let reply: String = client
            .call("/twice", &"x", Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(reply, "first");

        let (again, error) = rx.recv().await.unwrap();
        assert!(matches!(again, Err(RpcError::AlreadyResponded)));
        assert!(matches!(error, Err(RpcError::AlreadyResponded)));
    }

    #[tokio::test]
    async fn application_error_reply() {
        let router = Router::new();
        router.handle("/fail", |ctx: Context| async move {
            ctx.write_error("nope").await.unwrap();
        });
        let (client, _server) = pair(router);

        let err = client
            .call::<_, String>("/fail", &"x", Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            RpcError::Remote { code: 4, ref message } if message == "nope"
        ));
    }

    #[tokio::test]
    async fn handlers_can_call_back_into_the_caller() {
        let server_router = Router::new();
        server_router.handle("/ask-back", |ctx: Context| async move {
            let answer: String = ctx
                .session()
                .call("/whoami", &"?", Duration::from_secs(1))
                .await
                .unwrap();
            ctx.write(&format!("client says {answer}")).await.unwrap();
        });

        let (left, right) = tokio::io::duplex(64 * 1024);
        let client_router = Router::new();
        client_router.handle("/whoami", |ctx: Context| async move {
            ctx.write(&"client").await.unwrap();
        });
        let client = Session::spawn(
            RpcStream::from_memory(left, "client"),
            client_router,
            Arc::new(JsonCodec),
            SessionConfig::default(),
        );
        let _server = Session::spawn(
            RpcStream::from_memory(right, "server"),
            server_router,
            Arc::new(JsonCodec),
            SessionConfig::default(),
        );

        let reply: String = client
            .call("/ask-back", &"", Duration::from_secs(2))
            .await
            .unwrap();
        assert_eq!(reply, "client says client");
    }

    #[tokio::test]
    async fn close_fails_outstanding_calls() {
        let (client, _server) = pair(echo_router());
        let disconnects = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&disconnects);
        client.router().on_disconnected(move |_session| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        let waiting = {
            let client = client.clone();
            tokio::spawn(async move {
                client
                    .call::<_, u64>("/slow", &5_000u64, Duration::from_secs(10))
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(client.pending_len(), 1);

        client.close();
        client.close();
        let outcome = tokio::time::timeout(Duration::from_secs(1), waiting)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(outcome, Err(RpcError::ConnectionClosed)));

        tokio::time::timeout(Duration::from_secs(1), client.closed())
            .await
            .unwrap();
        assert_eq!(disconnects.load(Ordering::SeqCst), 1);

        let err = client
            .call::<_, String>("/echo", &"late", Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, RpcError::ConnectionClosed));
    }

    #[tokio::test]
    async fn close_fails_pending_async_callback_once() {
        let (client, _server) = pair(echo_router());
        let fired = Arc::new(AtomicUsize::new(0));
        let (tx, rx) = oneshot::channel();

        let counter = Arc::clone(&fired);
        client
            .call_async(
                "/slow",
                &5_000u64,
                move |reply: Result<Context>| {
                    counter.fetch_add(1, Ordering::SeqCst);
                    let _ = tx.send(reply.map(|ctx| ctx.seq()));
                },
                Duration::from_secs(10),
            )
            .await
            .unwrap();
        assert_eq!(client.pending_len(), 1);

        client.close();
        let outcome = tokio::time::timeout(Duration::from_secs(1), rx)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(outcome, Err(RpcError::ConnectionClosed)));

        tokio::time::timeout(Duration::from_secs(1), client.closed())
            .await
            .unwrap();
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert_eq!(client.pending_len(), 0);
    }

    #[tokio::test]
    async fn unbounded_timeout_still_completes() {
        let (client, _server) = pair(echo_router());
        let reply: String = client.call("/echo", &"x", Duration::MAX).await.unwrap();
        assert_eq!(reply, "x");

        let (tx, rx) = oneshot::channel();
        client
            .call_async(
                "/echo",
                &"y",
                move |reply: Result<Context>| {
                    let _ = tx.send(reply.and_then(|ctx| ctx.bind::<String>()));
                },
                Duration::MAX,
            )
            .await
            .unwrap();
        assert_eq!(rx.await.unwrap().unwrap(), "y");

        client.notify("/unrouted", &"z", Duration::MAX).await.unwrap();
        assert_eq!(client.pending_len(), 0);
    }

    #[tokio::test]
    async fn stalled_peer_hits_call_deadline() {
        // The far end is held open but never read.
        let (left, _right) = tokio::io::duplex(64);
        let client = Session::spawn(
            RpcStream::from_memory(left, "client"),
            Router::<JsonCodec>::new(),
            Arc::new(JsonCodec),
            SessionConfig::default(),
        );

        let err = client
            .call::<_, String>("/echo", &"x".repeat(4096), Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            RpcError::Send(SendError::DeadlineExceeded(limit)) if limit == Duration::from_millis(50)
        ));
        assert_eq!(client.pending_len(), 0);
    }

    #[tokio::test]
    async fn stalled_peer_hits_write_timeout_and_closes() {
        let (left, _right) = tokio::io::duplex(64);
        let config = SessionConfig {
            write_timeout: Some(Duration::from_millis(20)),
            ..SessionConfig::default()
        };
        let client = Session::spawn(
            RpcStream::from_memory(left, "client"),
            Router::<JsonCodec>::new(),
            Arc::new(JsonCodec),
            config,
        );

        let err = client
            .call::<_, String>("/echo", &"x".repeat(4096), Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            RpcError::Send(SendError::DeadlineExceeded(limit)) if limit == Duration::from_millis(20)
        ));
        assert_eq!(client.pending_len(), 0);

        tokio::time::timeout(Duration::from_secs(1), client.closed())
            .await
            .unwrap();
        assert!(client.is_closed());
    }

    #[tokio::test]
    async fn non_utf8_method_is_answered_without_closing() {
        let (left, mut right) = tokio::io::duplex(1024);
        let session = Session::spawn(
            RpcStream::from_memory(left, "victim"),
            Router::<JsonCodec>::new(),
            Arc::new(JsonCodec),
            SessionConfig::default(),
        );

        let mut frame = Vec::new();
        frame.extend_from_slice(b"RP");
        frame.push(MessageKind::Call as u8);
        frame.push(0);
        frame.extend_from_slice(&2u16.to_le_bytes());
        frame.extend_from_slice(&1u32.to_le_bytes());
        frame.extend_from_slice(&7u64.to_le_bytes());
        frame.extend_from_slice(&[0xFF, 0xFE]);
        frame.push(b'x');
        right.write_all(&frame).await.unwrap();

        let mut replies = FramedRead::new(right, MessageCodec::default());
        let reply = tokio::time::timeout(Duration::from_secs(1), replies.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(reply.seq, 7);
        let (code, _message) = reply.error_parts().unwrap();
        assert_eq!(code, ErrorCode::RouteNotFound.as_u8());
        assert!(!session.is_closed());
    }

    #[tokio::test]
    async fn peer_close_fails_pending_calls() {
        let (client, server) = pair(echo_router());
        let waiting = {
            let client = client.clone();
            tokio::spawn(async move {
                client
                    .call::<_, u64>("/slow", &5_000u64, Duration::from_secs(10))
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(30)).await;

        server.close();
        let outcome = tokio::time::timeout(Duration::from_secs(1), waiting)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(outcome, Err(RpcError::ConnectionClosed)));
        tokio::time::timeout(Duration::from_secs(1), client.closed())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn garbage_on_the_wire_closes_the_session() {
        let (left, mut right) = tokio::io::duplex(1024);
        let session = Session::spawn(
            RpcStream::from_memory(left, "victim"),
            Router::<JsonCodec>::new(),
            Arc::new(JsonCodec),
            SessionConfig::default(),
        );

        right
            .write_all(b"XXXXXXXXXXXXXXXXXXXXXXXX")
            .await
            .unwrap();
        tokio::time::timeout(Duration::from_secs(1), session.closed())
            .await
            .unwrap();
        assert!(session.is_closed());
    }

    #[tokio::test]
    async fn oversized_request_fails_without_closing() {
        let config = SessionConfig {
            frame: FrameConfig {
                max_payload_size: 16,
                ..FrameConfig::default()
            },
            ..SessionConfig::default()
        };
        let (client, _server) = pair_with(echo_router(), config);

        let err = client
            .call::<_, String>("/echo", &"x".repeat(64), Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, RpcError::Send(SendError::Frame(_))));
        assert_eq!(client.pending_len(), 0);

        let reply: String = client
            .call("/echo", &"ok", Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(reply, "ok");
    }

    #[tokio::test]
    async fn decode_failure_is_per_call() {
        let (client, _server) = pair(echo_router());
        let err = client
            .call::<_, u64>("/echo", &"not-a-number", Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, RpcError::Decode(_)));
        assert!(!client.is_closed());
    }

    #[test]
    fn panic_messages_are_extracted() {
        let boxed: Box<dyn Any + Send> = Box::new("static");
        assert_eq!(panic_message(boxed.as_ref()), "handler panicked: static");
        let boxed: Box<dyn Any + Send> = Box::new(String::from("owned"));
        assert_eq!(panic_message(boxed.as_ref()), "handler panicked: owned");
        let boxed: Box<dyn Any + Send> = Box::new(7u8);
        assert_eq!(panic_message(boxed.as_ref()), "handler panicked");
    }
}
