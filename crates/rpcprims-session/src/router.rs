use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use futures_core::future::BoxFuture;
use rpcprims_frame::{ErrorCode, MessageKind};
use tracing::debug;

use crate::codec::{Codec, JsonCodec};
use crate::context::Context;
use crate::session::Session;

/// Something that can serve an inbound Call or Notify.
///
/// Implemented for every `Fn(Context<C>) -> impl Future<Output = ()>`, so
/// plain async closures register directly.
pub trait Handler<C: Codec>: Send + Sync + 'static {
    fn call(&self, ctx: Context<C>) -> BoxFuture<'static, ()>;
}

impl<C, F, Fut> Handler<C> for F
where
    C: Codec,
    F: Fn(Context<C>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    fn call(&self, ctx: Context<C>) -> BoxFuture<'static, ()> {
        Box::pin(self(ctx))
    }
}

type SessionHook<C> = Arc<dyn Fn(&Session<C>) + Send + Sync>;

struct RouterTable<C: Codec> {
    routes: HashMap<String, Arc<dyn Handler<C>>>,
    not_found: Option<Arc<dyn Handler<C>>>,
    on_connected: Option<SessionHook<C>>,
    on_disconnected: Option<SessionHook<C>>,
}

/// Method name to handler table, shared by every session bound to it.
///
/// Cloning a `Router` shares the table. Registration is safe while traffic
/// is flowing; a dispatch in progress keeps the handler it already resolved.
pub struct Router<C: Codec = JsonCodec> {
    table: Arc<RwLock<RouterTable<C>>>,
}

impl<C: Codec> Clone for Router<C> {
    fn clone(&self) -> Self {
        Self {
            table: Arc::clone(&self.table),
        }
    }
}

impl<C: Codec> Default for Router<C> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C: Codec> Router<C> {
    pub fn new() -> Self {
        Self {
            table: Arc::new(RwLock::new(RouterTable {
                routes: HashMap::new(),
                not_found: None,
                on_connected: None,
                on_disconnected: None,
            })),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, RouterTable<C>> {
        self.table.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, RouterTable<C>> {
        self.table.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register an async closure for `method`, replacing any previous one.
    pub fn handle<F, Fut>(&self, method: impl Into<String>, handler: F) -> &Self
    where
        F: Fn(Context<C>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.register(method, handler)
    }

    /// Register any [`Handler`] implementation for `method`.
    pub fn register(&self, method: impl Into<String>, handler: impl Handler<C>) -> &Self {
        let method = method.into();
        debug!(%method, "registered handler");
        self.write().routes.insert(method, Arc::new(handler));
        self
    }

    /// Serve messages for methods with no registered handler.
    ///
    /// Without one, unknown Calls get a `RouteNotFound` error reply and
    /// unknown Notifies are dropped.
    pub fn handle_not_found<F, Fut>(&self, handler: F) -> &Self
    where
        F: Fn(Context<C>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.write().not_found = Some(Arc::new(handler));
        self
    }

    /// Run `hook` once for every session that starts on this router.
    pub fn on_connected(&self, hook: impl Fn(&Session<C>) + Send + Sync + 'static) -> &Self {
        self.write().on_connected = Some(Arc::new(hook));
        self
    }

    /// Run `hook` once for every session that closes on this router.
    pub fn on_disconnected(&self, hook: impl Fn(&Session<C>) + Send + Sync + 'static) -> &Self {
        self.write().on_disconnected = Some(Arc::new(hook));
        self
    }

    /// Whether `method` has a registered handler.
    pub fn has_route(&self, method: &str) -> bool {
        self.read().routes.contains_key(method)
    }

    /// Registered method names, sorted.
    pub fn routes(&self) -> Vec<String> {
        let mut routes: Vec<String> = self.read().routes.keys().cloned().collect();
        routes.sort();
        routes
    }

    /// Run the handler for `ctx`'s method.
    pub async fn dispatch(&self, ctx: Context<C>) {
        let handler = {
            let table = self.read();
            table
                .routes
                .get(ctx.method())
                .or(table.not_found.as_ref())
                .cloned()
        };
        match handler {
            Some(handler) => handler.call(ctx).await,
            None => reply_not_found(ctx).await,
        }
    }

    pub(crate) fn fire_connected(&self, session: &Session<C>) {
        let hook = self.read().on_connected.clone();
        if let Some(hook) = hook {
            hook(session);
        }
    }

    pub(crate) fn fire_disconnected(&self, session: &Session<C>) {
        let hook = self.read().on_disconnected.clone();
        if let Some(hook) = hook {
            hook(session);
        }
    }
}

/// Default miss behavior, also usable from a custom not-found handler.
pub async fn reply_not_found<C: Codec>(ctx: Context<C>) {
    match ctx.kind() {
        MessageKind::Call => {
            let text = format!("no handler for {}", ctx.method());
            if let Err(err) = ctx.write_error_code(ErrorCode::RouteNotFound, &text).await {
                debug!(
                    session_id = ctx.session().id(),
                    seq = ctx.seq(),
                    error = %err,
                    "failed to send route-not-found reply"
                );
            }
        }
        _ => debug!(
            session_id = ctx.session().id(),
            method = %ctx.method(),
            "dropping notify for unknown method"
        ),
    }
}

impl<C: Codec> std::fmt::Debug for Router<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Router")
            .field("routes", &self.routes())
            .finish()
    }
}
