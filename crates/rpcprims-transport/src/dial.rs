use std::future::Future;

use futures_core::future::BoxFuture;

use crate::error::Result;
use crate::stream::RpcStream;

/// Produces a fresh connection each time it is invoked.
///
/// Clients call `dial` once per `run()` and again on every reconnect, so an
/// implementation must be reusable.
pub trait Dialer: Send + Sync + 'static {
    /// Open a new connection.
    fn dial(&self) -> BoxFuture<'_, Result<RpcStream>>;

    /// Target description for diagnostics.
    fn describe(&self) -> String {
        "custom".to_string()
    }
}

/// Yields accepted connections to a server accept loop.
pub trait Listener: Send + Sync + 'static {
    /// Wait for the next incoming connection.
    fn accept(&self) -> BoxFuture<'_, Result<RpcStream>>;

    /// Local address description for diagnostics.
    fn describe(&self) -> String {
        "custom".to_string()
    }
}

/// A [`Dialer`] backed by a closure.
#[derive(Clone)]
pub struct DialFn<F> {
    f: F,
}

/// Build a [`Dialer`] from a zero-argument async closure.
///
/// ```ignore
/// let dialer = dialer_fn(|| async { TcpDialer::new("127.0.0.1:9000").dial().await });
/// ```
pub fn dialer_fn<F, Fut>(f: F) -> DialFn<F>
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<RpcStream>> + Send + 'static,
{
    DialFn { f }
}

impl<F, Fut> Dialer for DialFn<F>
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<RpcStream>> + Send + 'static,
{
    fn dial(&self) -> BoxFuture<'_, Result<RpcStream>> {
        Box::pin((self.f)())
    }

    fn describe(&self) -> String {
        "dialer-fn".to_string()
    }
}
