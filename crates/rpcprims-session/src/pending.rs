//! In-flight call bookkeeping.
//!
//! Whoever removes an entry from the table owns its completion. Responses,
//! deadlines, cancellations and session close all race through
//! [`PendingTable::take`], so each call completes exactly once.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::{Mutex, MutexGuard, PoisonError};

use rpcprims_frame::Message;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::codec::Codec;
use crate::context::Context;
use crate::error::{Result, RpcError};
use crate::session::Session;

/// Completion callback for `call_async`.
pub type Callback<C> = Box<dyn FnOnce(Result<Context<C>>) + Send + 'static>;

pub(crate) enum Completion<C: Codec> {
    /// A blocked `call` waiting on the other end.
    Waiter(oneshot::Sender<Result<Message>>),
    /// A `call_async` callback plus the token that stops its timer.
    Callback {
        callback: Callback<C>,
        settled: CancellationToken,
    },
}

pub(crate) struct PendingCall<C: Codec> {
    method: String,
    completion: Completion<C>,
}

impl<C: Codec> PendingCall<C> {
    pub(crate) fn waiter(method: &str, tx: oneshot::Sender<Result<Message>>) -> Self {
        Self {
            method: method.to_string(),
            completion: Completion::Waiter(tx),
        }
    }

    pub(crate) fn callback(method: &str, callback: Callback<C>, settled: CancellationToken) -> Self {
        Self {
            method: method.to_string(),
            completion: Completion::Callback { callback, settled },
        }
    }

    pub(crate) fn method(&self) -> &str {
        &self.method
    }

    /// Complete with a reply message. Error replies are mapped to errors.
    pub(crate) fn resolve(self, reply: Message, session: &Session<C>) {
        let outcome = match reply.error_parts() {
            Some((code, message)) => Err(RpcError::from_reply(code, message, &self.method)),
            None => Ok(reply),
        };
        self.complete(outcome, session);
    }

    /// Complete with a final outcome.
    pub(crate) fn complete(self, outcome: Result<Message>, session: &Session<C>) {
        match self.completion {
            Completion::Waiter(tx) => {
                // The caller may have been dropped; its guard already gave up.
                let _ = tx.send(outcome);
            }
            Completion::Callback { callback, settled } => {
                settled.cancel();
                let outcome = outcome.map(|reply| Context::new(reply, session.clone()));
                if std::panic::catch_unwind(AssertUnwindSafe(|| callback(outcome))).is_err() {
                    warn!(
                        session_id = session.id(),
                        method = %self.method,
                        "call_async callback panicked"
                    );
                }
            }
        }
    }
}

struct PendingState<C: Codec> {
    calls: HashMap<u64, PendingCall<C>>,
    closed: bool,
}

pub(crate) struct PendingTable<C: Codec> {
    state: Mutex<PendingState<C>>,
}

impl<C: Codec> PendingTable<C> {
    pub(crate) fn new() -> Self {
        Self {
            state: Mutex::new(PendingState {
                calls: HashMap::new(),
                closed: false,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, PendingState<C>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Store `call` under a fresh sequence id drawn from `next_seq`.
    ///
    /// Ids still in the table are skipped. Fails once the table is drained.
    pub(crate) fn register(
        &self,
        mut next_seq: impl FnMut() -> u64,
        call: PendingCall<C>,
    ) -> Result<u64> {
        let mut state = self.lock();
        if state.closed {
            return Err(RpcError::ConnectionClosed);
        }
        let mut seq = next_seq();
        while state.calls.contains_key(&seq) {
            seq = next_seq();
        }
        state.calls.insert(seq, call);
        Ok(seq)
    }

    /// Remove an entry. `Some` means the caller now owns its completion.
    pub(crate) fn take(&self, seq: u64) -> Option<PendingCall<C>> {
        self.lock().calls.remove(&seq)
    }

    /// Close the table and hand back every outstanding entry.
    pub(crate) fn drain(&self) -> Vec<PendingCall<C>> {
        let mut state = self.lock();
        state.closed = true;
        state.calls.drain().map(|(_, call)| call).collect()
    }

    pub(crate) fn len(&self) -> usize {
        self.lock().calls.len()
    }
}

/// Removes a pending entry when the owning call future goes away early.
pub(crate) struct PendingGuard<'a, C: Codec> {
    table: &'a PendingTable<C>,
    seq: u64,
    active: bool,
}

impl<'a, C: Codec> PendingGuard<'a, C> {
    pub(crate) fn new(table: &'a PendingTable<C>, seq: u64) -> Self {
        Self {
            table,
            seq,
            active: true,
        }
    }

    pub(crate) fn disarm(&mut self) {
        self.active = false;
    }
}

impl<C: Codec> Drop for PendingGuard<'_, C> {
    fn drop(&mut self) {
        if !self.active {
            return;
        }
        if self.table.take(self.seq).is_some() {
            debug!(seq = self.seq, "call dropped: removed pending entry");
        }
    }
}
