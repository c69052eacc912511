use std::any::Any;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use rpcprims_frame::{ErrorCode, Message, MessageKind};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::codec::{decode_payload, encode_payload, Codec, JsonCodec};
use crate::error::{Result, RpcError};
use crate::session::Session;

/// One inbound message plus the session it arrived on.
///
/// Handlers get a `Context` for every Call and Notify; `call_async`
/// callbacks get one for the reply. At most one reply is ever sent per Call,
/// no matter how many clones of the context exist.
pub struct Context<C: Codec = JsonCodec> {
    message: Message,
    session: Session<C>,
    responded: Arc<AtomicBool>,
}

impl<C: Codec> Clone for Context<C> {
    fn clone(&self) -> Self {
        Self {
            message: self.message.clone(),
            session: self.session.clone(),
            responded: Arc::clone(&self.responded),
        }
    }
}

impl<C: Codec> Context<C> {
    pub(crate) fn new(message: Message, session: Session<C>) -> Self {
        Self {
            message,
            session,
            responded: Arc::new(AtomicBool::new(false)),
        }
    }

    pub(crate) fn responded_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.responded)
    }

    pub fn method(&self) -> &str {
        &self.message.method
    }

    pub fn seq(&self) -> u64 {
        self.message.seq
    }

    pub fn kind(&self) -> MessageKind {
        self.message.kind
    }

    pub fn payload(&self) -> &Bytes {
        &self.message.payload
    }

    pub fn message(&self) -> &Message {
        &self.message
    }

    /// The session this message arrived on. Handlers may issue calls back
    /// to the peer through it.
    pub fn session(&self) -> &Session<C> {
        &self.session
    }

    /// Whether a reply has already been sent.
    pub fn responded(&self) -> bool {
        self.responded.load(Ordering::Acquire)
    }

    /// Decode the payload. Each call decodes again.
    pub fn bind<T: DeserializeOwned + Any>(&self) -> Result<T> {
        decode_payload(self.session.codec(), &self.message.payload).map_err(RpcError::Decode)
    }

    /// Reply to an inbound Call.
    ///
    /// Returns [`RpcError::NoReplyChannel`] for any other kind and
    /// [`RpcError::AlreadyResponded`] after the first reply. An encode
    /// failure does not consume the reply, so the handler can still send an
    /// error.
    pub async fn write<T: Serialize + Any + Sync>(&self, value: &T) -> Result<()> {
        self.ensure_call()?;
        let payload = encode_payload(self.session.codec(), value).map_err(RpcError::Encode)?;
        self.claim()?;
        self.session
            .send_reply(Message::response(self.message.seq, payload))
            .await
    }

    /// Reply with an application error.
    pub async fn write_error(&self, message: impl AsRef<str>) -> Result<()> {
        self.write_error_code(ErrorCode::Application, message).await
    }

    /// Reply with an error carrying an explicit code.
    pub async fn write_error_code(&self, code: ErrorCode, message: impl AsRef<str>) -> Result<()> {
        self.ensure_call()?;
        self.claim()?;
        self.session
            .send_reply(Message::error(self.message.seq, code, message.as_ref()))
            .await
    }

    fn ensure_call(&self) -> Result<()> {
        if self.message.kind == MessageKind::Call {
            Ok(())
        } else {
            Err(RpcError::NoReplyChannel)
        }
    }

    fn claim(&self) -> Result<()> {
        if self.responded.swap(true, Ordering::AcqRel) {
            Err(RpcError::AlreadyResponded)
        } else {
            Ok(())
        }
    }
}

impl<C: Codec> std::fmt::Debug for Context<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("session_id", &self.session.id())
            .field("kind", &self.message.kind)
            .field("seq", &self.message.seq)
            .field("method", &self.message.method)
            .field("payload_len", &self.message.payload.len())
            .finish()
    }
}
