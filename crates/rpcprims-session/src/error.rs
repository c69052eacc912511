use std::time::Duration;

use rpcprims_frame::{ErrorCode, FrameError};
use rpcprims_transport::TransportError;

/// Errors raised by a payload [`Codec`](crate::Codec).
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// JSON serialization/deserialization error.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// A string payload was not valid UTF-8.
    #[error("payload is not valid utf-8: {0}")]
    Utf8(#[from] std::string::FromUtf8Error),

    /// A fast-path value could not be converted to the requested type.
    #[error("payload type mismatch (expected {expected})")]
    TypeMismatch { expected: &'static str },
}

/// Why an outbound message did not reach the socket.
#[derive(Debug, thiserror::Error)]
pub enum SendError {
    /// The message failed frame validation and was never queued.
    #[error("frame rejected: {0}")]
    Frame(FrameError),

    /// The session's write queue is closed.
    #[error("write queue closed")]
    QueueClosed,

    /// Writing the frame to the stream failed.
    #[error("write failed: {0}")]
    Write(#[source] std::io::Error),

    /// The frame was not written before the deadline.
    #[error("write deadline exceeded after {0:?}")]
    DeadlineExceeded(Duration),
}

impl From<FrameError> for SendError {
    fn from(err: FrameError) -> Self {
        match err {
            FrameError::Io(io) => SendError::Write(io),
            other => SendError::Frame(other),
        }
    }
}

/// Errors that can occur in RPC operations.
#[derive(Debug, thiserror::Error)]
pub enum RpcError {
    /// The request or response value could not be encoded.
    #[error("encode failed: {0}")]
    Encode(#[source] CodecError),

    /// The payload could not be decoded into the requested type.
    #[error("decode failed: {0}")]
    Decode(#[source] CodecError),

    /// The message could not be sent.
    #[error("send failed: {0}")]
    Send(#[from] SendError),

    /// No reply arrived before the deadline.
    #[error("call timed out after {0:?}")]
    Timeout(Duration),

    /// The caller's cancellation token fired.
    #[error("call canceled")]
    Canceled,

    /// The session closed before the call completed.
    #[error("connection closed")]
    ConnectionClosed,

    /// The remote has no handler for the method.
    #[error("no route for method {0:?}")]
    RouteNotFound(String),

    /// The remote replied with an error.
    #[error("remote error (code {code}): {message}")]
    Remote { code: u8, message: String },

    /// `write` was used on a message that has no reply channel.
    #[error("message has no reply channel")]
    NoReplyChannel,

    /// A reply was already sent for this call.
    #[error("call already responded")]
    AlreadyResponded,

    /// The client is not running.
    #[error("client not running")]
    NotRunning,

    /// A client pool needs at least one member.
    #[error("client pool size must be at least 1")]
    InvalidPoolSize,

    /// Transport-level error.
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
}

impl RpcError {
    /// Map an Error reply for `method` to the caller-facing error.
    pub fn from_reply(code: u8, message: String, method: &str) -> Self {
        match ErrorCode::from_u8(code) {
            Some(ErrorCode::RouteNotFound) => RpcError::RouteNotFound(method.to_string()),
            _ => RpcError::Remote { code, message },
        }
    }

    /// The remote error code, if this error came from an Error reply.
    pub fn remote_code(&self) -> Option<u8> {
        match self {
            RpcError::RouteNotFound(_) => Some(ErrorCode::RouteNotFound.as_u8()),
            RpcError::Remote { code, .. } => Some(*code),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, RpcError>;
