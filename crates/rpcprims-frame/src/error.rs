/// Errors that can occur during message encoding/decoding.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    /// The frame header contains an invalid magic number.
    #[error("invalid frame magic (expected 0x5250 \"RP\")")]
    InvalidMagic,

    /// The kind byte does not name a known message kind.
    #[error("unknown message kind {0}")]
    UnknownKind(u8),

    /// The payload exceeds the configured maximum size.
    #[error("payload too large ({size} bytes, max {max})")]
    PayloadTooLarge { size: usize, max: usize },

    /// The method name exceeds the configured maximum length.
    #[error("method name too long ({len} bytes, max {max})")]
    MethodTooLong { len: usize, max: usize },

    /// The method name is missing where required.
    #[error("invalid method name: {0}")]
    InvalidMethod(&'static str),

    /// An I/O error occurred while reading or writing frames.
    #[error("frame I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The connection was closed before a complete frame was received.
    #[error("connection closed (incomplete frame)")]
    ConnectionClosed,
}

impl FrameError {
    /// Whether the stream can no longer be trusted after this error.
    ///
    /// Size and method validation failures on encode only reject the one
    /// message. Decoder errors of any kind still end the inbound stream.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            FrameError::InvalidMagic
                | FrameError::UnknownKind(_)
                | FrameError::Io(_)
                | FrameError::ConnectionClosed
        )
    }
}

pub type Result<T> = std::result::Result<T, FrameError>;
