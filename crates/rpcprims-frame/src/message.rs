use bytes::{BufMut, Bytes, BytesMut};

/// The four message kinds carried on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageKind {
    /// A request expecting exactly one Response or Error.
    Call = 1,
    /// A request with no reply.
    Notify = 2,
    /// A successful reply to a Call.
    Response = 3,
    /// A failed reply to a Call.
    Error = 4,
}

impl MessageKind {
    /// Parse the wire byte.
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(Self::Call),
            2 => Some(Self::Notify),
            3 => Some(Self::Response),
            4 => Some(Self::Error),
            _ => None,
        }
    }

    /// Whether this kind is routed to a handler.
    pub fn is_request(self) -> bool {
        matches!(self, Self::Call | Self::Notify)
    }

    /// Whether this kind completes a pending call.
    pub fn is_reply(self) -> bool {
        matches!(self, Self::Response | Self::Error)
    }

    /// Short lowercase name for diagnostics.
    pub fn name(self) -> &'static str {
        match self {
            Self::Call => "call",
            Self::Notify => "notify",
            Self::Response => "response",
            Self::Error => "error",
        }
    }
}

impl std::fmt::Display for MessageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Header flag bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Flags(u8);

impl Flags {
    /// No flags set.
    pub const NONE: Flags = Flags(0);
    /// The sender does not expect a reply. Set on every Notify.
    pub const NO_RESPONSE: Flags = Flags(0x01);

    pub const fn from_bits(bits: u8) -> Self {
        Self(bits)
    }

    pub const fn bits(self) -> u8 {
        self.0
    }

    pub const fn contains(self, other: Flags) -> bool {
        self.0 & other.0 == other.0
    }
}

impl std::ops::BitOr for Flags {
    type Output = Flags;

    fn bitor(self, rhs: Self) -> Self::Output {
        Flags(self.0 | rhs.0)
    }
}

/// Error codes carried in the first byte of an Error payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ErrorCode {
    /// No handler is registered for the method.
    RouteNotFound = 1,
    /// The handler could not decode the request payload.
    BadRequest = 2,
    /// The handler panicked before replying.
    HandlerPanicked = 3,
    /// The handler replied with an application error.
    Application = 4,
}

impl ErrorCode {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(Self::RouteNotFound),
            2 => Some(Self::BadRequest),
            3 => Some(Self::HandlerPanicked),
            4 => Some(Self::Application),
            _ => None,
        }
    }

    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

/// One RPC message: the unit of framing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// What this message is.
    pub kind: MessageKind,
    /// Header flag bits.
    pub flags: Flags,
    /// Correlation id. Replies echo the id of the Call they answer.
    pub seq: u64,
    /// Method name. Empty for Response and Error.
    pub method: String,
    /// Opaque payload bytes.
    pub payload: Bytes,
}

impl Message {
    /// A Call for `method` with sequence id `seq`.
    pub fn call(seq: u64, method: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            kind: MessageKind::Call,
            flags: Flags::NONE,
            seq,
            method: method.into(),
            payload: payload.into(),
        }
    }

    /// A Notify for `method`. Notifies carry [`Flags::NO_RESPONSE`].
    pub fn notify(seq: u64, method: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            kind: MessageKind::Notify,
            flags: Flags::NO_RESPONSE,
            seq,
            method: method.into(),
            payload: payload.into(),
        }
    }

    /// A successful reply to the Call with id `seq`.
    pub fn response(seq: u64, payload: impl Into<Bytes>) -> Self {
        Self {
            kind: MessageKind::Response,
            flags: Flags::NONE,
            seq,
            method: String::new(),
            payload: payload.into(),
        }
    }

    /// A failed reply to the Call with id `seq`.
    ///
    /// The payload is `[code: u8][utf-8 message]`.
    pub fn error(seq: u64, code: ErrorCode, message: &str) -> Self {
        let mut payload = BytesMut::with_capacity(1 + message.len());
        payload.put_u8(code.as_u8());
        payload.put_slice(message.as_bytes());
        Self {
            kind: MessageKind::Error,
            flags: Flags::NONE,
            seq,
            method: String::new(),
            payload: payload.freeze(),
        }
    }

    /// Split an Error payload into its raw code byte and message.
    ///
    /// Returns `None` for other kinds. An empty payload reads as an
    /// application error with no message; invalid UTF-8 is replaced lossily.
    pub fn error_parts(&self) -> Option<(u8, String)> {
        if self.kind != MessageKind::Error {
            return None;
        }
        match self.payload.split_first() {
            Some((code, rest)) => Some((*code, String::from_utf8_lossy(rest).into_owned())),
            None => Some((ErrorCode::Application.as_u8(), String::new())),
        }
    }

    /// The total wire size of this message (header + method + payload).
    pub fn wire_size(&self) -> usize {
        crate::codec::HEADER_SIZE + self.method.len() + self.payload.len()
    }
}
