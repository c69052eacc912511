//! Self-delimiting message framing for the rpcprims engine.
//!
//! Every message is framed with:
//! - A 2-byte magic number ("RP") for stream synchronization
//! - A kind byte (Call, Notify, Response, Error) and a flags byte
//! - Little-endian method and payload lengths
//! - A 64-bit little-endian sequence id used to correlate replies
//!
//! No partial reads, no buffer management in user code.

pub mod codec;
pub mod error;
pub mod message;

pub use codec::{
    decode_message, encode_message, validate_message, FrameConfig, MessageCodec,
    DEFAULT_MAX_METHOD_LEN, DEFAULT_MAX_PAYLOAD, HEADER_SIZE, MAGIC,
};
pub use error::{FrameError, Result};
pub use message::{ErrorCode, Flags, Message, MessageKind};
