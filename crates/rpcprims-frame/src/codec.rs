use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::error::{FrameError, Result};
use crate::message::{Flags, Message, MessageKind};

/// Frame header: magic (2) + kind (1) + flags (1) + method len (2)
/// + payload len (4) + seq (8) = 18 bytes.
pub const HEADER_SIZE: usize = 18;

/// Magic bytes: "RP" (0x52 0x50).
pub const MAGIC: [u8; 2] = [0x52, 0x50];

/// Default maximum payload size: 16 MiB.
pub const DEFAULT_MAX_PAYLOAD: usize = 16 * 1024 * 1024;

/// Default maximum method name length in bytes.
pub const DEFAULT_MAX_METHOD_LEN: usize = 1024;

/// Configuration for the message codec.
#[derive(Debug, Clone)]
pub struct FrameConfig {
    /// Maximum payload size in bytes. Default: 16 MiB.
    pub max_payload_size: usize,
    /// Maximum method name length in bytes. Default: 1024. Capped at `u16::MAX`.
    pub max_method_len: usize,
}

impl Default for FrameConfig {
    fn default() -> Self {
        Self {
            max_payload_size: DEFAULT_MAX_PAYLOAD,
            max_method_len: DEFAULT_MAX_METHOD_LEN,
        }
    }
}

impl FrameConfig {
    fn method_limit(&self) -> usize {
        self.max_method_len.min(u16::MAX as usize)
    }

    fn payload_limit(&self) -> usize {
        self.max_payload_size.min(u32::MAX as usize)
    }
}

/// Check a message against the configured limits without encoding it.
pub fn validate_message(msg: &Message, config: &FrameConfig) -> Result<()> {
    if msg.kind.is_request() && msg.method.is_empty() {
        return Err(FrameError::InvalidMethod("empty method on a request"));
    }
    let max = config.method_limit();
    if msg.method.len() > max {
        return Err(FrameError::MethodTooLong {
            len: msg.method.len(),
            max,
        });
    }
    let max = config.payload_limit();
    if msg.payload.len() > max {
        return Err(FrameError::PayloadTooLarge {
            size: msg.payload.len(),
            max,
        });
    }
    Ok(())
}

/// Encode a message into the wire format.
///
/// Wire format:
/// ```text
/// ┌────────────┬──────┬───────┬────────────┬─────────────┬─────────┬────────┬─────────┐
/// │ Magic (2B) │ Kind │ Flags │ Method len │ Payload len │ Seq     │ Method │ Payload │
/// │ 0x52 0x50  │ (1B) │ (1B)  │ (2B LE)    │ (4B LE)     │ (8B LE) │ bytes  │ bytes   │
/// │ "RP"       │      │       │            │             │         │        │         │
/// └────────────┴──────┴───────┴────────────┴─────────────┴─────────┴────────┴─────────┘
/// ```
///
/// Limits are checked before anything is written, so a rejected message
/// leaves `dst` untouched.
pub fn encode_message(msg: &Message, dst: &mut BytesMut, config: &FrameConfig) -> Result<()> {
    validate_message(msg, config)?;

    dst.reserve(msg.wire_size());
    dst.put_slice(&MAGIC);
    dst.put_u8(msg.kind as u8);
    dst.put_u8(msg.flags.bits());
    dst.put_u16_le(msg.method.len() as u16);
    dst.put_u32_le(msg.payload.len() as u32);
    dst.put_u64_le(msg.seq);
    dst.put_slice(msg.method.as_bytes());
    dst.put_slice(&msg.payload);
    Ok(())
}

/// Decode a message from a buffer.
///
/// Returns `Ok(None)` if the buffer doesn't contain a complete message yet.
/// On success, consumes the message bytes from the buffer.
pub fn decode_message(src: &mut BytesMut, config: &FrameConfig) -> Result<Option<Message>> {
    if src.len() < HEADER_SIZE {
        return Ok(None); // Need more data
    }

    if src[0..2] != MAGIC {
        return Err(FrameError::InvalidMagic);
    }

    let kind = MessageKind::from_u8(src[2]).ok_or(FrameError::UnknownKind(src[2]))?;
    let flags = Flags::from_bits(src[3]);
    let method_len = u16::from_le_bytes([src[4], src[5]]) as usize;
    let payload_len = u32::from_le_bytes([src[6], src[7], src[8], src[9]]) as usize;

    let max = config.method_limit();
    if method_len > max {
        return Err(FrameError::MethodTooLong {
            len: method_len,
            max,
        });
    }
    let max = config.payload_limit();
    if payload_len > max {
        return Err(FrameError::PayloadTooLarge {
            size: payload_len,
            max,
        });
    }

    let total = HEADER_SIZE + method_len + payload_len;
    if src.len() < total {
        src.reserve(total - src.len());
        return Ok(None); // Need more data
    }

    let mut header = src.split_to(HEADER_SIZE);
    header.advance(10);
    let seq = header.get_u64_le();

    // A bad method name leaves the framing intact; the router's miss path
    // answers it.
    let method = String::from_utf8_lossy(&src.split_to(method_len)).into_owned();
    let payload: Bytes = src.split_to(payload_len).freeze();

    Ok(Some(Message {
        kind,
        flags,
        seq,
        method,
        payload,
    }))
}

/// `tokio_util` codec adapter over [`encode_message`] / [`decode_message`].
#[derive(Debug, Clone, Default)]
pub struct MessageCodec {
    config: FrameConfig,
}

impl MessageCodec {
    pub fn new(config: FrameConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &FrameConfig {
        &self.config
    }
}

impl Decoder for MessageCodec {
    type Item = Message;
    type Error = FrameError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Message>> {
        decode_message(src, &self.config)
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Message>> {
        match self.decode(src)? {
            Some(msg) => Ok(Some(msg)),
            None if src.is_empty() => Ok(None),
            None => Err(FrameError::ConnectionClosed),
        }
    }
}

impl Encoder<Message> for MessageCodec {
    type Error = FrameError;

    fn encode(&mut self, msg: Message, dst: &mut BytesMut) -> Result<()> {
        encode_message(&msg, dst, &self.config)
    }
}

#[cfg(test)]
mod tests {
    use futures_util::{SinkExt, StreamExt};
    use tokio_util::codec::{FramedRead, FramedWrite};

    use super::*;
    use crate::message::ErrorCode;

    fn encode(msg: &Message) -> BytesMut {
        let mut buf = BytesMut::new();
        encode_message(msg, &mut buf, &FrameConfig::default()).unwrap();
        buf
    }

    #[test]
    fn header_layout_is_little_endian() {
        let buf = encode(&Message::call(0x0102_0304_0506_0708, "/m", "xyz"));

        assert_eq!(&buf[0..2], b"RP");
        assert_eq!(buf[2], 1);
        assert_eq!(buf[3], 0);
        assert_eq!(&buf[4..6], &[2, 0]);
        assert_eq!(&buf[6..10], &[3, 0, 0, 0]);
        assert_eq!(&buf[10..18], &[8, 7, 6, 5, 4, 3, 2, 1]);
        assert_eq!(&buf[18..20], b"/m");
        assert_eq!(&buf[20..], b"xyz");
    }

    #[test]
    fn decode_returns_encoded_message() {
        let msg = Message::notify(42, "/events/tick", Bytes::from_static(b"{\"n\":1}"));
        let mut buf = encode(&msg);

        let decoded = decode_message(&mut buf, &FrameConfig::default())
            .unwrap()
            .unwrap();
        assert_eq!(decoded, msg);
        assert!(buf.is_empty());
    }

    #[test]
    fn decode_waits_for_every_byte() {
        let full = encode(&Message::call(9, "/echo", "hello"));

        for cut in 0..full.len() {
            let mut partial = BytesMut::from(&full[..cut]);
            let result = decode_message(&mut partial, &FrameConfig::default()).unwrap();
            assert!(result.is_none(), "partial frame surfaced at {cut} bytes");
            assert_eq!(partial.len(), cut, "partial decode consumed bytes");
        }
    }

    #[test]
    fn decode_invalid_magic() {
        let mut buf = encode(&Message::response(1, "ok"));
        buf[0] = 0xFF;
        let result = decode_message(&mut buf, &FrameConfig::default());
        assert!(matches!(result, Err(FrameError::InvalidMagic)));
    }

    #[test]
    fn decode_unknown_kind() {
        let mut buf = encode(&Message::response(1, "ok"));
        buf[2] = 9;
        let err = decode_message(&mut buf, &FrameConfig::default()).unwrap_err();
        assert!(matches!(err, FrameError::UnknownKind(9)));
        assert!(err.is_fatal());
    }

    #[test]
    fn decode_payload_too_large() {
        let mut buf = BytesMut::new();
        buf.put_slice(&MAGIC);
        buf.put_u8(MessageKind::Call as u8);
        buf.put_u8(0);
        buf.put_u16_le(1);
        buf.put_u32_le(1024 * 1024 * 32); // 32 MiB
        buf.put_u64_le(1);

        let result = decode_message(&mut buf, &FrameConfig::default());
        assert!(matches!(result, Err(FrameError::PayloadTooLarge { .. })));
    }

    #[test]
    fn decode_method_too_long() {
        let config = FrameConfig {
            max_method_len: 4,
            ..FrameConfig::default()
        };
        let mut buf = encode(&Message::call(1, "/long-method", ""));
        let result = decode_message(&mut buf, &config);
        assert!(matches!(
            result,
            Err(FrameError::MethodTooLong { len: 12, max: 4 })
        ));
    }

    #[test]
    fn decode_non_utf8_method_keeps_the_frame() {
        let mut buf = encode(&Message::call(1, "/ab", "x"));
        buf[HEADER_SIZE + 1] = 0xFF;
        buf.extend_from_slice(&encode(&Message::call(2, "/next", "")));

        let config = FrameConfig::default();
        let first = decode_message(&mut buf, &config).unwrap().unwrap();
        assert_eq!(first.seq, 1);
        assert_eq!(first.method, "/\u{FFFD}b");
        assert_eq!(first.payload.as_ref(), b"x");

        let second = decode_message(&mut buf, &config).unwrap().unwrap();
        assert_eq!(second.seq, 2);
        assert_eq!(second.method, "/next");
    }

    #[test]
    fn encode_rejects_oversized_payload_without_writing() {
        let config = FrameConfig {
            max_payload_size: 8,
            ..FrameConfig::default()
        };
        let mut buf = BytesMut::from(&b"prefix"[..]);
        let err = encode_message(&Message::call(1, "/m", vec![0u8; 9]), &mut buf, &config)
            .unwrap_err();

        assert!(matches!(err, FrameError::PayloadTooLarge { size: 9, max: 8 }));
        assert!(!err.is_fatal());
        assert_eq!(&buf[..], b"prefix");
    }

    #[test]
    fn encode_rejects_request_without_method() {
        let mut buf = BytesMut::new();
        let err = encode_message(&Message::call(1, "", "x"), &mut buf, &FrameConfig::default())
            .unwrap_err();
        assert!(matches!(err, FrameError::InvalidMethod(_)));
        assert!(buf.is_empty());
    }

    #[test]
    fn multiple_messages_in_one_buffer() {
        let mut buf = BytesMut::new();
        let config = FrameConfig::default();
        encode_message(&Message::call(1, "/a", "first"), &mut buf, &config).unwrap();
        encode_message(&Message::error(1, ErrorCode::Application, "boom"), &mut buf, &config)
            .unwrap();

        let m1 = decode_message(&mut buf, &config).unwrap().unwrap();
        assert_eq!(m1.kind, MessageKind::Call);
        assert_eq!(m1.payload.as_ref(), b"first");

        let m2 = decode_message(&mut buf, &config).unwrap().unwrap();
        assert_eq!(m2.kind, MessageKind::Error);
        assert_eq!(m2.error_parts().unwrap().1, "boom");

        assert!(buf.is_empty());
    }

    #[test]
    fn decode_eof_with_trailing_bytes_is_connection_closed() {
        let mut codec = MessageCodec::default();
        let full = encode(&Message::call(1, "/m", "payload"));
        let mut partial = BytesMut::from(&full[..full.len() - 2]);
        assert!(matches!(
            codec.decode_eof(&mut partial),
            Err(FrameError::ConnectionClosed)
        ));

        let mut empty = BytesMut::new();
        assert!(codec.decode_eof(&mut empty).unwrap().is_none());
    }

    #[tokio::test]
    async fn framed_stream_round_trip() {
        let (client, server) = tokio::io::duplex(16 * 1024);
        let mut writer = FramedWrite::new(client, MessageCodec::default());
        let mut reader = FramedRead::new(server, MessageCodec::default());

        let payload = vec![0xAB; 4096];
        writer
            .send(Message::call(5, "/bulk", payload.clone()))
            .await
            .unwrap();
        writer.send(Message::response(5, "done")).await.unwrap();
        drop(writer);

        let first = reader.next().await.unwrap().unwrap();
        assert_eq!(first.seq, 5);
        assert_eq!(first.payload.as_ref(), payload.as_slice());

        let second = reader.next().await.unwrap().unwrap();
        assert_eq!(second.kind, MessageKind::Response);

        assert!(reader.next().await.is_none());
    }
}
