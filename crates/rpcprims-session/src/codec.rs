//! Payload encoding.
//!
//! Strings and byte vectors travel verbatim; everything else goes through a
//! [`Codec`]. The fast path is chosen by type at runtime, so a handler can
//! bind a string payload as bytes and vice versa.

use std::any::{Any, TypeId};

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::CodecError;

/// Structured payload serializer.
pub trait Codec: Send + Sync + 'static {
    /// Short name for diagnostics.
    fn name(&self) -> &'static str;

    /// Serialize a value.
    fn encode<T: Serialize + ?Sized>(&self, value: &T) -> Result<Vec<u8>, CodecError>;

    /// Deserialize a value.
    fn decode<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T, CodecError>;
}

/// The default codec: JSON via `serde_json`.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl Codec for JsonCodec {
    fn name(&self) -> &'static str {
        "json"
    }

    fn encode<T: Serialize + ?Sized>(&self, value: &T) -> Result<Vec<u8>, CodecError> {
        Ok(serde_json::to_vec(value)?)
    }

    fn decode<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T, CodecError> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

/// Encode a value, copying `String`, `&'static str` and `Vec<u8>` verbatim.
pub fn encode_payload<C, T>(codec: &C, value: &T) -> Result<Bytes, CodecError>
where
    C: Codec + ?Sized,
    T: Serialize + Any,
{
    let any = value as &dyn Any;
    if let Some(s) = any.downcast_ref::<String>() {
        return Ok(Bytes::copy_from_slice(s.as_bytes()));
    }
    if let Some(s) = any.downcast_ref::<&'static str>() {
        return Ok(Bytes::copy_from_slice(s.as_bytes()));
    }
    if let Some(b) = any.downcast_ref::<Vec<u8>>() {
        return Ok(Bytes::copy_from_slice(b));
    }
    codec.encode(value).map(Bytes::from)
}

/// Decode a payload, reading `String` and `Vec<u8>` verbatim.
///
/// A `String` target requires valid UTF-8.
pub fn decode_payload<C, T>(codec: &C, bytes: &[u8]) -> Result<T, CodecError>
where
    C: Codec + ?Sized,
    T: DeserializeOwned + Any,
{
    let target = TypeId::of::<T>();
    if target == TypeId::of::<String>() {
        return cast(String::from_utf8(bytes.to_vec())?);
    }
    if target == TypeId::of::<Vec<u8>>() {
        return cast(bytes.to_vec());
    }
    codec.decode(bytes)
}

fn cast<S: Any, T: Any>(value: S) -> Result<T, CodecError> {
    let mut slot = Some(value);
    (&mut slot as &mut dyn Any)
        .downcast_mut::<Option<T>>()
        .and_then(Option::take)
        .ok_or(CodecError::TypeMismatch {
            expected: std::any::type_name::<T>(),
        })
}

#[cfg(test)]
mod tests {
    use serde::Deserialize;

    use super::*;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Point {
        x: i32,
        y: i32,
    }

    #[test]
    fn strings_bypass_the_codec() {
        let owned = encode_payload(&JsonCodec, &"hello".to_string()).unwrap();
        assert_eq!(owned.as_ref(), b"hello");

        let borrowed = encode_payload(&JsonCodec, &"hello").unwrap();
        assert_eq!(borrowed.as_ref(), b"hello");

        let decoded: String = decode_payload(&JsonCodec, b"hello").unwrap();
        assert_eq!(decoded, "hello");
    }

    #[test]
    fn bytes_bypass_the_codec() {
        let raw = vec![0u8, 159, 146, 150];
        let encoded = encode_payload(&JsonCodec, &raw).unwrap();
        assert_eq!(encoded.as_ref(), raw.as_slice());

        let decoded: Vec<u8> = decode_payload(&JsonCodec, &raw).unwrap();
        assert_eq!(decoded, raw);
    }

    #[test]
    fn string_payload_binds_as_bytes_and_back() {
        let encoded = encode_payload(&JsonCodec, &"abc").unwrap();
        let as_bytes: Vec<u8> = decode_payload(&JsonCodec, &encoded).unwrap();
        assert_eq!(as_bytes, b"abc");

        let encoded = encode_payload(&JsonCodec, &b"xyz".to_vec()).unwrap();
        let as_string: String = decode_payload(&JsonCodec, &encoded).unwrap();
        assert_eq!(as_string, "xyz");
    }

    #[test]
    fn string_target_rejects_invalid_utf8() {
        let err = decode_payload::<_, String>(&JsonCodec, &[0xFF, 0xFE]).unwrap_err();
        assert!(matches!(err, CodecError::Utf8(_)));
    }

    #[test]
    fn structs_use_json() {
        let encoded = encode_payload(&JsonCodec, &Point { x: 1, y: -2 }).unwrap();
        assert_eq!(encoded.as_ref(), br#"{"x":1,"y":-2}"#);

        let decoded: Point = decode_payload(&JsonCodec, &encoded).unwrap();
        assert_eq!(decoded, Point { x: 1, y: -2 });
    }

    #[test]
    fn malformed_json_is_a_json_error() {
        let err = decode_payload::<_, Point>(&JsonCodec, b"{not json").unwrap_err();
        assert!(matches!(err, CodecError::Json(_)));
    }
}
