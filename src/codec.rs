//! The `Codec<T>` boundary (spec §4.1 "Codec<T>"): serialize/deserialize one
//! application message to/from bytes. The transport and the dispatch engine
//! never see `T` — only a method's registration does.
//!
//! Per the design note on "passthrough codecs as type-system escape hatches"
//! (spec §9), this crate keeps the raw-bytes layer (transport, dispatcher)
//! and the typed layer (`Codec<T>`, call primitives) strictly separate: a
//! [`Codec`] is only ever invoked at the call-primitive/contract boundary.

use bytes::Bytes;

use crate::error::CodecError;

/// Serializes and deserializes one application message of type `T`.
///
/// Implementations must be stateless (or internally synchronized): the
/// responder dispatch engine invokes a method's codecs concurrently across
/// calls (spec §5 "Shared state discipline").
pub trait Codec<T>: Send + Sync + 'static {
    fn serialize(&self, item: &T) -> Result<Bytes, CodecError>;
    fn deserialize(&self, bytes: &[u8]) -> Result<T, CodecError>;
}

/// Identity codec for callers that already have framed bytes in hand, or
/// tests that don't want to round-trip through a "real" codec. Mirrors the
/// escape hatch the design notes call out, kept explicit rather than
/// implicit so it's never reached for by accident.
#[derive(Debug, Clone, Copy, Default)]
pub struct BytesCodec;

impl Codec<Bytes> for BytesCodec {
    fn serialize(&self, item: &Bytes) -> Result<Bytes, CodecError> {
        Ok(item.clone())
    }

    fn deserialize(&self, bytes: &[u8]) -> Result<Bytes, CodecError> {
        Ok(Bytes::copy_from_slice(bytes))
    }
}

/// A UTF-8 string codec, handy for small examples and tests.
#[derive(Debug, Clone, Copy, Default)]
pub struct StringCodec;

impl Codec<String> for StringCodec {
    fn serialize(&self, item: &String) -> Result<Bytes, CodecError> {
        Ok(Bytes::copy_from_slice(item.as_bytes()))
    }

    fn deserialize(&self, bytes: &[u8]) -> Result<String, CodecError> {
        String::from_utf8(bytes.to_vec()).map_err(|e| CodecError::Decode(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bytes_codec_is_identity() {
        let codec = BytesCodec;
        let original = Bytes::from_static(b"payload");
        let encoded = codec.serialize(&original).unwrap();
        let decoded = codec.deserialize(&encoded).unwrap();
        assert_eq!(decoded, original);
    }

    #[test]
    fn string_codec_round_trips_utf8() {
        let codec = StringCodec;
        let original = "hello world".to_string();
        let encoded = codec.serialize(&original).unwrap();
        let decoded = codec.deserialize(&encoded).unwrap();
        assert_eq!(decoded, original);
    }

    #[test]
    fn string_codec_rejects_invalid_utf8() {
        let codec = StringCodec;
        assert!(codec.deserialize(&[0xff, 0xfe, 0xfd]).is_err());
    }
}
