use crate::error::Result;
use serde::{Deserialize, Serialize};

/// Trait for encoding and decoding message payloads.
///
/// Client and server must agree on the codec. Encodings must be
/// self-describing because call arguments travel as a sequence of
/// untyped values until the handler decodes them.
pub trait Codec: Send + Sync + std::fmt::Debug + 'static {
    /// Encode a serializable value into bytes
    fn encode<T: Serialize>(&self, data: &T) -> Result<Vec<u8>>;

    /// Decode bytes into a deserializable value
    fn decode<T: for<'de> Deserialize<'de>>(&self, data: &[u8]) -> Result<T>;
}

/// Default codec (JSON codec)
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl Codec for JsonCodec {
    fn encode<T: Serialize>(&self, data: &T) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(data)?)
    }

    fn decode<T: for<'de> Deserialize<'de>>(&self, data: &[u8]) -> Result<T> {
        Ok(serde_json::from_slice(data)?)
    }
}

/// MessagePack codec - compact binary, cross-language compatible
#[cfg(feature = "codec-messagepack")]
#[derive(Debug, Clone, Copy, Default)]
pub struct MessagePackCodec;

#[cfg(feature = "codec-messagepack")]
impl Codec for MessagePackCodec {
    fn encode<T: Serialize>(&self, data: &T) -> Result<Vec<u8>> {
        rmp_serde::to_vec(data).map_err(|e| crate::error::RpcError::Serialization(e.to_string()))
    }

    fn decode<T: for<'de> Deserialize<'de>>(&self, data: &[u8]) -> Result<T> {
        rmp_serde::from_slice(data)
            .map_err(|e| crate::error::RpcError::Serialization(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;

    #[test]
    fn test_json_codec_keeps_integers_exact() {
        let codec = JsonCodec;
        let values = vec![
            Value::from(i64::MAX),
            Value::from(u64::MAX),
            Value::from(-1i8),
        ];

        let bytes = codec.encode(&values).unwrap();
        let decoded: Vec<Value> = codec.decode(&bytes).unwrap();

        assert_eq!(decoded[0].as_i64(), Some(i64::MAX));
        assert_eq!(decoded[1].as_u64(), Some(u64::MAX));
        assert_eq!(decoded[2].as_i64(), Some(-1));
    }

    #[test]
    fn test_json_codec_rejects_garbage() {
        let codec = JsonCodec;
        let result: Result<Vec<Value>> = codec.decode(b"not json");
        assert!(matches!(
            result,
            Err(crate::error::RpcError::Serialization(_))
        ));
    }
}
