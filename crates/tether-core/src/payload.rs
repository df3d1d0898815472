//! Opaque payload bytes and the codec that gives them shape.

use bytes::Bytes;
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::errors::{CodecError, DecodeError};

/// Payload bytes carried by request and response frames.
///
/// The multiplexer never looks inside; handlers decode them through a
/// [`PayloadCodec`].
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Payload(Bytes);

impl Payload {
    /// Wrap raw bytes.
    pub fn new(bytes: impl Into<Bytes>) -> Self {
        Self(bytes.into())
    }

    /// Empty payload.
    pub fn empty() -> Self {
        Self(Bytes::new())
    }

    /// Borrow the raw bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Consume into the underlying buffer.
    pub fn into_bytes(self) -> Bytes {
        self.0
    }

    /// Length in bytes.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether the payload carries no bytes.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<Bytes> for Payload {
    fn from(bytes: Bytes) -> Self {
        Self(bytes)
    }
}

impl From<Vec<u8>> for Payload {
    fn from(bytes: Vec<u8>) -> Self {
        Self(Bytes::from(bytes))
    }
}

impl From<String> for Payload {
    fn from(text: String) -> Self {
        Self(Bytes::from(text))
    }
}

/// Byte-level codec between typed values and payloads.
///
/// `decode(encode(x)) == x` must hold for every shape a route exchanges.
pub trait PayloadCodec: Send + Sync {
    /// Encode a value into payload bytes.
    fn encode<T: Serialize + ?Sized>(&self, value: &T) -> Result<Payload, CodecError>;

    /// Decode payload bytes into a value of type `T`.
    fn decode<T: DeserializeOwned>(&self, payload: &Payload) -> Result<T, DecodeError>;
}

/// JSON payload codec backed by `serde_json`.
#[derive(Clone, Copy, Debug, Default)]
pub struct JsonCodec;

impl PayloadCodec for JsonCodec {
    fn encode<T: Serialize + ?Sized>(&self, value: &T) -> Result<Payload, CodecError> {
        Ok(Payload::from(serde_json::to_vec(value)?))
    }

    fn decode<T: DeserializeOwned>(&self, payload: &Payload) -> Result<T, DecodeError> {
        Ok(serde_json::from_slice(payload.as_bytes())?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use serde::Deserialize;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    #[serde(rename_all = "camelCase")]
    struct Greeting {
        message: String,
        user_name: String,
    }

    #[test]
    fn json_round_trip() {
        let value = Greeting {
            message: "hi".into(),
            user_name: "u".into(),
        };
        let payload = JsonCodec.encode(&value).unwrap();
        assert_eq!(payload.as_bytes(), br#"{"message":"hi","userName":"u"}"#);
        let back: Greeting = JsonCodec.decode(&payload).unwrap();
        assert_eq!(back, value);
    }

    #[test]
    fn plain_string_round_trip() {
        let payload = JsonCodec.encode("healthy").unwrap();
        let back: String = JsonCodec.decode(&payload).unwrap();
        assert_eq!(back, "healthy");
    }

    #[test]
    fn malformed_payload_is_decode_error() {
        let payload = Payload::from(b"{not json".to_vec());
        let result: Result<Greeting, _> = JsonCodec.decode(&payload);
        assert_matches!(result, Err(DecodeError::Payload(_)));
    }

    #[test]
    fn wrong_shape_is_decode_error() {
        let payload = JsonCodec.encode(&serde_json::json!({"other": 1})).unwrap();
        let result: Result<Greeting, _> = JsonCodec.decode(&payload);
        assert!(result.is_err());
    }

    #[test]
    fn empty_payload_helpers() {
        let p = Payload::empty();
        assert!(p.is_empty());
        assert_eq!(p.len(), 0);
        assert_eq!(Payload::from(String::from("ab")).len(), 2);
    }
}
