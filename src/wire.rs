//! Wire framing for the tunnel WebSocket.
//!
//! Every message crossing the socket is one [`Envelope`] carried as a single
//! binary frame: an opaque correlation id plus the raw HTTP bytes of either
//! a request (forward leg) or a response (return leg). The encoding is a
//! small self-describing JSON object with the payload base64-encoded so that
//! arbitrary binary bodies survive the trip unchanged.

use base64::engine::general_purpose::STANDARD as BASE64;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors produced while encoding or decoding an [`Envelope`].
#[derive(Debug, Error)]
pub enum WireError {
    #[error("malformed envelope: {0}")]
    Malformed(#[from] serde_json::Error),
}

/// A single message on the tunnel socket.
///
/// The `id` pairs a response to the request that produced it; the payload is
/// never inspected by the transport layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    pub id: String,
    #[serde(with = "base64_bytes")]
    pub payload: Vec<u8>,
}

impl Envelope {
    pub fn new(id: impl Into<String>, payload: Vec<u8>) -> Self {
        Self {
            id: id.into(),
            payload,
        }
    }

    /// Encodes the envelope into the bytes of one binary frame.
    pub fn encode(&self) -> Result<Vec<u8>, WireError> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Decodes one binary frame back into an envelope.
    pub fn decode(bytes: &[u8]) -> Result<Self, WireError> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

mod base64_bytes {
    use serde::{Deserialize, Deserializer, Serializer, de};

    use super::BASE64;
    use base64::Engine as _;

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&BASE64.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        BASE64.decode(encoded).map_err(de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip() {
        let envelope = Envelope::new("req/42", b"GET / HTTP/1.1\r\nHost: x\r\n\r\n".to_vec());
        let bytes = envelope.encode().unwrap();
        assert_eq!(Envelope::decode(&bytes).unwrap(), envelope);
    }

    #[test]
    fn test_round_trip_binary_payload() {
        // NUL bytes, header separators, and invalid UTF-8 must all survive.
        let payload = vec![0u8, 13, 10, 13, 10, 0xff, 0xfe, 0x00, b'x'];
        let envelope = Envelope::new("req/binary", payload);
        let bytes = envelope.encode().unwrap();
        assert_eq!(Envelope::decode(&bytes).unwrap(), envelope);
    }

    #[test]
    fn test_round_trip_empty_payload() {
        let envelope = Envelope::new("req/empty", Vec::new());
        let bytes = envelope.encode().unwrap();
        assert_eq!(Envelope::decode(&bytes).unwrap(), envelope);
    }

    #[test]
    fn test_encoded_shape() {
        let envelope = Envelope::new("testID", b"testPayload".to_vec());
        let bytes = envelope.encode().unwrap();
        assert_eq!(
            String::from_utf8(bytes).unwrap(),
            r#"{"id":"testID","payload":"dGVzdFBheWxvYWQ="}"#
        );
    }

    #[test]
    fn test_decode_rejects_junk() {
        assert!(Envelope::decode(b"not json").is_err());
        assert!(Envelope::decode(br#"{"id":"x","payload":"!!!not-base64!!!"}"#).is_err());
        assert!(Envelope::decode(br#"{"id":"x"}"#).is_err());
    }
}
