use serde::Serialize;
use serde::de::DeserializeOwned;
use std::marker::PhantomData;
use thiserror::Error;

/// Which codec a registration uses for a message part.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CodecSelector {
    /// The default: a codec registered in the resolver for the target type
    /// wins, otherwise the built-in JSON codec.
    Json,
    /// A codec must be registered in the resolver; its absence is a
    /// configuration error surfaced at first use.
    Registered,
}

#[derive(Error, Debug)]
#[error("{reason}")]
pub struct CodecError {
    pub reason: String,
}

impl CodecError {
    pub fn new(reason: impl Into<String>) -> Self {
        CodecError {
            reason: reason.into(),
        }
    }
}

pub trait Decoder<T>: Send + Sync {
    /// `None` means the message carried no bytes for this part at all.
    fn decode(&self, buf: Option<&[u8]>) -> Result<T, CodecError>;
}

pub trait Encoder<T>: Send + Sync {
    fn encode(&self, value: &T) -> Result<Vec<u8>, CodecError>;
}

/// JSON text codec, the configured default for keys and values. An absent
/// part decodes as JSON `null` so `Option<T>` works without special-casing
/// keyless messages.
pub struct JsonCodec<T> {
    _marker: PhantomData<fn() -> T>,
}

impl<T> Default for JsonCodec<T> {
    fn default() -> Self {
        JsonCodec {
            _marker: PhantomData,
        }
    }
}

impl<T: DeserializeOwned> Decoder<T> for JsonCodec<T> {
    fn decode(&self, buf: Option<&[u8]>) -> Result<T, CodecError> {
        let buf = buf.unwrap_or(b"null");
        serde_json::from_slice(buf).map_err(|e| CodecError::new(e.to_string()))
    }
}

impl<T: Serialize> Encoder<T> for JsonCodec<T> {
    fn encode(&self, value: &T) -> Result<Vec<u8>, CodecError> {
        serde_json::to_vec(value).map_err(|e| CodecError::new(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Deserialize, Serialize, PartialEq)]
    struct Order {
        id: String,
        amount: u64,
    }

    #[test]
    fn json_codec_round_trips() {
        let codec = JsonCodec::<Order>::default();
        let order = Order {
            id: "o-1".to_string(),
            amount: 250,
        };
        let bytes = codec.encode(&order).unwrap();
        let decoded = codec.decode(Some(&bytes)).unwrap();
        assert_eq!(decoded, order);
    }

    #[test]
    fn absent_part_decodes_as_null() {
        let codec = JsonCodec::<Option<String>>::default();
        assert_eq!(codec.decode(None).unwrap(), None);

        let required = JsonCodec::<Order>::default();
        assert!(required.decode(None).is_err());
    }

    #[test]
    fn malformed_payload_is_an_error() {
        let codec = JsonCodec::<Order>::default();
        let err = codec.decode(Some(b"{not json")).unwrap_err();
        assert!(!err.reason.is_empty());
    }
}
