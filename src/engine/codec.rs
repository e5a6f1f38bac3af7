//! Payload codecs (spec.md §6: "default codec JSON... XML codec is also
//! provided").
//!
//! `Codec<T>` is parameterized on the decoded value rather than generic
//! over a type parameter on its methods, which keeps `dyn Codec<T>`
//! object-safe — the engine swaps codecs at registration time via
//! [`crate::engine::ProtocolEngine::register_codec`] and needs to hold
//! one behind an `Arc<dyn Codec<T>>`.

use std::marker::PhantomData;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::RippleError;

pub trait Codec<T>: Send + Sync + 'static {
    fn decode(&self, bytes: &[u8]) -> Result<T, RippleError>;
    fn encode(&self, value: &T) -> Result<Vec<u8>, RippleError>;
}

/// The engine's default codec (spec.md §6).
#[derive(Default)]
pub struct JsonCodec<T>(PhantomData<fn() -> T>);

impl<T> JsonCodec<T> {
    pub fn new() -> Self {
        Self(PhantomData)
    }
}

impl<T> Codec<T> for JsonCodec<T>
where
    T: Serialize + DeserializeOwned + Send + Sync + 'static,
{
    fn decode(&self, bytes: &[u8]) -> Result<T, RippleError> {
        serde_json::from_slice(bytes).map_err(|e| RippleError::Codec(e.to_string()))
    }

    fn encode(&self, value: &T) -> Result<Vec<u8>, RippleError> {
        serde_json::to_vec(value).map_err(|e| RippleError::Codec(e.to_string()))
    }
}

/// The alternate codec spec.md §6 calls out by name.
#[derive(Default)]
pub struct XmlCodec<T>(PhantomData<fn() -> T>);

impl<T> XmlCodec<T> {
    pub fn new() -> Self {
        Self(PhantomData)
    }
}

impl<T> Codec<T> for XmlCodec<T>
where
    T: Serialize + DeserializeOwned + Send + Sync + 'static,
{
    fn decode(&self, bytes: &[u8]) -> Result<T, RippleError> {
        let text = std::str::from_utf8(bytes).map_err(|e| RippleError::Codec(e.to_string()))?;
        quick_xml::de::from_str(text).map_err(|e| RippleError::Codec(e.to_string()))
    }

    fn encode(&self, value: &T) -> Result<Vec<u8>, RippleError> {
        quick_xml::se::to_string(value)
            .map(|s| s.into_bytes())
            .map_err(|e| RippleError::Codec(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct Ping {
        n: u32,
    }

    #[test]
    fn json_roundtrip() {
        let codec = JsonCodec::<Ping>::new();
        let bytes = codec.encode(&Ping { n: 7 }).unwrap();
        assert_eq!(codec.decode(&bytes).unwrap(), Ping { n: 7 });
    }

    #[test]
    fn json_decode_error_is_codec_error() {
        let codec = JsonCodec::<Ping>::new();
        assert!(matches!(codec.decode(b"not json"), Err(RippleError::Codec(_))));
    }

    #[test]
    fn xml_roundtrip() {
        let codec = XmlCodec::<Ping>::new();
        let bytes = codec.encode(&Ping { n: 9 }).unwrap();
        assert_eq!(codec.decode(&bytes).unwrap(), Ping { n: 9 });
    }
}
