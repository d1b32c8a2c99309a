//! Codec bridge (§4.3): encode/decode for metadata and OAuth2 user-data
//! records only. Documents use `serde_json` directly (the vocabulary layer
//! is out of scope, §1).
//!
//! Unlike the source material's process-wide mutable function pointers,
//! the codec is a trait object held by the `Repository` (§9 "Explicit codec
//! handle") so tests can inject a failing codec without any global state.

use crate::error::{Error, Result};
use serde_json::Value;
use std::fmt;

/// A swappable encode/decode pair for metadata and OAuth2 blobs.
pub trait Codec: fmt::Debug + Send + Sync {
    fn encode(&self, value: &Value) -> Result<Vec<u8>>;
    fn decode(&self, bytes: &[u8]) -> Result<Value>;
}

/// The default codec: plain JSON via `serde_json`.
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonCodec;

impl Codec for JsonCodec {
    fn encode(&self, value: &Value) -> Result<Vec<u8>> {
        serde_json::to_vec(value).map_err(Error::from)
    }

    fn decode(&self, bytes: &[u8]) -> Result<Value> {
        serde_json::from_slice(bytes).map_err(Error::from)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use serde_json::json;

    #[test]
    fn round_trips_a_value() {
        let codec = JsonCodec;
        let value = json!({"a": 1, "b": "hi"});
        let bytes = codec.encode(&value).unwrap();
        let decoded = codec.decode(&bytes).unwrap();
        assert_eq!(decoded, value);
    }

    /// A codec that always fails, for exercising error paths (§4.3: "tests
    /// may inject a failing codec").
    #[derive(Debug, Default)]
    struct FailingCodec;

    impl Codec for FailingCodec {
        fn encode(&self, _value: &Value) -> Result<Vec<u8>> {
            Err(Error::NotValid("codec always fails".into()))
        }
        fn decode(&self, _bytes: &[u8]) -> Result<Value> {
            Err(Error::NotValid("codec always fails".into()))
        }
    }

    #[test]
    fn failing_codec_surfaces_error() {
        let codec = FailingCodec;
        assert!(codec.encode(&json!({"a": 1})).is_err());
        assert!(codec.decode(b"{}").is_err());
    }
}
