//! Binary object codec
//!
//! Cache entries are persisted in MessagePack form. The wire format is an
//! implementation detail; callers only rely on `decode(encode(v)) == v`.

use serde::Serialize;
use serde::de::DeserializeOwned;
use thiserror::Error;

/// Codec errors
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("Encode error: {0}")]
    Encode(#[from] rmp_serde::encode::Error),

    #[error("Decode error: {0}")]
    Decode(#[from] rmp_serde::decode::Error),
}

/// Encode a value to its compact binary form.
pub fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, CodecError> {
    Ok(rmp_serde::to_vec(value)?)
}

/// Decode a value previously produced by [`encode`].
pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, CodecError> {
    Ok(rmp_serde::from_slice(bytes)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct CachedResponse {
        status: u16,
        headers: Vec<(String, String)>,
        body: Vec<u8>,
    }

    #[test]
    fn test_round_trip() {
        let entry = CachedResponse {
            status: 200,
            headers: vec![("content-type".to_string(), "text/html".to_string())],
            body: b"<html></html>".to_vec(),
        };

        let bytes = encode(&entry).unwrap();
        let decoded: CachedResponse = decode(&bytes).unwrap();

        assert_eq!(entry, decoded);
    }

    #[test]
    fn test_decode_garbage_fails() {
        let result: Result<CachedResponse, _> = decode(&[0xc1, 0xff, 0x00]);
        assert!(result.is_err());
    }
}
