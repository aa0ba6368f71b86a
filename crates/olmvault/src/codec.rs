//! CBOR encoding for structured Megolm session metadata.
//!
//! Signing keys and forwarding chains are small structured values stored in
//! byte columns next to the opaque pickle. An empty column decodes to an
//! empty value; anything else that is not valid CBOR of the expected shape is
//! reported as [`StoreError::Malformed`].

use std::collections::BTreeMap;

use serde::{Serialize, de::DeserializeOwned};

use crate::error::StoreError;

const ENTITY: &str = "megolm session metadata";

fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, StoreError> {
    let mut buf = Vec::new();
    ciborium::into_writer(value, &mut buf)
        .map_err(|e| StoreError::Backend(format!("CBOR encode failed: {e}")))?;
    Ok(buf)
}

fn decode<T: DeserializeOwned + Default>(bytes: &[u8]) -> Result<T, StoreError> {
    if bytes.is_empty() {
        return Ok(T::default());
    }
    ciborium::from_reader(bytes).map_err(|e| StoreError::malformed(ENTITY, e))
}

/// Encode signing keys for storage.
pub fn encode_signing_keys(keys: &BTreeMap<String, String>) -> Result<Vec<u8>, StoreError> {
    encode(keys)
}

/// Decode stored signing keys.
pub fn decode_signing_keys(bytes: &[u8]) -> Result<BTreeMap<String, String>, StoreError> {
    decode(bytes)
}

/// Encode a forwarding chain for storage.
pub fn encode_forwarding_chain(chain: &[String]) -> Result<Vec<u8>, StoreError> {
    encode(&chain)
}

/// Decode a stored forwarding chain.
pub fn decode_forwarding_chain(bytes: &[u8]) -> Result<Vec<String>, StoreError> {
    decode(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_signing_keys_roundtrip() {
        let mut keys = BTreeMap::new();
        keys.insert("ed25519".to_string(), "abc".to_string());
        let bytes = encode_signing_keys(&keys).unwrap();
        assert_eq!(decode_signing_keys(&bytes).unwrap(), keys);
    }

    #[test]
    fn test_empty_column_decodes_to_empty_value() {
        assert!(decode_signing_keys(&[]).unwrap().is_empty());
        assert!(decode_forwarding_chain(&[]).unwrap().is_empty());
    }

    #[test]
    fn test_wrong_shape_is_malformed() {
        let bytes = encode_forwarding_chain(&["k1".to_string()]).unwrap();
        let err = decode_signing_keys(&bytes).unwrap_err();
        assert!(matches!(err, StoreError::Malformed { .. }));
    }

    #[test]
    fn test_garbage_is_malformed() {
        let err = decode_forwarding_chain(&[0xff, 0x00, 0x13]).unwrap_err();
        assert!(matches!(err, StoreError::Malformed { .. }));
    }
}
