//! Fuzz target for Megolm session metadata columns
//!
//! Signing keys and forwarding chains are stored as CBOR blobs. A corrupt or
//! hostile blob in the database must be reported, not trusted.
//!
//! # Strategy
//!
//! - Random bytes: arbitrary data fed to both decoders
//! - Round trips: arbitrary maps and chains encoded then decoded
//! - Truncation: valid encodings cut short at an arbitrary offset
//!
//! # Invariants
//!
//! - Decoding NEVER panics
//! - Every decode failure is a `Malformed` error
//! - Encoded metadata always decodes to the original value

#![no_main]

use std::collections::BTreeMap;

use arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;
use olmvault::{StoreError, codec};

#[derive(Debug, Clone, Arbitrary)]
enum MetadataInput {
    RandomBytes { bytes: Vec<u8> },
    RoundTrip { keys: BTreeMap<String, String>, chain: Vec<String> },
    Truncated { keys: BTreeMap<String, String>, chain: Vec<String>, cut: u16 },
}

fn check_decode_error(result: Result<impl Sized, StoreError>) {
    if let Err(err) = result {
        assert!(matches!(err, StoreError::Malformed { .. }), "unexpected error: {err}");
    }
}

fuzz_target!(|input: MetadataInput| {
    match input {
        MetadataInput::RandomBytes { bytes } => {
            check_decode_error(codec::decode_signing_keys(&bytes));
            check_decode_error(codec::decode_forwarding_chain(&bytes));
        },

        MetadataInput::RoundTrip { keys, chain } => {
            let encoded_keys = codec::encode_signing_keys(&keys).unwrap();
            assert_eq!(codec::decode_signing_keys(&encoded_keys).unwrap(), keys);

            let encoded_chain = codec::encode_forwarding_chain(&chain).unwrap();
            assert_eq!(codec::decode_forwarding_chain(&encoded_chain).unwrap(), chain);
        },

        MetadataInput::Truncated { keys, chain, cut } => {
            let encoded_keys = codec::encode_signing_keys(&keys).unwrap();
            let cut_at = usize::from(cut) % (encoded_keys.len() + 1);
            check_decode_error(codec::decode_signing_keys(&encoded_keys[..cut_at]));

            let encoded_chain = codec::encode_forwarding_chain(&chain).unwrap();
            let cut_at = usize::from(cut) % (encoded_chain.len() + 1);
            check_decode_error(codec::decode_forwarding_chain(&encoded_chain[..cut_at]));
        },
    }
});
