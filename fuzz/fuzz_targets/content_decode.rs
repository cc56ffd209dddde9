//! Fuzz target for ProtoContent::decode
//!
//! Decrypted payloads come from other devices, so decoding must hold up
//! against arbitrary bytes.
//!
//! # Invariants
//!
//! - Decoding NEVER panics, invalid input returns an error
//! - Anything that decodes re-encodes, and the re-encoding decodes to the
//!   same value

#![no_main]

use courier_core::ProtoContent;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let Ok(content) = ProtoContent::decode(data) else {
        return;
    };

    let encoded = content.encode().expect("decoded content must re-encode");
    let decoded = ProtoContent::decode(&encoded).expect("re-encoded content must decode");
    assert_eq!(decoded, content);
});
