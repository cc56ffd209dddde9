//! Fuzz target for external blob sealing
//!
//! # Strategy
//!
//! - Seal arbitrary plaintext under an arbitrary key and nonce
//! - Optionally flip one byte of the sealed blob, truncate it, or open it
//!   with a different key
//!
//! # Invariants
//!
//! - An untouched blob opens to the original plaintext
//! - A tampered blob NEVER opens, and NEVER panics

#![no_main]

use arbitrary::Arbitrary;
use courier_crypto::{BLOB_KEY_SIZE, BLOB_NONCE_SIZE, BlobKey, content_digest, open_blob, seal_blob};
use libfuzzer_sys::fuzz_target;

#[derive(Debug, Arbitrary)]
enum Tamper {
    None,
    FlipByte { index: usize, mask: u8 },
    Truncate { len: usize },
    WrongKey { key: [u8; BLOB_KEY_SIZE] },
}

#[derive(Debug, Arbitrary)]
struct Input {
    key: [u8; BLOB_KEY_SIZE],
    nonce: [u8; BLOB_NONCE_SIZE],
    plaintext: Vec<u8>,
    tamper: Tamper,
}

fuzz_target!(|input: Input| {
    let key = BlobKey::new(input.key);
    let sealed = seal_blob(&input.plaintext, &key, input.nonce);

    match input.tamper {
        Tamper::None => {
            let opened = open_blob(&sealed.data, &key, &sealed.sha256).expect("untouched blob opens");
            assert_eq!(opened, input.plaintext);
        },
        Tamper::FlipByte { index, mask } => {
            if mask == 0 {
                return;
            }
            let mut data = sealed.data.clone();
            let index = index % data.len();
            data[index] ^= mask;

            // Checked against the original digest the blob is rejected up
            // front; against its own digest decryption must catch it.
            assert!(open_blob(&data, &key, &sealed.sha256).is_err());
            assert!(open_blob(&data, &key, &content_digest(&data)).is_err());
        },
        Tamper::Truncate { len } => {
            let len = len % sealed.data.len();
            let data = &sealed.data[..len];
            assert!(open_blob(data, &key, &content_digest(data)).is_err());
        },
        Tamper::WrongKey { key: other } => {
            if other == input.key {
                return;
            }
            assert!(open_blob(&sealed.data, &BlobKey::new(other), &sealed.sha256).is_err());
        },
    }
});
