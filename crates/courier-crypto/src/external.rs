//! External blob sealing using `XChaCha20-Poly1305`.
//!
//! Blob layout: `nonce (24 bytes) || ciphertext || tag (16 bytes)`. The
//! digest is computed over the whole sealed blob.

use std::fmt;

use chacha20poly1305::{
    XChaCha20Poly1305, XNonce,
    aead::{Aead, KeyInit},
};
use sha2::{Digest, Sha256};
use zeroize::Zeroize;

use crate::error::BlobError;

/// Size of a blob key (32 bytes)
pub const BLOB_KEY_SIZE: usize = 32;

/// Size of the `XChaCha20` nonce prefixed to a blob (24 bytes)
pub const BLOB_NONCE_SIZE: usize = 24;

/// Poly1305 tag size (16 bytes)
const POLY1305_TAG_SIZE: usize = 16;

/// Single-use symmetric key for one blob. Zeroized on drop.
#[derive(Clone, PartialEq, Eq)]
pub struct BlobKey([u8; BLOB_KEY_SIZE]);

impl BlobKey {
    /// Wrap caller-provided random bytes.
    pub fn new(bytes: [u8; BLOB_KEY_SIZE]) -> Self {
        Self(bytes)
    }

    /// Parse a key received in external instructions.
    pub fn from_slice(bytes: &[u8]) -> Result<Self, BlobError> {
        let key: [u8; BLOB_KEY_SIZE] = bytes.try_into().map_err(|_| {
            BlobError::InvalidKeyLength { expected: BLOB_KEY_SIZE, actual: bytes.len() }
        })?;
        Ok(Self(key))
    }

    /// Raw key bytes.
    pub fn as_bytes(&self) -> &[u8; BLOB_KEY_SIZE] {
        &self.0
    }
}

impl Drop for BlobKey {
    fn drop(&mut self) {
        self.0.zeroize();
    }
}

impl fmt::Debug for BlobKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("BlobKey(..)")
    }
}

/// A sealed blob and its digest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SealedBlob {
    /// `nonce || ciphertext || tag`
    pub data: Vec<u8>,
    /// SHA-256 of `data`
    pub sha256: [u8; 32],
}

/// SHA-256 of arbitrary bytes.
pub fn content_digest(bytes: &[u8]) -> [u8; 32] {
    Sha256::digest(bytes).into()
}

/// Seal `plaintext` under `key`.
///
/// # Security
///
/// - Caller MUST provide a fresh random nonce per key in production. Keys
///   are single-use in the pipeline, so a random nonce is sufficient.
pub fn seal_blob(plaintext: &[u8], key: &BlobKey, nonce: [u8; BLOB_NONCE_SIZE]) -> SealedBlob {
    let cipher = XChaCha20Poly1305::new(key.as_bytes().into());

    let Ok(ciphertext) = cipher.encrypt(XNonce::from_slice(&nonce), plaintext) else {
        unreachable!("XChaCha20-Poly1305 encryption cannot fail with valid inputs");
    };

    let mut data = Vec::with_capacity(BLOB_NONCE_SIZE + ciphertext.len());
    data.extend_from_slice(&nonce);
    data.extend_from_slice(&ciphertext);

    let sha256 = content_digest(&data);
    SealedBlob { data, sha256 }
}

/// Open a sealed blob after checking it against the expected digest.
///
/// # Errors
///
/// - `DigestMismatch`: blob is not the one the instructions describe
/// - `Truncated`: blob cannot hold a nonce and tag
/// - `DecryptionFailed`: wrong key or tampered ciphertext
pub fn open_blob(data: &[u8], key: &BlobKey, expected_sha256: &[u8]) -> Result<Vec<u8>, BlobError> {
    if content_digest(data).as_slice() != expected_sha256 {
        return Err(BlobError::DigestMismatch);
    }
    if data.len() < BLOB_NONCE_SIZE + POLY1305_TAG_SIZE {
        return Err(BlobError::Truncated { len: data.len() });
    }

    let (nonce, ciphertext) = data.split_at(BLOB_NONCE_SIZE);
    let cipher = XChaCha20Poly1305::new(key.as_bytes().into());

    cipher
        .decrypt(XNonce::from_slice(nonce), ciphertext)
        .map_err(|_| BlobError::DecryptionFailed)
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    fn key(seed: u8) -> BlobKey {
        let mut bytes = [0u8; BLOB_KEY_SIZE];
        for (i, byte) in bytes.iter_mut().enumerate() {
            *byte = seed.wrapping_add(i as u8);
        }
        BlobKey::new(bytes)
    }

    #[test]
    fn seal_open_roundtrip() {
        let key = key(1);
        let sealed = seal_blob(b"a large attachment body", &key, [0x11; BLOB_NONCE_SIZE]);

        let opened = open_blob(&sealed.data, &key, &sealed.sha256).unwrap();

        assert_eq!(opened, b"a large attachment body");
    }

    #[test]
    fn sealed_blob_layout() {
        let sealed = seal_blob(b"abc", &key(2), [0x22; BLOB_NONCE_SIZE]);

        assert_eq!(sealed.data.len(), BLOB_NONCE_SIZE + 3 + POLY1305_TAG_SIZE);
        assert_eq!(&sealed.data[..BLOB_NONCE_SIZE], &[0x22; BLOB_NONCE_SIZE]);
        assert_eq!(sealed.sha256, content_digest(&sealed.data));
    }

    #[test]
    fn digest_mismatch_is_rejected_before_decryption() {
        let key = key(3);
        let sealed = seal_blob(b"payload", &key, [0; BLOB_NONCE_SIZE]);

        let result = open_blob(&sealed.data, &key, &[0u8; 32]);

        assert_eq!(result, Err(BlobError::DigestMismatch));
    }

    #[test]
    fn wrong_key_fails_authentication() {
        let sealed = seal_blob(b"payload", &key(4), [0; BLOB_NONCE_SIZE]);

        let result = open_blob(&sealed.data, &key(5), &sealed.sha256);

        assert_eq!(result, Err(BlobError::DecryptionFailed));
    }

    #[test]
    fn truncated_blob_is_rejected() {
        let data = vec![0u8; 10];

        let result = open_blob(&data, &key(6), &content_digest(&data));

        assert_eq!(result, Err(BlobError::Truncated { len: 10 }));
    }

    #[test]
    fn key_length_is_checked() {
        assert_eq!(
            BlobKey::from_slice(&[0u8; 16]),
            Err(BlobError::InvalidKeyLength { expected: BLOB_KEY_SIZE, actual: 16 })
        );
        assert_eq!(BlobKey::from_slice(&[9u8; 32]).unwrap().as_bytes(), &[9u8; 32]);
    }

    #[test]
    fn debug_does_not_leak_key() {
        assert_eq!(format!("{:?}", key(7)), "BlobKey(..)");
    }

    proptest! {
        #[test]
        fn tampering_any_byte_is_detected(
            plaintext in prop::collection::vec(any::<u8>(), 0..512),
            index in any::<prop::sample::Index>(),
        ) {
            let key = key(8);
            let sealed = seal_blob(&plaintext, &key, [0x33; BLOB_NONCE_SIZE]);
            let mut tampered = sealed.data.clone();
            let i = index.index(tampered.len());
            tampered[i] ^= 0x01;

            let result = open_blob(&tampered, &key, &content_digest(&tampered));

            prop_assert_eq!(result, Err(BlobError::DecryptionFailed));
        }
    }
}
