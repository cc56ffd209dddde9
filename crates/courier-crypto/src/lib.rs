//! Courier Cryptographic Primitives
//!
//! Symmetric building blocks the send pipeline needs on top of the pairwise
//! and group engines. Pure functions; callers provide random bytes so tests
//! stay deterministic.
//!
//! # External Message Blobs
//!
//! Pairwise encryption costs one encryption per recipient device. For large
//! content the pipeline seals the content once with a fresh key and only
//! encrypts the key and digest per device:
//!
//! ```text
//! Content ──XChaCha20-Poly1305(random key)──► Blob (attached to envelope)
//!                                               │
//!                                        SHA-256 digest
//!                                               │
//! (key, digest) ──pairwise per device──► Client payloads
//! ```
//!
//! # Security
//!
//! - Keys are single-use and zeroized on drop
//! - The digest binds the instructions to one blob; receivers reject a blob
//!   whose digest does not match before attempting decryption
//! - AEAD tag failure rejects tampered blobs

#![forbid(unsafe_code)]
#![deny(missing_docs)]

pub mod error;
pub mod external;

pub use error::BlobError;
pub use external::{
    BLOB_KEY_SIZE, BLOB_NONCE_SIZE, BlobKey, SealedBlob, content_digest, open_blob, seal_blob,
};
