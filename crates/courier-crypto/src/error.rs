//! External blob errors.

use thiserror::Error;

/// Failures opening an external message blob.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BlobError {
    /// Blob is shorter than its nonce and tag
    #[error("blob too short: {len} bytes")]
    Truncated {
        /// Actual blob length
        len: usize,
    },

    /// Blob digest does not match the instructions
    #[error("blob digest mismatch")]
    DigestMismatch,

    /// Key has the wrong length
    #[error("invalid key length: expected {expected}, got {actual}")]
    InvalidKeyLength {
        /// Required key length
        expected: usize,
        /// Provided key length
        actual: usize,
    },

    /// Authentication tag check failed
    #[error("blob decryption failed")]
    DecryptionFailed,
}
