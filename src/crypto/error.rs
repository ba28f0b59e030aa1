//! Cryptographic error types

use thiserror::Error;

/// Errors that can occur in cryptographic operations
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CryptoError {
    /// The transfer code is too short to be stretched into a key
    #[error("Transfer code too weak: {length} characters, at least {minimum} required")]
    WeakCode {
        /// Length of the rejected code
        length: usize,
        /// Minimum accepted length
        minimum: usize,
    },

    /// The provided key has an invalid length
    #[error("Invalid key length: expected {expected}, got {actual}")]
    InvalidKeyLength {
        /// Expected key length in bytes
        expected: usize,
        /// Actual key length in bytes
        actual: usize,
    },

    /// Key derivation failed
    #[error("Key derivation failed: {0}")]
    KeyDerivationFailed(String),

    /// Encryption operation failed
    #[error("Encryption failed: {0}")]
    EncryptionFailed(String),

    /// Authenticated decryption failed (tampered data or wrong key)
    #[error("Integrity check failed: authentication tag mismatch")]
    Integrity,

    /// CBC ciphertext was misaligned or carried malformed padding
    #[error("Invalid padding or block alignment")]
    InvalidPadding,
}

/// Result type for cryptographic operations
pub type CryptoResult<T> = Result<T, CryptoError>;
