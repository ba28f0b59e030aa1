//! Error types for transfer orchestration.

use thiserror::Error;

use crate::crypto::CryptoError;
use crate::transport::{AttemptRecord, TransportError};

/// Errors surfaced by a transfer session.
#[derive(Error, Debug)]
pub enum TransferError {
    /// Transfer code too short to derive a key from. Never retried.
    #[error("transfer code too weak: {length} characters, at least {minimum} required")]
    WeakCode {
        /// Length of the rejected code
        length: usize,
        /// Minimum accepted length
        minimum: usize,
    },

    /// Decryption or digest check failed. The payload was discarded.
    #[error("integrity check failed: {0}")]
    Integrity(String),

    /// Every registered transport was tried and none succeeded
    #[error("all {} transports failed{}", .attempts.len(), last_failure(.attempts))]
    AllTransportsExhausted {
        /// Every attempt, in the order it was made
        attempts: Vec<AttemptRecord>,
    },

    /// The caller cancelled the transfer
    #[error("transfer cancelled")]
    Cancelled,

    /// A session for the same code and role is already running
    #[error("a transfer for this code is already in progress")]
    TransferInProgress,

    /// The session was used out of order (e.g. sending on a receiver)
    #[error("invalid session state: {0}")]
    InvalidState(String),

    /// Other cryptographic failure
    #[error("crypto error: {0}")]
    Crypto(CryptoError),

    /// Transport failure outside of failover (e.g. during setup)
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(String),
}

impl TransferError {
    /// Whether this error ends the session as cancelled rather than failed
    pub fn is_cancellation(&self) -> bool {
        matches!(self, TransferError::Cancelled)
    }
}

/// Result type alias using [`TransferError`].
pub type Result<T> = std::result::Result<T, TransferError>;

impl From<CryptoError> for TransferError {
    fn from(err: CryptoError) -> Self {
        match err {
            CryptoError::WeakCode { length, minimum } => TransferError::WeakCode { length, minimum },
            CryptoError::Integrity | CryptoError::InvalidPadding => {
                TransferError::Integrity(err.to_string())
            }
            other => TransferError::Crypto(other),
        }
    }
}

impl From<std::io::Error> for TransferError {
    fn from(err: std::io::Error) -> Self {
        TransferError::Io(err.to_string())
    }
}

impl From<serde_json::Error> for TransferError {
    fn from(err: serde_json::Error) -> Self {
        TransferError::Config(err.to_string())
    }
}

fn last_failure(attempts: &[AttemptRecord]) -> String {
    attempts
        .last()
        .map(|a| format!("; last: {} ({})", a.transport, a.outcome))
        .unwrap_or_default()
}
