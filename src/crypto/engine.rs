//! Security engine
//!
//! Key preparation, mode selection and payload protection for a transfer.
//! Every decision here is a pure function of its inputs: sender and receiver
//! reach the same key and the same mode without talking to each other.

use tracing::warn;

use super::cipher::{Cipher, EncryptionMode, BLOCK_SIZE, NONCE_SIZE, TAG_SIZE};
use super::error::{CryptoError, CryptoResult};
use super::kdf::{self, DerivedKey};
use crate::network::NetworkType;

/// Payloads below this size use the small-payload row of the mode table
pub const SMALL_PAYLOAD_LIMIT: u64 = 1 << 20;

/// Payloads at or above this size use the large-payload row of the mode table
pub const LARGE_PAYLOAD_THRESHOLD: u64 = 100 << 20;

/// Default key-derivation context for file transfers
pub const DEFAULT_CONTEXT: &str = "passage file transfer";

/// How strongly a ciphertext's integrity can be established
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IntegrityLevel {
    /// AEAD mode: a successful decryption proves authenticity
    Authenticated,
    /// CBC: only block alignment was checked; tampering can go unnoticed
    StructuralOnly,
}

/// Size bracket used by the mode table
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SizeBracket {
    /// Below 1 MiB
    Small,
    /// 1 MiB up to 100 MiB
    Medium,
    /// 100 MiB and above
    Large,
}

impl SizeBracket {
    /// Bracket for a payload size in bytes
    pub fn of(size: u64) -> Self {
        if size < SMALL_PAYLOAD_LIMIT {
            SizeBracket::Small
        } else if size < LARGE_PAYLOAD_THRESHOLD {
            SizeBracket::Medium
        } else {
            SizeBracket::Large
        }
    }
}

/// Derives transfer keys and protects payloads
#[derive(Clone, Debug)]
pub struct SecurityEngine {
    context: String,
}

impl Default for SecurityEngine {
    fn default() -> Self {
        Self::new(DEFAULT_CONTEXT)
    }
}

impl SecurityEngine {
    /// Create an engine bound to a key-derivation context
    ///
    /// Peers only agree on a key if they use the same context.
    pub fn new(context: impl Into<String>) -> Self {
        SecurityEngine {
            context: context.into(),
        }
    }

    /// The key-derivation context
    pub fn context(&self) -> &str {
        &self.context
    }

    /// Stretch a transfer code into the transfer key
    pub fn strengthen_code(&self, code: &str) -> CryptoResult<DerivedKey> {
        kdf::strengthen_code(code, &self.context)
    }

    /// Pick the encryption mode for a payload
    ///
    /// Fixed lookup on (size bracket, network type). CBC is never returned;
    /// it is only used when a caller asks for it explicitly.
    pub fn select_mode(&self, payload_size: u64, network: NetworkType) -> EncryptionMode {
        use EncryptionMode::{ChaCha20Poly1305, Gcm, Hybrid};

        match (SizeBracket::of(payload_size), network) {
            (SizeBracket::Small, NetworkType::Open) => Hybrid,
            (_, NetworkType::Open) => Gcm,
            (SizeBracket::Large, NetworkType::Institutional) => ChaCha20Poly1305,
            (_, NetworkType::Institutional) => Gcm,
            (_, NetworkType::Restrictive) | (_, NetworkType::Mobile) => ChaCha20Poly1305,
        }
    }

    /// Encrypt a payload, binding `aad` for authenticated modes
    pub fn encrypt(
        &self,
        data: &[u8],
        key: &DerivedKey,
        mode: EncryptionMode,
        aad: &[u8],
    ) -> CryptoResult<Vec<u8>> {
        if !mode.is_authenticated() {
            warn!("Encrypting with {} - confidentiality only, no tamper detection", mode);
        }
        Cipher::encrypt(key.as_bytes(), mode, data, aad)
    }

    /// Decrypt a payload
    ///
    /// Authenticated modes fail with [`CryptoError::Integrity`] on any
    /// modification or wrong key.
    pub fn decrypt(
        &self,
        ciphertext: &[u8],
        key: &DerivedKey,
        mode: EncryptionMode,
        aad: &[u8],
    ) -> CryptoResult<Vec<u8>> {
        Cipher::decrypt(key.as_bytes(), mode, ciphertext, aad)
    }

    /// Structural check performed before decryption
    ///
    /// For AEAD modes this only rejects ciphertexts too short to hold the
    /// nonce and tag; the real proof is a successful [`SecurityEngine::decrypt`].
    /// For CBC it checks block alignment, which says nothing about tampering.
    pub fn verify_integrity(
        &self,
        mode: EncryptionMode,
        ciphertext: &[u8],
    ) -> CryptoResult<IntegrityLevel> {
        match mode {
            EncryptionMode::Cbc => {
                if ciphertext.len() < 2 * BLOCK_SIZE || ciphertext.len() % BLOCK_SIZE != 0 {
                    return Err(CryptoError::InvalidPadding);
                }
                Ok(IntegrityLevel::StructuralOnly)
            }
            _ => {
                let layers = if mode == EncryptionMode::Hybrid { 2 } else { 1 };
                if ciphertext.len() < layers * (NONCE_SIZE + TAG_SIZE) {
                    return Err(CryptoError::Integrity);
                }
                Ok(IntegrityLevel::Authenticated)
            }
        }
    }
}
